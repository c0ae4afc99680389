//! Minimal `/etc/os-release` reader used for distro detection.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_OS_RELEASE: &str = "/etc/os-release";

/// Parsed `KEY=VALUE` pairs. Quotes around values are stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    fields: HashMap<String, String>,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let fields = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
            .collect();
        Self { fields }
    }

    /// Read and parse a file. Absent or unreadable files yield `None`.
    pub fn load(path: &Path) -> Option<Self> {
        fs::read_to_string(path).ok().map(|content| Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn id(&self) -> Option<&str> {
        self.get("ID")
    }

    /// `VERSION_ID`, falling back to `VERSION_CODENAME`.
    pub fn version(&self) -> Option<&str> {
        self.get("VERSION_ID").or_else(|| self.get("VERSION_CODENAME"))
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Fill whichever of `id`/`version` is still empty from os-release metadata.
pub fn detect_distro(
    current_id: Option<String>,
    current_version: Option<String>,
    os_release: &Path,
) -> (Option<String>, Option<String>) {
    if current_id.is_some() && current_version.is_some() {
        return (current_id, current_version);
    }

    let Some(release) = OsRelease::load(os_release) else {
        return (current_id, current_version);
    };

    let id = current_id.or_else(|| release.id().map(str::to_string));
    let version = current_version.or_else(|| release.version().map(str::to_string));
    (id, version)
}

/// Keep only the leading dot-delimited segment, lowercased (`"11.7"` → `"11"`).
pub fn major_version(version: &str) -> Option<String> {
    let version = version.trim();
    if version.is_empty() {
        return None;
    }
    let major = version.split('.').next().unwrap_or_default().trim();
    if major.is_empty() {
        Some(version.to_lowercase())
    } else {
        Some(major.to_lowercase())
    }
}
