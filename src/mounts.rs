//! Mount specification builder.
//!
//! Mount declarations arrive in three shapes: repeated `--mount=MOUNT,DEVICE[,TYPE[,OPTS]]`
//! flags, a JSON array in `MCX_MOUNT_SPEC`, or the legacy root/home/boot/swap device
//! variables. All of them are lowered to [`MountRecord`]s and normalized into
//! [`MountEntry`] values.
//!
//! # Invariants
//!
//! - Non-swap mounts are absolute paths.
//! - At most one entry per mount path; the first occurrence wins.
//! - Swap entries always normalize to mount `none` with pass 0.
//! - Normalizing an already-normalized list is a no-op.
//! - A usable specification contains exactly one `/` entry ([`require_root`]).
//!
//! The JSON encoding keeps the flat field names (`mount`, `original_mount`, `device`,
//! `type`, `options`, `dump`, `pass`, `is_swap`) that downstream tasks read.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::error::{ProvisionError, Result};
use crate::events::EventLogger;

pub const ROOT_MOUNT: &str = "/";
pub const SWAP_MOUNT: &str = "none";

/// Legacy device defaults applied when neither CLI nor environment names a device.
pub const DEFAULT_ROOT_DEVICE: &str = "/dev/nvme0n1p2";
pub const DEFAULT_BOOT_DEVICE: &str = "/dev/md1";
pub const DEFAULT_SWAP_DEVICE: &str = "/dev/nvme0n1p1";

/// Legacy environment variables mirrored from the normalized specification.
pub const LEGACY_DEVICE_VARS: [&str; 4] = ["ROOT_DEVICE", "HOME_DEVICE", "BOOT_DEVICE", "SWAP_DEVICE"];

/// A mount declaration as supplied by the caller, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub original_mount: Option<String>,
    #[serde(default)]
    pub device: String,
    #[serde(default, rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub dump: Option<u32>,
    #[serde(default)]
    pub pass: Option<u32>,
    #[serde(default)]
    pub is_swap: bool,
}

impl MountRecord {
    pub fn new(mount: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            device: device.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = fs_type.into();
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    /// Swap is detected from the mount as originally given, not the normalized one.
    pub fn declares_swap(&self) -> bool {
        let original = self.original_mount.as_deref().unwrap_or(&self.mount);
        self.is_swap || original.trim().eq_ignore_ascii_case("swap")
    }
}

/// Reasons a `--mount` value is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountOptionError {
    #[error("requires at least mountpoint and device")]
    TooFewFields,
    #[error("empty mountpoint or device")]
    EmptyField,
}

impl FromStr for MountRecord {
    type Err = MountOptionError;

    /// Parse `MOUNT,DEVICE[,TYPE[,OPTIONS]]`. Fields are trimmed; anything after the
    /// fourth comma is ignored.
    fn from_str(spec: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.split(',').map(str::trim).collect();
        if parts.len() < 2 {
            return Err(MountOptionError::TooFewFields);
        }
        let (mount, device) = (parts[0], parts[1]);
        if mount.is_empty() || device.is_empty() {
            return Err(MountOptionError::EmptyField);
        }

        Ok(MountRecord::new(mount, device)
            .with_type(parts.get(2).copied().unwrap_or_default())
            .with_options(parts.get(3).copied().unwrap_or_default()))
    }
}

/// Why a single record cannot become a [`MountEntry`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountRejection {
    #[error("mountpoint '{0}' is not absolute")]
    RelativeMount(String),
    #[error("no device given for mountpoint '{0}'")]
    MissingDevice(String),
}

/// A normalized filesystem mount or swap device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "MountRecord", try_from = "MountRecord")]
pub enum MountEntry {
    Regular {
        mount: String,
        device: String,
        fs_type: String,
        options: String,
        dump: u32,
        pass: u32,
    },
    Swap {
        /// `swap` as the caller spelled it.
        original_mount: String,
        device: String,
        fs_type: String,
        options: String,
        dump: u32,
    },
}

impl MountEntry {
    pub fn mount(&self) -> &str {
        match self {
            MountEntry::Regular { mount, .. } => mount,
            MountEntry::Swap { .. } => SWAP_MOUNT,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            MountEntry::Regular { device, .. } | MountEntry::Swap { device, .. } => device,
        }
    }

    pub fn fs_type(&self) -> &str {
        match self {
            MountEntry::Regular { fs_type, .. } | MountEntry::Swap { fs_type, .. } => fs_type,
        }
    }

    pub fn options(&self) -> &str {
        match self {
            MountEntry::Regular { options, .. } | MountEntry::Swap { options, .. } => options,
        }
    }

    pub fn dump(&self) -> u32 {
        match self {
            MountEntry::Regular { dump, .. } | MountEntry::Swap { dump, .. } => *dump,
        }
    }

    pub fn pass(&self) -> u32 {
        match self {
            MountEntry::Regular { pass, .. } => *pass,
            MountEntry::Swap { .. } => 0,
        }
    }

    pub fn is_swap(&self) -> bool {
        matches!(self, MountEntry::Swap { .. })
    }

    pub fn is_root(&self) -> bool {
        !self.is_swap() && self.mount() == ROOT_MOUNT
    }
}

impl fmt::Display for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.device(),
            self.mount(),
            self.fs_type(),
            self.options(),
            self.dump(),
            self.pass()
        )
    }
}

impl TryFrom<MountRecord> for MountEntry {
    type Error = MountRejection;

    /// Apply defaults to one record. Duplicate detection needs the whole list and
    /// lives in [`normalize`].
    fn try_from(record: MountRecord) -> std::result::Result<Self, Self::Error> {
        let device = record.device.trim().to_string();

        if record.declares_swap() {
            if device.is_empty() {
                return Err(MountRejection::MissingDevice("swap".into()));
            }
            let original_mount = [record.original_mount.as_deref(), Some(record.mount.as_str())]
                .into_iter()
                .flatten()
                .map(str::trim)
                .find(|m| m.eq_ignore_ascii_case("swap"))
                .unwrap_or("swap")
                .to_string();
            return Ok(MountEntry::Swap {
                original_mount,
                device,
                fs_type: non_empty_or(&record.fs_type, "swap"),
                options: non_empty_or(&record.options, "sw"),
                dump: record.dump.unwrap_or(0),
            });
        }

        let mount = record.mount.trim().to_string();
        if !mount.starts_with('/') {
            return Err(MountRejection::RelativeMount(mount));
        }
        if device.is_empty() {
            return Err(MountRejection::MissingDevice(mount));
        }

        let is_root = mount == ROOT_MOUNT;
        let default_options = if is_root { "errors=remount-ro" } else { "defaults" };
        Ok(MountEntry::Regular {
            fs_type: non_empty_or(&record.fs_type, "ext4"),
            options: non_empty_or(&record.options, default_options),
            dump: record.dump.unwrap_or(0),
            pass: record.pass.unwrap_or(if is_root { 1 } else { 2 }),
            mount,
            device,
        })
    }
}

impl From<MountEntry> for MountRecord {
    fn from(entry: MountEntry) -> Self {
        match entry {
            MountEntry::Regular {
                mount,
                device,
                fs_type,
                options,
                dump,
                pass,
            } => MountRecord {
                original_mount: Some(mount.clone()),
                mount,
                device,
                fs_type,
                options,
                dump: Some(dump),
                pass: Some(pass),
                is_swap: false,
            },
            MountEntry::Swap {
                original_mount,
                device,
                fs_type,
                options,
                dump,
            } => MountRecord {
                mount: SWAP_MOUNT.into(),
                original_mount: Some(original_mount),
                device,
                fs_type,
                options,
                dump: Some(dump),
                pass: Some(0),
                is_swap: true,
            },
        }
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Normalize raw records: apply defaults, drop invalid entries and duplicates.
/// Every dropped record produces a warning.
pub fn normalize<I>(records: I, events: &EventLogger) -> Vec<MountEntry>
where
    I: IntoIterator<Item = MountRecord>,
{
    let mut normalized = Vec::new();
    let mut seen: HashMap<String, String> = HashMap::new();

    for record in records {
        let raw_mount = record.mount.clone();
        let raw_device = record.device.clone();
        let entry = match MountEntry::try_from(record) {
            Ok(entry) => entry,
            Err(reason) => {
                events.warn(
                    "Ignoring mount definition without absolute mountpoint or device.",
                    Some(json!({
                        "mount": raw_mount,
                        "device": raw_device,
                        "reason": reason.to_string(),
                    })),
                );
                continue;
            }
        };

        if !entry.is_swap() {
            if let Some(existing) = seen.get(entry.mount()) {
                events.warn(
                    "Duplicate mount definition detected; using the first entry.",
                    Some(json!({
                        "mount": entry.mount(),
                        "existing_device": existing,
                        "duplicate_device": entry.device(),
                    })),
                );
                continue;
            }
            seen.insert(entry.mount().to_string(), entry.device().to_string());
        }

        normalized.push(entry);
    }

    normalized
}

/// Re-run normalization over already-normalized entries.
pub fn renormalize(entries: &[MountEntry], events: &EventLogger) -> Vec<MountEntry> {
    normalize(entries.iter().cloned().map(MountRecord::from), events)
}

/// Fail unless the specification contains exactly one root mount.
pub fn require_root(entries: &[MountEntry]) -> Result<()> {
    match entries.iter().filter(|entry| entry.is_root()).count() {
        1 => Ok(()),
        0 => Err(ProvisionError::MissingRootMount),
        n => Err(ProvisionError::config(format!(
            "mount specification contains {n} root (/) entries"
        ))),
    }
}

/// Devices for the legacy root/home/boot/swap specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyDevices {
    pub root: Option<String>,
    /// `None` when unset or explicitly omitted.
    pub home: Option<String>,
    pub boot: Option<String>,
    pub swap: Option<String>,
}

impl LegacyDevices {
    /// Records for the legacy layout, falling back to the built-in device defaults.
    pub fn records(&self) -> Vec<MountRecord> {
        let pick = |value: &Option<String>, default: &str| -> String {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        let mut records = vec![
            MountRecord::new(ROOT_MOUNT, pick(&self.root, DEFAULT_ROOT_DEVICE))
                .with_type("ext4")
                .with_options("errors=remount-ro"),
        ];

        if let Some(home) = self
            .home
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("omit"))
        {
            records.push(MountRecord::new("/home", home).with_type("ext4").with_options("defaults"));
        }

        records.push(
            MountRecord::new("/boot", pick(&self.boot, DEFAULT_BOOT_DEVICE))
                .with_type("ext4")
                .with_options("defaults"),
        );
        records.push(
            MountRecord::new("swap", pick(&self.swap, DEFAULT_SWAP_DEVICE))
                .with_type("swap")
                .with_options("sw"),
        );
        records
    }
}

/// Encode entries in the `MCX_MOUNT_SPEC` wire shape.
pub fn encode_spec(entries: &[MountEntry]) -> Result<String> {
    Ok(serde_json::to_string(entries)?)
}

/// Decode an `MCX_MOUNT_SPEC` value into raw records; normalization is up to the caller.
pub fn decode_spec(raw: &str) -> Result<Vec<MountRecord>> {
    Ok(serde_json::from_str(raw)?)
}

/// Legacy device variables derived from the specification. Variables mapped to
/// `None` have no matching mount and must be absent from the task environment.
pub fn legacy_device_env(entries: &[MountEntry]) -> Vec<(&'static str, Option<String>)> {
    let mut values: [Option<String>; 4] = Default::default();

    for entry in entries {
        let slot = match (entry.is_swap(), entry.mount()) {
            (true, _) => 3,
            (false, "/") => 0,
            (false, "/home") => 1,
            (false, "/boot") => 2,
            _ => continue,
        };
        values[slot] = Some(entry.device().to_string());
    }

    LEGACY_DEVICE_VARS.into_iter().zip(values).collect()
}
