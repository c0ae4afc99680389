//! Skip-set construction for `--skip-tasks` / `MCX_SKIP_TASKS`.

use std::collections::BTreeSet;

use crate::discovery::TASK_EXTENSION;

/// Task names excluded from a run.
///
/// Every token is lowercased; both the bare token and its `.php` form are stored so
/// `05-clear-log-files` and `05-clear-log-files.php` match the same task. Tokens that
/// look like paths also contribute their basename.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipSet {
    set: BTreeSet<String>,
    display: Vec<String>,
}

impl SkipSet {
    /// Build from a comma/whitespace separated list.
    pub fn parse(raw: &str) -> Self {
        let mut skip = SkipSet::default();
        let suffix = format!(".{TASK_EXTENSION}");

        for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
            let normalized = token.trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            if !skip.display.contains(&normalized) {
                skip.display.push(normalized.clone());
            }

            let mut candidates = vec![normalized.clone()];
            if let Some(base) = normalized.rsplit('/').next() {
                if !base.is_empty() && base != normalized {
                    candidates.push(base.to_string());
                }
            }

            for candidate in candidates {
                if !candidate.ends_with(&suffix) {
                    skip.set.insert(format!("{candidate}{suffix}"));
                }
                skip.set.insert(candidate);
            }
        }

        skip
    }

    /// Exact match on an already lowercased task key.
    pub fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Tokens as the operator wrote them (lowercased, deduplicated), for logging.
    pub fn display(&self) -> &[String] {
        &self.display
    }
}
