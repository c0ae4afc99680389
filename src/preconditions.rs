//! Declarative gates deciding whether a task is eligible to run.
//!
//! Entries are keyed by lowercased task basename. A task without an entry always
//! runs. Checks run in declaration order and evaluation stops at the first failure.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::events::EventLogger;

/// File name, under the distros root, of the optional override table.
pub const PRECONDITIONS_FILE: &str = "task_preconditions.json";

/// A single gate, in the `{"type": ..., "value": ...}` shape used on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Precondition {
    /// Binary must be resolvable on the task's `PATH`.
    Command(String),
    /// Variable must be set to a non-blank value.
    Env(String),
    /// At least one of the variables must be set to a non-blank value.
    EnvAny(Vec<String>),
}

/// Why a task was held back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionFailure {
    MissingCommand(String),
    MissingEnv(String),
    MissingEnvAny(Vec<String>),
}

impl PreconditionFailure {
    /// Short tag used in structured event contexts.
    pub fn kind(&self) -> &'static str {
        match self {
            PreconditionFailure::MissingCommand(_) => "command",
            PreconditionFailure::MissingEnv(_) => "env",
            PreconditionFailure::MissingEnvAny(_) => "env_any",
        }
    }

    /// The offending command or variable name(s).
    pub fn subject(&self) -> String {
        match self {
            PreconditionFailure::MissingCommand(name) | PreconditionFailure::MissingEnv(name) => {
                name.clone()
            }
            PreconditionFailure::MissingEnvAny(names) => names.join(","),
        }
    }

    /// Context key naming the subject: `command` or `variable`.
    pub fn subject_key(&self) -> &'static str {
        match self {
            PreconditionFailure::MissingCommand(_) => "command",
            _ => "variable",
        }
    }
}

impl fmt::Display for PreconditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionFailure::MissingCommand(name) => write!(f, "command '{name}' not found"),
            PreconditionFailure::MissingEnv(name) => {
                write!(f, "environment variable {name} is not set")
            }
            PreconditionFailure::MissingEnvAny(names) => {
                write!(f, "none of {} is set", names.join(", "))
            }
        }
    }
}

/// Answers whether a command can be executed.
pub trait CommandLocator {
    fn resolve(&self, name: &str) -> bool;
}

impl<F> CommandLocator for F
where
    F: Fn(&str) -> bool,
{
    fn resolve(&self, name: &str) -> bool {
        self(name)
    }
}

/// Resolves commands against an explicit `PATH` value.
#[derive(Debug, Clone)]
pub struct PathLocator {
    path: Option<OsString>,
    cwd: PathBuf,
}

impl PathLocator {
    pub fn new(path: Option<impl Into<OsString>>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            path: path.map(Into::into),
            cwd: cwd.into(),
        }
    }

    /// Use the `PATH` of the environment a task will receive.
    pub fn for_environment(env: &BTreeMap<String, String>) -> Self {
        Self::new(env.get("PATH").cloned(), "/")
    }
}

impl CommandLocator for PathLocator {
    fn resolve(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        which::which_in(name, self.path.as_ref(), &self.cwd).is_ok()
    }
}

impl Precondition {
    pub fn check(
        &self,
        env: &BTreeMap<String, String>,
        locator: &dyn CommandLocator,
    ) -> std::result::Result<(), PreconditionFailure> {
        match self {
            Precondition::Command(name) => {
                if locator.resolve(name) {
                    Ok(())
                } else {
                    Err(PreconditionFailure::MissingCommand(name.clone()))
                }
            }
            Precondition::Env(name) => {
                if is_set(env, name) {
                    Ok(())
                } else {
                    Err(PreconditionFailure::MissingEnv(name.clone()))
                }
            }
            Precondition::EnvAny(names) => {
                if names.iter().any(|name| is_set(env, name)) {
                    Ok(())
                } else {
                    Err(PreconditionFailure::MissingEnvAny(names.clone()))
                }
            }
        }
    }
}

fn is_set(env: &BTreeMap<String, String>, name: &str) -> bool {
    env.get(name).is_some_and(|value| !value.trim().is_empty())
}

/// Task key to gates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreconditionTable {
    entries: BTreeMap<String, Vec<Precondition>>,
}

impl PreconditionTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Gates shipped with the stock task tree.
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.insert(
            "32-capture-mdadm.php",
            vec![Precondition::Command("mdadm".into())],
        );
        table.insert(
            "24-fetch-ssh-keys.php",
            vec![Precondition::Env("MCX_SSH_KEYS_URI".into())],
        );
        table
    }

    /// Parse a JSON table: `{"task.php": [{"type": "command", "value": "mdadm"}]}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, Vec<Precondition>> = serde_json::from_str(raw)?;
        let mut table = Self::default();
        for (key, gates) in parsed {
            table.insert(&key, gates);
        }
        Ok(table)
    }

    /// Built-in gates, overridden per task by `<distros_root>/task_preconditions.json`
    /// when that file exists. A broken file is reported and ignored.
    pub fn load(distros_root: &Path, events: &EventLogger) -> Self {
        let mut table = Self::builtin();
        let path = distros_root.join(PRECONDITIONS_FILE);
        if !path.is_file() {
            return table;
        }

        match fs::read_to_string(&path)
            .map_err(Into::into)
            .and_then(|raw| Self::from_json(&raw))
        {
            Ok(overrides) => {
                tracing::debug!(
                    "Loaded {} precondition override(s) from {}",
                    overrides.len(),
                    path.display()
                );
                table.merge(overrides);
            }
            Err(e) => events.warn(
                &format!("Ignoring precondition table {}: {}", path.display(), e),
                Some(json!({ "path": path.display().to_string() })),
            ),
        }
        table
    }

    pub fn insert(&mut self, task: &str, gates: Vec<Precondition>) {
        self.entries.insert(task.trim().to_lowercase(), gates);
    }

    /// Entries in `other` replace same-named entries here.
    pub fn merge(&mut self, other: PreconditionTable) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, key: &str) -> Option<&[Precondition]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every gate for `key` in order, stopping at the first failure.
    pub fn evaluate(
        &self,
        key: &str,
        env: &BTreeMap<String, String>,
        locator: &dyn CommandLocator,
    ) -> std::result::Result<(), PreconditionFailure> {
        let Some(gates) = self.get(key) else {
            return Ok(());
        };
        gates.iter().try_for_each(|gate| gate.check(env, locator))
    }
}
