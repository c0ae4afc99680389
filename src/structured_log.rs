//! Append-only JSON-lines event sink
//!
//! Every record is one line of the form
//! `{"timestamp":"2024-05-01T10:00:00Z","level":"info","message":"...","context":{...}}`.
//! The same file may be written by the orchestrator and by tasks that emit their own
//! structured events, so each append happens under an exclusive advisory lock.
//!
//! The sink is a diagnostic aid only: a missing target, an unwritable directory or a
//! failed write silently drops the record and never reaches the caller.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use time::OffsetDateTime;
use time::macros::format_description;

/// Severity of a structured record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// One line of the structured log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: Level,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>, context: Option<Value>) -> Self {
        // Empty objects carry no information; leave the key out entirely.
        let context = context.filter(|ctx| match ctx {
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
            _ => true,
        });
        Self {
            timestamp: utc_timestamp(),
            level,
            message: message.into(),
            context,
        }
    }

    /// Value of `context.<key>`, if present.
    pub fn context_field(&self, key: &str) -> Option<&Value> {
        self.context.as_ref().and_then(|ctx| ctx.get(key))
    }
}

/// ISO-8601 UTC timestamp with second precision, e.g. `2024-05-01T10:00:00Z`.
pub fn utc_timestamp() -> String {
    let fmt = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    OffsetDateTime::now_utc()
        .format(fmt)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Filesystem-safe UTC stamp, e.g. `20240501T100000Z`.
pub fn compact_utc_stamp() -> String {
    let fmt = format_description!("[year][month][day]T[hour][minute][second]Z");
    OffsetDateTime::now_utc()
        .format(fmt)
        .unwrap_or_else(|_| String::from("19700101T000000Z"))
}

/// Structured log target. Cloning is cheap; every append reopens the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredLog {
    target: Option<PathBuf>,
}

impl StructuredLog {
    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { target: None }
    }

    /// A sink writing to `target`. An empty path disables the sink.
    pub fn new(target: Option<PathBuf>) -> Self {
        let target = target.filter(|path| !path.as_os_str().is_empty());
        Self { target }
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Append one record. Failures are swallowed.
    pub fn record(&self, level: Level, message: &str, context: Option<Value>) {
        let Some(target) = self.target.as_deref() else {
            return;
        };

        let record = LogRecord::new(level, message, context);
        if let Err(e) = append_record(target, &record) {
            tracing::debug!("structured log write to {} dropped: {}", target.display(), e);
        }
    }
}

fn append_record(target: &Path, record: &LogRecord) -> io::Result<()> {
    if let Some(dir) = target.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
        }
    }

    let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(target)?;
    FileExt::lock_exclusive(&file)?;
    let written = file.write_all(line.as_bytes()).and_then(|_| file.flush());
    let unlocked = FileExt::unlock(&file);
    written?;
    unlocked
}

/// Parse a structured log file, skipping blank and undecodable lines.
pub fn read_records(path: &Path) -> io::Result<Vec<LogRecord>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
