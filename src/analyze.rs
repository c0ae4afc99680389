//! `analyze-log`: per-task summary of a structured log.
//!
//! Only `finish` and `timeout` events count towards a task's runs. Every decodable
//! line counts towards `total_events`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;

use crate::cli::{AnalyzeArgs, ReportFormat};
use crate::structured_log::utc_timestamp;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_seconds: f64,
    pub average_duration_seconds: f64,
}

impl TaskSummary {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            count: 0,
            success_count: 0,
            failure_count: 0,
            total_duration_seconds: 0.0,
            average_duration_seconds: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSummary {
    pub generated_at: String,
    pub host: String,
    pub source: String,
    pub total_events: u64,
    pub tasks: BTreeMap<String, TaskSummary>,
}

/// Looks a field up in `context` first, then at the top level of the record.
fn field<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    record
        .get("context")
        .and_then(|ctx| ctx.get(key))
        .or_else(|| record.get(key))
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Tally the records in `content`. Blank and undecodable lines are ignored.
pub fn summarize(content: &str) -> (u64, BTreeMap<String, TaskSummary>) {
    let mut total = 0;
    let mut tasks: BTreeMap<String, TaskSummary> = BTreeMap::new();

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if !record.is_object() {
            continue;
        }
        total += 1;

        let event = field(&record, "event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let timed_out = event == "timeout";
        if event != "finish" && !timed_out {
            continue;
        }
        let Some(name) = record
            .get("context")
            .and_then(|ctx| ctx.get("task"))
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
        else {
            continue;
        };

        let entry = tasks
            .entry(name.to_string())
            .or_insert_with(|| TaskSummary::new(name));
        entry.count += 1;

        let exit_code = as_number(field(&record, "exit_code")).map_or(0, |c| c as i64);
        if exit_code == 0 && !timed_out {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }

        if let Some(duration) = as_number(field(&record, "duration_seconds")) {
            entry.total_duration_seconds += duration;
        }
    }

    for entry in tasks.values_mut() {
        entry.average_duration_seconds = entry.total_duration_seconds / entry.count.max(1) as f64;
    }

    (total, tasks)
}

/// Read and summarise the log at `input`.
pub fn analyze(input: &Path) -> Result<LogSummary> {
    if !input.is_file() {
        bail!("Input file '{}' not found.", input.display());
    }
    let content = fs::read_to_string(input)
        .with_context(|| format!("Unable to open '{}' for reading.", input.display()))?;
    let (total_events, tasks) = summarize(&content);

    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source = fs::canonicalize(input)
        .unwrap_or_else(|_| input.to_path_buf())
        .display()
        .to_string();

    Ok(LogSummary {
        generated_at: utc_timestamp(),
        host,
        source,
        total_events,
        tasks,
    })
}

pub fn render_json(summary: &LogSummary) -> Result<String> {
    let mut json = serde_json::to_string_pretty(summary).context("Failed to encode summary")?;
    json.push('\n');
    Ok(json)
}

pub fn render_table(summary: &LogSummary) -> String {
    let header = format!(
        "{:<30} {:>8} {:>8} {:>8} {:>12}",
        "Task", "Runs", "OK", "Fail", "Avg (s)"
    );
    let mut out = format!("{header}\n{}\n", "-".repeat(header.len()));
    for task in summary.tasks.values() {
        let _ = writeln!(
            out,
            "{:<30} {:>8} {:>8} {:>8} {:>12.3}",
            task.name,
            task.count,
            task.success_count,
            task.failure_count,
            task.average_duration_seconds
        );
    }
    out
}

/// Entry point for the `analyze-log` subcommand.
pub fn run(args: &AnalyzeArgs) -> Result<()> {
    let summary = analyze(&args.input)?;
    let rendered = match args.format {
        ReportFormat::Json => render_json(&summary)?,
        ReportFormat::Table => render_table(&summary),
    };

    match &args.output {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("Unable to write output to '{}'.", path.display()))?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(rendered.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}
