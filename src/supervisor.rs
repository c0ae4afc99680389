//! Sequential execution of discovered tasks.
//!
//! Each task moves through exactly one of:
//!
//! ```text
//! Discovered -> Skipped(skip list | missing | unsupported | precondition)
//!            -> DryRun
//!            -> Running -> Finished | TimedOut
//!            -> LaunchFailed
//! ```
//!
//! Nothing a task does can fail the run. Every transition is reported through the
//! [`EventLogger`] so the structured log carries a replayable trail.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde_json::{Map, Value, json};
use strum::Display;

use crate::config::RunContext;
use crate::discovery::TaskDescriptor;
use crate::events::EventLogger;
use crate::preconditions::{CommandLocator, PreconditionFailure, PreconditionTable};
use crate::process_guard::{self, CommandProcessGroup, DEFAULT_GRACE};
use crate::structured_log::compact_utc_stamp;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const CHUNK_SIZE: usize = 8192;

/// Why a task did not run.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum SkipReason {
    #[strum(serialize = "skip-list")]
    Disabled,
    #[strum(serialize = "missing")]
    Missing,
    #[strum(serialize = "unsupported-type")]
    UnsupportedType,
    #[strum(serialize = "precondition")]
    Precondition(PreconditionFailure),
}

/// Terminal state of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Skipped(SkipReason),
    DryRun,
    LaunchFailed { error: String },
    Finished { exit_code: i32, duration_seconds: f64 },
    TimedOut { duration_seconds: f64 },
}

/// Per-outcome tallies for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub discovered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub launch_failed: usize,
    pub skipped: usize,
    pub dry_run: usize,
}

impl RunReport {
    pub fn record(&mut self, outcome: &TaskOutcome) {
        self.discovered += 1;
        match outcome {
            TaskOutcome::Skipped(_) => self.skipped += 1,
            TaskOutcome::DryRun => self.dry_run += 1,
            TaskOutcome::LaunchFailed { .. } => self.launch_failed += 1,
            TaskOutcome::Finished { exit_code: 0, .. } => self.succeeded += 1,
            TaskOutcome::Finished { .. } => self.failed += 1,
            TaskOutcome::TimedOut { .. } => self.timed_out += 1,
        }
    }

    /// Tasks that ran into trouble (non-zero exit, timeout, launch failure).
    pub fn problems(&self) -> usize {
        self.failed + self.timed_out + self.launch_failed
    }

    pub fn to_context(&self) -> Value {
        json!({
            "event": "summary",
            "discovered": self.discovered,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "timed_out": self.timed_out,
            "launch_failed": self.launch_failed,
            "skipped": self.skipped,
            "dry_run": self.dry_run,
        })
    }
}

/// Drives tasks one at a time against a resolved [`RunContext`].
pub struct Supervisor<'a> {
    ctx: &'a RunContext,
    events: &'a EventLogger,
    preconditions: &'a PreconditionTable,
    locator: &'a dyn CommandLocator,
    run_stamp: String,
    sequence: usize,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        ctx: &'a RunContext,
        events: &'a EventLogger,
        preconditions: &'a PreconditionTable,
        locator: &'a dyn CommandLocator,
    ) -> Self {
        Self {
            ctx,
            events,
            preconditions,
            locator,
            run_stamp: compact_utc_stamp(),
            sequence: 0,
        }
    }

    pub fn run_all(&mut self, tasks: &[TaskDescriptor]) -> RunReport {
        let mut report = RunReport::default();
        for task in tasks {
            let outcome = self.run_task(task);
            report.record(&outcome);
        }
        report
    }

    pub fn run_task(&mut self, task: &TaskDescriptor) -> TaskOutcome {
        if let Some(reason) = self.skip_reason(task) {
            self.report_skip(task, &reason);
            return TaskOutcome::Skipped(reason);
        }

        if self.ctx.dry_run {
            self.events.info(
                &format!("[dry-run] Would execute {}", task.name),
                Some(task_context(task, "dry-run", [("command", json!(self.command_line(task)))])),
            );
            return TaskOutcome::DryRun;
        }

        self.execute(task)
    }

    fn skip_reason(&self, task: &TaskDescriptor) -> Option<SkipReason> {
        if self.ctx.skip.contains(&task.key) {
            return Some(SkipReason::Disabled);
        }
        if !task.path.is_file() {
            return Some(SkipReason::Missing);
        }
        if !task.has_task_extension() {
            return Some(SkipReason::UnsupportedType);
        }
        self.preconditions
            .evaluate(&task.key, self.ctx.task_environment(), self.locator)
            .err()
            .map(SkipReason::Precondition)
    }

    fn report_skip(&self, task: &TaskDescriptor, reason: &SkipReason) {
        let mut ctx = task_context(task, "skip", [("reason", json!(reason.to_string()))]);
        match reason {
            SkipReason::Disabled => {
                self.events
                    .info(&format!("Skipping {}; disabled via skip list.", task.name), Some(ctx));
            }
            SkipReason::Missing => {
                self.events
                    .warn(&format!("Skipping {}; file is missing.", task.name), Some(ctx));
            }
            SkipReason::UnsupportedType => {
                self.events
                    .warn(&format!("Skipping {}; unsupported task type.", task.name), Some(ctx));
            }
            SkipReason::Precondition(failure) => {
                if let Value::Object(map) = &mut ctx {
                    map.insert("precondition".into(), json!(failure.kind()));
                    map.insert(failure.subject_key().into(), json!(failure.subject()));
                }
                self.events.info(
                    &format!("Skipping {}; precondition not met: {}.", task.name, failure),
                    Some(ctx),
                );
            }
        }
    }

    fn command_line(&self, task: &TaskDescriptor) -> String {
        format!("{} {}", self.ctx.interpreter, task.path.display())
    }

    fn execute(&mut self, task: &TaskDescriptor) -> TaskOutcome {
        self.sequence += 1;
        let log_path = self.task_log_path(task);
        let log_file = log_path.as_ref().and_then(|path| self.open_task_log(task, path));
        let log_value = match (&log_path, &log_file) {
            (Some(path), Some(_)) => json!(path.display().to_string()),
            _ => Value::Null,
        };

        self.events.info(
            &format!("Running {}", task.name),
            Some(task_context(
                task,
                "start",
                [("command", json!(self.command_line(task))), ("log_file", log_value.clone())],
            )),
        );

        let started = Instant::now();
        let mut child = match Command::new(&self.ctx.interpreter)
            .arg(&task.path)
            .current_dir(task.directory())
            .env_clear()
            .envs(self.ctx.task_environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.events.warn(
                    &format!("Failed to launch task {}: {}", task.name, e),
                    Some(task_context(
                        task,
                        "launch-failed",
                        [
                            ("command", json!(self.command_line(task))),
                            ("error", json!(e.to_string())),
                        ],
                    )),
                );
                return TaskOutcome::LaunchFailed {
                    error: e.to_string(),
                };
            }
        };

        let pid = child.id();
        process_guard::register_global(pid);

        let sink = Arc::new(Mutex::new(log_file));
        let readers = spawn_readers(&mut child, &sink);

        let waited = wait_with_deadline(&mut child, self.ctx.task_timeout);

        for reader in readers {
            if reader.join().is_err() {
                tracing::debug!("Output reader for {} panicked", task.name);
            }
        }
        process_guard::unregister_global(pid);

        let duration_seconds = round_seconds(started.elapsed());

        match waited {
            Waited::Exited(status) => {
                let exit_code = exit_code(status);
                let ctx = task_context(
                    task,
                    "finish",
                    [
                        ("exit_code", json!(exit_code)),
                        ("duration_seconds", json!(duration_seconds)),
                        ("log_file", log_value),
                    ],
                );
                if exit_code == 0 {
                    self.events.info(
                        &format!("Task {} completed in {:.3}s.", task.name, duration_seconds),
                        Some(ctx),
                    );
                } else {
                    self.events.warn(
                        &format!("Task {} exited with status {}.", task.name, exit_code),
                        Some(ctx),
                    );
                }
                TaskOutcome::Finished {
                    exit_code,
                    duration_seconds,
                }
            }
            Waited::TimedOut(status) => {
                let limit = self.ctx.task_timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                self.events.warn(
                    &format!("Task {} exceeded {}s and was terminated.", task.name, limit),
                    Some(task_context(
                        task,
                        "timeout",
                        [
                            ("exit_code", status.map(exit_code).map_or(Value::Null, |c| json!(c))),
                            ("duration_seconds", json!(duration_seconds)),
                            ("timeout_seconds", json!(limit)),
                            ("log_file", log_value),
                        ],
                    )),
                );
                TaskOutcome::TimedOut { duration_seconds }
            }
            Waited::Failed(e) => {
                self.events.warn(
                    &format!("Lost track of task {}: {}", task.name, e),
                    Some(task_context(
                        task,
                        "finish",
                        [
                            ("exit_code", json!(-1)),
                            ("duration_seconds", json!(duration_seconds)),
                            ("error", json!(e.to_string())),
                        ],
                    )),
                );
                TaskOutcome::Finished {
                    exit_code: -1,
                    duration_seconds,
                }
            }
        }
    }

    fn task_log_path(&self, task: &TaskDescriptor) -> Option<PathBuf> {
        let dir = self.ctx.log_dir.as_ref()?;
        Some(dir.join(format!(
            "{}-{}-{:03}-{}.log",
            self.run_stamp,
            std::process::id(),
            self.sequence,
            task.name
        )))
    }

    fn open_task_log(&self, task: &TaskDescriptor, path: &Path) -> Option<File> {
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(path));
        match opened {
            Ok(file) => Some(file),
            Err(e) => {
                self.events.warn(
                    &format!("Unable to open log file {} for {}: {}", path.display(), task.name, e),
                    Some(json!({ "task": task.name, "path": path.display().to_string() })),
                );
                None
            }
        }
    }
}

fn task_context<const N: usize>(
    task: &TaskDescriptor,
    event: &str,
    extra: [(&str, Value); N],
) -> Value {
    let mut map = Map::new();
    map.insert("event".into(), json!(event));
    map.insert("task".into(), json!(task.name));
    map.insert("path".into(), json!(task.path.display().to_string()));
    for (key, value) in extra {
        if !value.is_null() {
            map.insert(key.into(), value);
        }
    }
    Value::Object(map)
}

fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

/// Exit status as a shell would report it: `128 + signal` for signalled children.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type TaskLog = Arc<Mutex<Option<File>>>;

/// One thread per pipe so a full stderr can never stall stdout, or the reverse.
fn spawn_readers(child: &mut Child, sink: &TaskLog) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(pump(out, Stream::Stdout, Arc::clone(sink)));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(pump(err, Stream::Stderr, Arc::clone(sink)));
    }
    readers
}

fn pump<R>(mut reader: R, stream: Stream, sink: TaskLog) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("Task {:?} pipe read failed: {}", stream, e);
                    break;
                }
            };
            let chunk = &buf[..n];

            let _ = match stream {
                Stream::Stdout => write_console(io::stdout().lock(), chunk),
                Stream::Stderr => write_console(io::stderr().lock(), chunk),
            };

            if let Ok(mut guard) = sink.lock() {
                if let Some(file) = guard.as_mut() {
                    if let Err(e) = file.write_all(chunk) {
                        tracing::debug!("Task log write failed: {}", e);
                        *guard = None;
                    }
                }
            }
        }
    })
}

fn write_console(mut out: impl Write, chunk: &[u8]) -> io::Result<()> {
    out.write_all(chunk)?;
    out.flush()
}

enum Waited {
    Exited(ExitStatus),
    /// Killed after the deadline; the status is absent if reaping failed.
    TimedOut(Option<ExitStatus>),
    Failed(io::Error),
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Waited {
    let Some(limit) = timeout else {
        return match child.wait() {
            Ok(status) => Waited::Exited(status),
            Err(e) => Waited::Failed(e),
        };
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Waited::Exited(status),
            Ok(None) => {}
            Err(e) => return Waited::Failed(e),
        }
        if started.elapsed() >= limit {
            return Waited::TimedOut(stop_group(child, DEFAULT_GRACE));
        }
        let remaining = limit.saturating_sub(started.elapsed());
        thread::sleep(POLL_INTERVAL.min(remaining).max(Duration::from_millis(10)));
    }
}

/// SIGTERM the task's process group, SIGKILL it after `grace`, then reap.
fn stop_group(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    if let Err(e) = process_guard::signal_group(pid, Signal::SIGTERM) {
        tracing::debug!("SIGTERM to task group {} failed: {}", pid, e);
    }

    let started = Instant::now();
    while started.elapsed() < grace {
        if let Ok(Some(status)) = child.try_wait() {
            // Stragglers left in the group would keep the output pipes open.
            let _ = process_guard::signal_group(pid, Signal::SIGKILL);
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }

    if let Err(e) = process_guard::signal_group(pid, Signal::SIGKILL) {
        tracing::debug!("SIGKILL to task group {} failed: {}", pid, e);
    }
    child.wait().ok()
}
