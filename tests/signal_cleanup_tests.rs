//! Signal handling of the real binary.
//!
//! An interrupted orchestrator must take the running task's whole process group
//! down with it and exit with `128 + signal`.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

fn is_process_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }
    true
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn write_task(root: &Path, body: &str) {
    let tasks = root.join("distros/debian/common/tasks");
    fs::create_dir_all(&tasks).unwrap();
    fs::write(tasks.join("10-hang.php"), body).unwrap();
}

#[test]
fn test_sigterm_stops_running_task_tree() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    write_task(
        dir.path(),
        &format!("sleep 1000 &\necho $! > '{}'\nwait\n", pid_file.display()),
    );

    let mut orchestrator = Command::new(env!("CARGO_BIN_EXE_mcx-configure"))
        .arg(format!("--template-root={}", dir.path().display()))
        .args(["--distro=debian", "--version=12", "--interpreter=/bin/sh"])
        .env("MCX_SKIP_ROOT_CHECK", "1")
        .env_remove("MCX_STRUCTURED_LOG")
        .env_remove("MCX_LOG_DIR")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || fs::read_to_string(&pid_file)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)),
        "task never started"
    );
    let helper: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(is_process_alive(helper));

    kill(Pid::from_raw(orchestrator.id() as i32), Signal::SIGTERM).unwrap();

    let status = orchestrator.wait().unwrap();
    assert_eq!(status.code(), Some(128 + Signal::SIGTERM as i32));
    assert!(
        wait_for(Duration::from_secs(5), || !is_process_alive(helper)),
        "helper process survived the orchestrator"
    );
}

#[test]
fn test_analyze_log_subcommand() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("structured.log");
    fs::write(
        &input,
        r#"{"timestamp":"2026-01-01T00:00:00Z","level":"info","message":"ok","context":{"event":"finish","task":"10-a.php","exit_code":0,"duration_seconds":2}}
"#,
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_mcx-configure"))
        .args(["analyze-log", "--format", "table", "--input"])
        .arg(&input)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("10-a.php"));
    assert!(stdout.contains("2.000"));

    let missing = Command::new(env!("CARGO_BIN_EXE_mcx-configure"))
        .args(["analyze-log", "--input", "/nonexistent/structured.log"])
        .output()
        .unwrap();
    assert_eq!(missing.status.code(), Some(1));
}

#[test]
fn test_unknown_options_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    write_task(dir.path(), "exit 0\n");

    let status = Command::new(env!("CARGO_BIN_EXE_mcx-configure"))
        .arg(format!("--template-root={}", dir.path().display()))
        .args([
            "--distro=debian",
            "--interpreter=/bin/sh",
            "--no-such-flag",
            "--colour",
            "blue",
            "--hostname",
            "--dry-run",
        ])
        .env("MCX_SKIP_ROOT_CHECK", "1")
        .env_remove("MCX_STRUCTURED_LOG")
        .env_remove("MCX_LOG_DIR")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());
}
