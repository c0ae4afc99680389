//! End-to-end runs against throwaway task trees.
//!
//! Tasks are shell scripts with the `.php` extension, executed through `/bin/sh`
//! via `--interpreter`, so no PHP runtime is needed.

use std::fs;
use std::path::{Path, PathBuf};

use mcx_configure::cli::{ConfigureArgs, SanitizedArgs, sanitize_args};
use mcx_configure::config::EnvSnapshot;
use mcx_configure::events::EventLogger;
use mcx_configure::orchestrator;
use mcx_configure::structured_log::{LogRecord, read_records};
use serde_json::json;
use tempfile::TempDir;

struct Tree {
    dir: TempDir,
}

impl Tree {
    fn new() -> Self {
        let tree = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fs::write(tree.os_release(), "ID=debian\nVERSION_ID=\"12.4\"\n").unwrap();
        fs::create_dir_all(tree.distros().join("debian/common/tasks")).unwrap();
        tree
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn distros(&self) -> PathBuf {
        self.root().join("distros")
    }

    fn os_release(&self) -> PathBuf {
        self.root().join("os-release")
    }

    fn log_dir(&self) -> PathBuf {
        self.root().join("logs")
    }

    fn structured_log(&self) -> PathBuf {
        self.log_dir().join("structured.log")
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.root().join(format!("{name}.done"))
    }

    fn order_file(&self) -> PathBuf {
        self.root().join("order.txt")
    }

    /// Write `body` as a task under `distros/debian/<rel>`.
    fn task(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.distros().join("debian").join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    /// Task that records its name in the order file and leaves a marker.
    fn recording_task(&self, rel: &str) -> PathBuf {
        let name = Path::new(rel).file_name().unwrap().to_string_lossy().into_owned();
        self.task(
            rel,
            &format!(
                "printf '%s\\n' '{name}' >> \"$ORDER_FILE\"\ntouch '{}'\n",
                self.marker(&name).display()
            ),
        )
    }

    fn args(&self) -> ConfigureArgs {
        ConfigureArgs {
            template_root: Some(self.root().to_string_lossy().into_owned()),
            interpreter: Some("/bin/sh".into()),
            log_dir: Some(self.log_dir().to_string_lossy().into_owned()),
            ..ConfigureArgs::default()
        }
    }

    fn env(&self, extra: &[(&str, &str)]) -> EnvSnapshot {
        let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into());
        let order = self.order_file().to_string_lossy().into_owned();
        let mut pairs: Vec<(String, String)> = vec![
            ("PATH".into(), path),
            ("MCX_SKIP_ROOT_CHECK".into(), "1".into()),
            ("ORDER_FILE".into(), order),
        ];
        pairs.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        EnvSnapshot::from_pairs(pairs)
    }

    fn execute(&self, args: &ConfigureArgs, env: &EnvSnapshot) -> mcx_configure::Result<mcx_configure::RunReport> {
        let mut events = EventLogger::console_only();
        orchestrator::execute(args, env, &self.os_release(), &mut events)
    }

    fn order(&self) -> Vec<String> {
        fs::read_to_string(self.order_file())
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn events(&self, event: &str) -> Vec<LogRecord> {
        read_records(&self.structured_log())
            .unwrap()
            .into_iter()
            .filter(|r| r.context_field("event") == Some(&json!(event)))
            .collect()
    }
}

#[test]
fn test_runs_hierarchy_in_fixed_order() {
    let tree = Tree::new();
    tree.recording_task("12/user.d/01-version-user.php");
    tree.recording_task("12/tasks/01-version.php");
    tree.recording_task("common/user.d/05-local.php");
    tree.recording_task("common/tasks/b.php");
    tree.recording_task("common/tasks/a.php");
    tree.recording_task("common/tasks/10-task.php");

    let report = tree.execute(&tree.args(), &tree.env(&[])).unwrap();

    assert_eq!(
        tree.order(),
        vec![
            "10-task.php",
            "a.php",
            "b.php",
            "05-local.php",
            "01-version.php",
            "01-version-user.php"
        ]
    );
    assert_eq!(report.succeeded, 6);
    assert_eq!(report.problems(), 0);
}

#[test]
fn test_dry_run_spawns_nothing_but_records_events() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/10-first.php");
    tree.recording_task("common/tasks/20-second.php");

    let args = ConfigureArgs {
        dry_run: true,
        ..tree.args()
    };
    let report = tree.execute(&args, &tree.env(&[])).unwrap();

    assert_eq!(report.dry_run, 2);
    assert!(!tree.marker("10-first.php").exists());
    assert!(!tree.marker("20-second.php").exists());
    assert!(tree.order().is_empty());

    let dry = tree.events("dry-run");
    let names: Vec<_> = dry.iter().map(|r| r.context_field("task").cloned()).collect();
    assert_eq!(names, vec![Some(json!("10-first.php")), Some(json!("20-second.php"))]);
}

#[test]
fn test_dry_run_from_environment() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/10-first.php");

    let report = tree.execute(&tree.args(), &tree.env(&[("MCX_DRY_RUN", "yes")])).unwrap();
    assert_eq!(report.dry_run, 1);
    assert!(!tree.marker("10-first.php").exists());
}

#[test]
fn test_failing_task_does_not_stop_the_run() {
    let tree = Tree::new();
    tree.task("common/tasks/10-fail.php", "echo broken >&2\nexit 3\n");
    tree.recording_task("common/tasks/20-after.php");

    let report = tree.execute(&tree.args(), &tree.env(&[])).unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
    assert!(tree.marker("20-after.php").exists());

    let finishes = tree.events("finish");
    assert_eq!(finishes.len(), 2);
    assert_eq!(finishes[0].context_field("exit_code"), Some(&json!(3)));
    assert_eq!(finishes[1].context_field("exit_code"), Some(&json!(0)));
    assert!(finishes[0].context_field("duration_seconds").is_some());
}

#[test]
fn test_skip_list_matches_with_and_without_extension() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/05-clear-log-files.php");
    tree.recording_task("common/tasks/06-Keep.php");
    tree.recording_task("common/tasks/07-also-skipped.php");

    let args = ConfigureArgs {
        skip_tasks: Some("05-clear-log-files, 07-ALSO-skipped.php".into()),
        ..tree.args()
    };
    let report = tree.execute(&args, &tree.env(&[])).unwrap();

    assert_eq!(report.skipped, 2);
    assert_eq!(tree.order(), vec!["06-Keep.php"]);
    let skips = tree.events("skip");
    assert!(skips.iter().all(|r| r.context_field("reason") == Some(&json!("skip-list"))));
}

#[test]
fn test_builtin_env_precondition_skips_task() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/24-fetch-ssh-keys.php");

    let report = tree.execute(&tree.args(), &tree.env(&[])).unwrap();
    assert_eq!(report.skipped, 1);
    assert!(!tree.marker("24-fetch-ssh-keys.php").exists());

    let skip = &tree.events("skip")[0];
    assert_eq!(skip.context_field("reason"), Some(&json!("precondition")));
    assert_eq!(skip.context_field("variable"), Some(&json!("MCX_SSH_KEYS_URI")));

    // With the source configured the same task runs.
    let args = ConfigureArgs {
        ssh_keys_uri: Some("https://keys.example.net/ops.pub".into()),
        ..tree.args()
    };
    let report = tree.execute(&args, &tree.env(&[])).unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(tree.marker("24-fetch-ssh-keys.php").exists());
}

#[test]
fn test_missing_command_precondition_from_table_file() {
    let tree = Tree::new();
    fs::write(
        tree.distros().join("task_preconditions.json"),
        r#"{"40-needs-tool.php":[{"type":"command","value":"mcx-no-such-tool"}]}"#,
    )
    .unwrap();
    tree.recording_task("common/tasks/40-needs-tool.php");
    tree.recording_task("common/tasks/50-free.php");

    let report = tree.execute(&tree.args(), &tree.env(&[])).unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(tree.order(), vec!["50-free.php"]);
    let skip = &tree.events("skip")[0];
    assert_eq!(skip.context_field("command"), Some(&json!("mcx-no-such-tool")));
}

#[test]
fn test_unsupported_task_type_is_skipped() {
    let tree = Tree::new();
    tree.task("common/tasks/README.md", "docs\n");
    tree.recording_task("common/tasks/10-real.php");

    let report = tree.execute(&tree.args(), &tree.env(&[])).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(
        tree.events("skip")[0].context_field("reason"),
        Some(&json!("unsupported-type"))
    );
}

#[test]
fn test_launch_failure_is_not_fatal() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/10-first.php");
    tree.recording_task("common/tasks/20-second.php");

    let args = ConfigureArgs {
        interpreter: Some("/nonexistent/interpreter".into()),
        ..tree.args()
    };
    let report = tree.execute(&args, &tree.env(&[])).unwrap();

    assert_eq!(report.launch_failed, 2);
    assert_eq!(tree.events("launch-failed").len(), 2);
    assert_eq!(orchestrator::run(&args, &SanitizedArgs::default(), &tree.env(&[]), &tree.os_release()), 0);
}

#[test]
fn test_task_output_lands_in_per_task_log() {
    let tree = Tree::new();
    tree.task(
        "common/tasks/10-chatty.php",
        "echo to-stdout\necho to-stderr >&2\n",
    );

    tree.execute(&tree.args(), &tree.env(&[])).unwrap();

    let logs: Vec<PathBuf> = fs::read_dir(tree.log_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with("-10-chatty.php.log"))
        .collect();
    assert_eq!(logs.len(), 1);
    let content = fs::read_to_string(&logs[0]).unwrap();
    assert!(content.contains("to-stdout"));
    assert!(content.contains("to-stderr"));

    let finish = &tree.events("finish")[0];
    assert_eq!(
        finish.context_field("log_file"),
        Some(&json!(logs[0].display().to_string()))
    );
}

#[test]
fn test_flooded_stderr_does_not_stall_stdout() {
    let tree = Tree::new();
    tree.task(
        "common/tasks/10-flood.php",
        "head -c 1048576 /dev/zero | tr '\\0' e >&2\necho stdout-after-flood\n",
    );

    let report = tree.execute(&tree.args(), &tree.env(&[])).unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.timed_out, 0);

    let finish = &tree.events("finish")[0];
    assert_eq!(finish.context_field("exit_code"), Some(&json!(0)));

    let log_file = finish.context_field("log_file").unwrap().as_str().unwrap().to_string();
    let content = fs::read_to_string(log_file).unwrap();
    assert!(content.contains("stdout-after-flood"));
    assert!(content.matches('e').count() >= 1_048_576);
}

#[test]
fn test_argument_and_preflight_warnings_reach_structured_log() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/10-only.php");
    let early_log = tree.root().join("early.log");
    let early = early_log.to_string_lossy().into_owned();

    let sanitized = sanitize_args(["mcx-configure", "--bogus-flag=1"].map(String::from));
    let env = tree.env(&[("MCX_STRUCTURED_LOG", early.as_str())]);
    assert_eq!(orchestrator::run(&tree.args(), &sanitized, &env, &tree.os_release()), 0);

    let records = read_records(&early_log).unwrap();
    assert_eq!(records[0].message, "Ignoring unknown option --bogus-flag.");
    assert_eq!(records[0].context_field("option"), Some(&json!("bogus-flag")));
    assert!(records[1].message.starts_with("Root check skipped"));
    assert!(records.iter().any(|r| r.context_field("event") == Some(&json!("summary"))));
}

#[test]
fn test_task_environment_and_working_directory() {
    let tree = Tree::new();
    let out = tree.root().join("env.txt");
    tree.task(
        "common/tasks/10-env.php",
        &format!(
            "{{ pwd; echo \"$MCX_DISTRO_ID/$MCX_DISTRO_VERSION\"; echo \"$MCX_FQDN $MCX_SHORT_HOSTNAME\"; echo \"$MCX_MOUNT_SPEC\"; echo \"root=$ROOT_DEVICE\"; }} > '{}'\n",
            out.display()
        ),
    );

    let args = ConfigureArgs {
        hostname: Some("node01.dc.example".into()),
        ..tree.args()
    };
    tree.execute(&args, &tree.env(&[])).unwrap();

    let content = fs::read_to_string(out).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    let task_dir = tree.distros().join("debian/common/tasks").canonicalize().unwrap();
    assert_eq!(Path::new(lines[0]).canonicalize().unwrap(), task_dir);
    assert_eq!(lines[1], "debian/12");
    assert_eq!(lines[2], "node01.dc.example node01");
    assert!(lines[3].starts_with('['));
    assert!(lines[3].contains("\"mount\":\"/\""));
    assert_eq!(lines[4], "root=/dev/nvme0n1p2");
}

#[test]
fn test_stdin_is_not_inherited() {
    let tree = Tree::new();
    tree.task("common/tasks/10-read.php", "read line || exit 0\nexit 9\n");

    let report = tree.execute(&tree.args(), &tree.env(&[])).unwrap();
    assert_eq!(report.succeeded, 1);
}

#[test]
fn test_timeout_terminates_hung_task() {
    let tree = Tree::new();
    tree.task("common/tasks/10-hang.php", "sleep 30\n");
    tree.recording_task("common/tasks/20-next.php");

    let args = ConfigureArgs {
        task_timeout: Some("0.5".into()),
        ..tree.args()
    };
    let started = std::time::Instant::now();
    let report = tree.execute(&args, &tree.env(&[])).unwrap();

    assert!(started.elapsed().as_secs() < 10);
    assert_eq!(report.timed_out, 1);
    assert!(tree.marker("20-next.php").exists());
    assert_eq!(tree.events("timeout").len(), 1);
}

#[test]
fn test_missing_distro_directory_is_fatal() {
    let tree = Tree::new();
    let args = ConfigureArgs {
        distro: Some("gentoo".into()),
        ..tree.args()
    };
    let err = tree.execute(&args, &tree.env(&[])).unwrap_err();
    assert!(matches!(err, mcx_configure::ProvisionError::DistroDirMissing { .. }));
    assert_eq!(orchestrator::run(&args, &SanitizedArgs::default(), &tree.env(&[]), &tree.os_release()), 1);

    let errors: Vec<LogRecord> = read_records(&tree.structured_log())
        .unwrap()
        .into_iter()
        .filter(|r| r.level == mcx_configure::Level::Error)
        .collect();
    assert!(!errors.is_empty());
}

#[test]
fn test_missing_root_mount_is_fatal_before_tasks() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/10-first.php");

    let args = ConfigureArgs {
        mounts: vec!["/home,/dev/sdb1".into(), "swap,/dev/sda1".into()],
        ..tree.args()
    };
    let err = tree.execute(&args, &tree.env(&[])).unwrap_err();
    assert!(matches!(err, mcx_configure::ProvisionError::MissingRootMount));
    assert!(!tree.marker("10-first.php").exists());
}

#[test]
fn test_missing_version_directory_runs_common_only() {
    let tree = Tree::new();
    tree.recording_task("common/tasks/10-common.php");
    tree.recording_task("11/tasks/10-eleven.php");

    tree.execute(&tree.args(), &tree.env(&[])).unwrap();
    assert_eq!(tree.order(), vec!["10-common.php"]);
}
