//! Task discovery across the distro/version override hierarchy.
//!
//! For distro `D` and version `V` the scan order is fixed:
//!
//! 1. `D/common/tasks`
//! 2. `D/common/user.d`
//! 3. `D/V/tasks`
//! 4. `D/V/user.d`
//!
//! Within a directory, regular files are ordered by plain byte-wise comparison of
//! their full path. That ordering is the only execution-order guarantee tasks get.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::{ProvisionError, Result};
use crate::events::EventLogger;

/// Extension of runnable task scripts.
pub const TASK_EXTENSION: &str = "php";

const COMMON_DIR: &str = "common";
const TASKS_DIR: &str = "tasks";
const USER_DIR: &str = "user.d";

/// One discovered task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub path: PathBuf,
    /// Basename, used for display.
    pub name: String,
    /// Lowercased basename, used for skip-list and precondition lookups.
    pub key: String,
}

impl TaskDescriptor {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let key = name.to_lowercase();
        Self { path, name, key }
    }

    /// Directory the task runs in.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn has_task_extension(&self) -> bool {
        self.path
            .extension()
            .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(TASK_EXTENSION))
    }
}

/// A directory to scan, with a human-readable label for log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDir {
    pub label: String,
    pub path: PathBuf,
}

/// The ordered list of directories to scan for `distro`/`version`.
///
/// A missing distro directory is fatal; a missing version directory only narrows the
/// run to the common tasks.
pub fn plan_task_dirs(
    distros_root: &Path,
    distro: &str,
    version: Option<&str>,
    events: &EventLogger,
) -> Result<Vec<TaskDir>> {
    let distro_dir = distros_root.join(distro);
    if !distro_dir.is_dir() {
        return Err(ProvisionError::DistroDirMissing {
            distro: distro.to_string(),
            path: distro_dir,
        });
    }

    let mut dirs = task_group(&distro_dir.join(COMMON_DIR), &format!("{distro} common"));

    match version {
        Some(version) => {
            let version_dir = distro_dir.join(version);
            if version_dir.is_dir() {
                dirs.extend(task_group(&version_dir, &format!("{distro} {version}")));
            } else {
                events.info(
                    &format!("No version-specific directory for {distro} {version}; skipping."),
                    Some(json!({ "path": version_dir.display().to_string() })),
                );
            }
        }
        None => events.info("Version identifier missing; only common tasks executed.", None),
    }

    Ok(dirs)
}

fn task_group(base: &Path, label: &str) -> Vec<TaskDir> {
    vec![
        TaskDir {
            label: label.to_string(),
            path: base.join(TASKS_DIR),
        },
        TaskDir {
            label: format!("{label} user overrides"),
            path: base.join(USER_DIR),
        },
    ]
}

/// Result of scanning a single directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirScan {
    Missing,
    Found(Vec<TaskDescriptor>),
}

/// Collect regular files (symlinks are followed) in byte-wise path order.
pub fn scan_dir(dir: &Path) -> io::Result<DirScan> {
    if !dir.is_dir() {
        return Ok(DirScan::Missing);
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));

    Ok(DirScan::Found(paths.into_iter().map(TaskDescriptor::from_path).collect()))
}

/// Scan every planned directory in order and concatenate the results.
pub fn discover(dirs: &[TaskDir], events: &EventLogger) -> Vec<TaskDescriptor> {
    let mut tasks = Vec::new();

    for dir in dirs {
        let ctx = json!({ "label": dir.label, "path": dir.path.display().to_string() });
        match scan_dir(&dir.path) {
            Ok(DirScan::Missing) => events.info(
                &format!("No {} directory at {}; skipping.", dir.label, dir.path.display()),
                Some(ctx),
            ),
            Ok(DirScan::Found(found)) if found.is_empty() => events.info(
                &format!("No {} tasks found in {}.", dir.label, dir.path.display()),
                Some(ctx),
            ),
            Ok(DirScan::Found(found)) => {
                tracing::debug!("{} task(s) in {}", found.len(), dir.path.display());
                tasks.extend(found);
            }
            Err(e) => events.warn(
                &format!("Unable to read {} directory {}: {}", dir.label, dir.path.display(), e),
                Some(ctx),
            ),
        }
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "<?php\n").unwrap();
    }

    #[test]
    fn test_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.php", "a.php", "10-task.php", "2-task.php"] {
            touch(&dir.path().join(name));
        }
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let DirScan::Found(tasks) = scan_dir(dir.path()).unwrap() else {
            panic!("directory should exist");
        };
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["10-task.php", "2-task.php", "a.php", "b.php"]);
    }

    #[test]
    fn test_missing_dir() {
        assert_eq!(scan_dir(Path::new("/nonexistent/tasks")).unwrap(), DirScan::Missing);
    }

    #[test]
    fn test_descriptor_fields() {
        let task = TaskDescriptor::from_path("/srv/distros/debian/common/tasks/20-Prepare-Hostname.PHP");
        assert_eq!(task.name, "20-Prepare-Hostname.PHP");
        assert_eq!(task.key, "20-prepare-hostname.php");
        assert!(task.has_task_extension());
        assert_eq!(task.directory(), Path::new("/srv/distros/debian/common/tasks"));

        assert!(!TaskDescriptor::from_path("/tmp/README.md").has_task_extension());
        assert!(!TaskDescriptor::from_path("/tmp/noext").has_task_extension());
    }

    #[test]
    fn test_plan_requires_distro_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = plan_task_dirs(dir.path(), "debian", None, &EventLogger::console_only()).unwrap_err();
        assert!(matches!(err, ProvisionError::DistroDirMissing { .. }));
    }

    #[test]
    fn test_plan_and_discover_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("debian/common/tasks/20-b.php"));
        touch(&root.join("debian/common/tasks/10-a.php"));
        touch(&root.join("debian/common/user.d/05-local.php"));
        touch(&root.join("debian/12/tasks/01-version.php"));
        touch(&root.join("debian/12/user.d/99-last.php"));

        let events = EventLogger::console_only();
        let dirs = plan_task_dirs(root, "debian", Some("12"), &events).unwrap();
        assert_eq!(dirs.len(), 4);
        assert_eq!(dirs[1].label, "debian common user overrides");

        let names: Vec<String> = discover(&dirs, &events).into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["10-a.php", "20-b.php", "05-local.php", "01-version.php", "99-last.php"]
        );
    }

    #[test]
    fn test_missing_version_dir_runs_common_only() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("debian/common/tasks/10-a.php"));
        let dirs =
            plan_task_dirs(dir.path(), "debian", Some("13"), &EventLogger::console_only()).unwrap();
        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().all(|d| d.path.starts_with(dir.path().join("debian/common"))));
    }
}
