//! Lifetime coupling between the orchestrator and its task processes.
//!
//! Every task runs as the leader of its own process group with a parent-death
//! signal, and its PID sits in a global registry while it runs. When the
//! orchestrator is interrupted (SIGINT, SIGTERM, SIGHUP) or a [`ProcessGuard`] is
//! dropped, each registered group gets SIGTERM, then SIGKILL once the grace period
//! runs out. Helpers a task spawns (mdadm, update-initramfs, ...) share the group
//! and go down with it.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// PIDs of task processes that are currently running.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::debug!("Registered task process PID {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::debug!("Unregistered task process PID {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every registered process group. Runs at most once per registry.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            tracing::debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        tracing::info!("Terminating {} running task process(es)...", self.pids.len());

        let pids: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids {
            if let Err(e) = signal_group(pid, Signal::SIGTERM) {
                tracing::warn!("Failed to send SIGTERM to task {}: {}", pid, e);
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                tracing::info!("All task processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                tracing::warn!("Task process group {} ignored SIGTERM, sending SIGKILL", pid);
                if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                    tracing::error!("Failed to send SIGKILL to task {}: {}", pid, e);
                }
            }
        }

        self.pids.clear();
    }
}

/// Register `pid` in the global registry.
pub fn register_global(pid: u32) {
    // A poisoned registry means a panic while holding it; nothing sane remains.
    let registry = ChildRegistry::global();
    let mut guard = registry.lock().expect("ChildRegistry mutex poisoned");
    guard.register(pid);
}

pub fn unregister_global(pid: u32) {
    let registry = ChildRegistry::global();
    let mut guard = registry.lock().expect("ChildRegistry mutex poisoned");
    guard.unregister(pid);
}

/// Signal the process group led by `pgid`, falling back to the single process
/// when the group is already gone.
pub fn signal_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    match signal::kill(Pid::from_raw(-(pgid as i32)), signal) {
        Ok(()) => Ok(()),
        Err(_) => signal::kill(Pid::from_raw(pgid as i32), signal),
    }
}

/// Running, sleeping or stopped. Zombies count as dead.
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state letter.
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Terminates every registered task when dropped. Held for the duration of a run.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
    grace: Duration,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
            grace: DEFAULT_GRACE,
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            if registry.count() > 0 {
                registry.terminate_all(self.grace);
            }
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that stop the running task and exit with
/// `128 + signal`. Call once, before the first task is spawned.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };
            tracing::warn!("Received {}, stopping the running task", signal_name);

            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }

            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Process-group setup for task commands.
pub trait CommandProcessGroup {
    /// Make the child lead a new process group and receive SIGTERM if the
    /// orchestrator dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn wait_for_exit(child: &mut std::process::Child, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .unwrap();

        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        assert!(is_process_alive(child.id()));

        registry.terminate_all(Duration::from_millis(500));
        assert!(wait_for_exit(&mut child, Duration::from_secs(3)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_sigterm_trap_exits_cleanly() {
        let mut child = Command::new("sh")
            .args(["-c", "trap 'exit 0' TERM; while :; do sleep 0.05; done"])
            .in_new_process_group()
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        registry.terminate_all(Duration::from_secs(2));

        assert!(wait_for_exit(&mut child, Duration::from_secs(3)));
    }

    #[test]
    fn test_cleanup_runs_once() {
        let mut registry = ChildRegistry::default();
        registry.register(999_999);
        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);

        registry.register(999_998);
        registry.terminate_all(Duration::from_millis(10));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_dead_pids() {
        assert!(!is_process_alive(999_999));
        assert!(signal_group(999_999, Signal::SIGTERM).is_err());
    }
}
