//! Checks that run before any task is touched.
//!
//! - Root privileges (EUID 0), unless `MCX_SKIP_ROOT_CHECK` is set
//! - The task interpreter can be found on the task `PATH`

use serde_json::json;

use crate::config::{EnvSnapshot, RunContext};
use crate::error::{ProvisionError, Result};
use crate::events::EventLogger;
use crate::preconditions::{CommandLocator, PathLocator};

pub const SKIP_ROOT_CHECK_VAR: &str = "MCX_SKIP_ROOT_CHECK";

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// `MCX_SKIP_ROOT_CHECK=1` (or `true`) bypasses the privilege check.
pub fn should_skip_root_check(env: &EnvSnapshot) -> bool {
    env.get(SKIP_ROOT_CHECK_VAR)
        .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Fail with [`ProvisionError::NotRoot`] unless running as root or told not to care.
pub fn check_privileges(env: &EnvSnapshot, events: &EventLogger) -> Result<()> {
    check_privileges_as(is_running_as_root(), env, events)
}

fn check_privileges_as(is_root: bool, env: &EnvSnapshot, events: &EventLogger) -> Result<()> {
    if is_root {
        return Ok(());
    }
    if should_skip_root_check(env) {
        events.warn(&format!("Root check skipped ({SKIP_ROOT_CHECK_VAR}=1)."), None);
        return Ok(());
    }
    Err(ProvisionError::NotRoot)
}

/// Warn when the interpreter cannot be resolved. Every task would then end up as a
/// launch failure, which is still not fatal.
pub fn check_interpreter(ctx: &RunContext, events: &EventLogger) -> bool {
    let locator = PathLocator::for_environment(ctx.task_environment());
    if locator.resolve(&ctx.interpreter) {
        tracing::debug!("Task interpreter {} found", ctx.interpreter);
        return true;
    }
    events.warn(
        &format!("Task interpreter '{}' not found on PATH; tasks will fail to launch.", ctx.interpreter),
        Some(json!({ "interpreter": ctx.interpreter })),
    );
    false
}
