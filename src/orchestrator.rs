//! Top-level provisioning run.
//!
//! `preflight -> resolve -> plan directories -> discover -> supervise -> summary`.
//! Fatal conditions surface here as [`ProvisionError`]; this is the only place that
//! turns them into a process exit code.

use std::path::Path;

use serde_json::json;

use crate::cli::{ConfigureArgs, SanitizedArgs};
use crate::config::{self, EnvSnapshot, RunContext};
use crate::discovery;
use crate::error::{ProvisionError, Result};
use crate::events::EventLogger;
use crate::preconditions::{PathLocator, PreconditionTable};
use crate::preflight;
use crate::process_guard::ProcessGuard;
use crate::structured_log::StructuredLog;
use crate::supervisor::{RunReport, Supervisor};

/// Run every eligible task and return the tallies.
///
/// `events` is upgraded to the structured sink as soon as the configuration names
/// one, so the caller can keep reporting through it afterwards.
pub fn execute(
    args: &ConfigureArgs,
    env: &EnvSnapshot,
    os_release: &Path,
    events: &mut EventLogger,
) -> Result<RunReport> {
    preflight::check_privileges(env, events)?;

    let ctx = config::resolve(args, env, os_release, events)?;
    announce(&ctx, events);

    if !ctx.dry_run {
        preflight::check_interpreter(&ctx, events);
    }

    let distros_root = ctx.distros_root();
    let dirs = discovery::plan_task_dirs(
        &distros_root,
        &ctx.distro_id,
        ctx.distro_version.as_deref(),
        events,
    )?;
    let tasks = discovery::discover(&dirs, events);

    let preconditions = PreconditionTable::load(&distros_root, events);
    let locator = PathLocator::for_environment(ctx.task_environment());

    let _guard = ProcessGuard::new();
    let report = Supervisor::new(&ctx, events, &preconditions, &locator).run_all(&tasks);

    let message = if report.problems() == 0 {
        "Distro configuration completed successfully."
    } else {
        "Distro configuration completed with task failures."
    };
    events.info(message, Some(report.to_context()));

    Ok(report)
}

fn announce(ctx: &RunContext, events: &EventLogger) {
    let version = ctx.distro_version.as_deref().unwrap_or("unknown");
    events.info(
        &format!("Configuring {} (version {}).", ctx.distro_id, version),
        Some(json!({
            "distro": ctx.distro_id,
            "version": ctx.distro_version,
            "template_root": ctx.template_root.display().to_string(),
            "mounts": ctx.mounts.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "dry_run": ctx.dry_run,
        })),
    );
    if !ctx.skip.is_empty() {
        events.info(
            &format!("Skipping tasks: {}", ctx.skip.display().join(", ")),
            Some(json!({ "skip_tasks": ctx.skip.display() })),
        );
    }
    if ctx.dry_run {
        events.info("Dry run enabled; tasks will not be executed.", None);
    }
}

/// Run and map the result to a process exit code.
///
/// A structured target named on the command line or in the environment is opened
/// before anything else, so argument warnings and preflight failures are recorded.
pub fn run(
    args: &ConfigureArgs,
    sanitized: &SanitizedArgs,
    env: &EnvSnapshot,
    os_release: &Path,
) -> i32 {
    let mut events = EventLogger::new(StructuredLog::new(config::initial_structured_target(args, env)));
    sanitized.report(&events);

    match execute(args, env, os_release, &mut events) {
        Ok(_) => 0,
        Err(e) => {
            report_fatal(&e, &events);
            e.exit_code()
        }
    }
}

fn report_fatal(err: &ProvisionError, events: &EventLogger) {
    let context = match err {
        ProvisionError::DistroDirMissing { distro, path } => Some(json!({
            "distro": distro,
            "path": path.display().to_string(),
        })),
        _ => None,
    };
    events.error(&err.to_string(), context);
}
