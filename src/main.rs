//! mcx-configure - main entry point
//!
//! Turns a freshly cloned image into a unique host by running the distro task tree.

use std::process::ExitCode;

use mcx_configure::analyze;
use mcx_configure::cli::{Cli, Commands, sanitize_args};
use mcx_configure::config::EnvSnapshot;
use mcx_configure::os_release::DEFAULT_OS_RELEASE;
use mcx_configure::orchestrator;
use mcx_configure::process_guard;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// INFO and below on stdout, WARN/ERROR on stderr. `RUST_LOG` overrides the level.
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();

    let sanitized = sanitize_args(std::env::args());
    let cli = Cli::parse_sanitized(&sanitized);

    if let Some(Commands::AnalyzeLog(args)) = &cli.command {
        return match analyze::run(args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("{:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = process_guard::init_signal_handlers() {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }

    let env = EnvSnapshot::from_process();
    let code = orchestrator::run(&cli.configure, &sanitized, &env, Path::new(DEFAULT_OS_RELEASE));
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
