//! mcx-configure library
//!
//! Ordered provisioning task orchestration for freshly cloned machine images:
//! configuration resolution, mount specification, task discovery, precondition
//! gating and supervised sequential execution with a structured event trail.

pub mod analyze;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mounts;
pub mod orchestrator;
pub mod os_release;
pub mod preconditions;
pub mod preflight;
pub mod process_guard;
pub mod skip;
pub mod structured_log;
pub mod supervisor;

// Re-export main types for convenience
pub use config::{EnvSnapshot, RunContext};
pub use discovery::TaskDescriptor;
pub use error::{ProvisionError, Result};
pub use events::EventLogger;
pub use mounts::{MountEntry, MountRecord};
pub use preconditions::{CommandLocator, PathLocator, Precondition, PreconditionTable};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use skip::SkipSet;
pub use structured_log::{Level, LogRecord, StructuredLog};
pub use supervisor::{RunReport, SkipReason, Supervisor, TaskOutcome};
