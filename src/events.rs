//! Console + structured event mirroring.
//!
//! Orchestration code reports through [`EventLogger`] so that every INFO/WARN/ERROR
//! line shown on the console lands in the structured log too, with its context.

use serde_json::Value;

use crate::structured_log::{Level, StructuredLog};

#[derive(Debug, Clone, Default)]
pub struct EventLogger {
    sink: StructuredLog,
}

impl EventLogger {
    pub fn new(sink: StructuredLog) -> Self {
        Self { sink }
    }

    /// Console-only logger, used until the structured target is resolved.
    pub fn console_only() -> Self {
        Self::new(StructuredLog::disabled())
    }

    pub fn sink(&self) -> &StructuredLog {
        &self.sink
    }

    pub fn info(&self, message: &str, context: Option<Value>) {
        match &context {
            Some(ctx) => tracing::info!(context = %ctx, "{}", message),
            None => tracing::info!("{}", message),
        }
        self.sink.record(Level::Info, message, context);
    }

    pub fn warn(&self, message: &str, context: Option<Value>) {
        match &context {
            Some(ctx) => tracing::warn!(context = %ctx, "{}", message),
            None => tracing::warn!("{}", message),
        }
        self.sink.record(Level::Warn, message, context);
    }

    pub fn error(&self, message: &str, context: Option<Value>) {
        match &context {
            Some(ctx) => tracing::error!(context = %ctx, "{}", message),
            None => tracing::error!("{}", message),
        }
        self.sink.record(Level::Error, message, context);
    }
}
