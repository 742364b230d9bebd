//! Injected telemetry sink
//!
//! Pipeline components never reach for a process-wide logger of their own.
//! Each one is handed an `Arc<dyn Telemetry>` at construction and emits
//! `(severity, component, message)` events into it. The default
//! [`LogTelemetry`] forwards to the `log` facade, so the usual
//! `tracing-subscriber` / `env_logger` setup of the host application applies.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Severity of a telemetry event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    fn as_level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Warn => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Receiver of pipeline events
pub trait Telemetry: Send + Sync {
    /// Emit one event. `component` is a short static name such as `"jitter"`.
    fn emit(&self, severity: Severity, component: &'static str, args: fmt::Arguments<'_>);
}

pub type SharedTelemetry = Arc<dyn Telemetry>;

/// Forwards events to the `log` facade, using the component as log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn emit(&self, severity: Severity, component: &'static str, args: fmt::Arguments<'_>) {
        log::log!(target: component, severity.as_level(), "{}", args);
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn emit(&self, _: Severity, _: &'static str, _: fmt::Arguments<'_>) {}
}

/// A recorded telemetry event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub severity: Severity,
    pub component: &'static str,
    pub message: String,
}

/// Keeps every event in memory; used to assert on error classification
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of events at or above `severity`
    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|e| e.severity >= severity)
            .count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|e| e.message.contains(needle))
    }
}

impl Telemetry for MemoryTelemetry {
    fn emit(&self, severity: Severity, component: &'static str, args: fmt::Arguments<'_>) {
        let event = TelemetryEvent {
            severity,
            component,
            message: args.to_string(),
        };
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Default telemetry handed to components built without an explicit sink
pub fn default_telemetry() -> SharedTelemetry {
    Arc::new(LogTelemetry)
}

/// Install a `tracing-subscriber` formatter that also picks up `log` records.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().try_init();
}
