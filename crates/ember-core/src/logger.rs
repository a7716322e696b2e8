//! Structured logging facade for bus internals.
//!
//! The bus reports lifecycle and delivery events as structured records:
//! an event tag from [`tags`] plus arbitrary contextual fields. The sink is
//! treated as external and unsafe; every call goes through [`SafeLogger`],
//! which swallows panics so a faulty sink can never poison the publish or
//! worker hot paths.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

/// Severity attached to a structured log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Fine-grained diagnostics.
    Debug,
    /// Normal operational events.
    Info,
    /// Recoverable trouble (retries, backpressure).
    Warn,
    /// Failures worth paging over.
    Error,
}

/// Structured log sink supplied at bus construction.
pub trait BusLogger: Send + Sync {
    /// Receive one structured record. Implementations may block, fail or
    /// panic; the bus isolates itself from all of it.
    fn log(&self, level: LogLevel, event: &str, fields: &Value);
}

/// Event tags emitted by the bus.
#[allow(missing_docs)]
pub mod tags {
    pub const EVENT_PUBLISHED: &str = "event_published";
    pub const EVENT_PERSISTED: &str = "event_persisted";
    pub const EVENT_DISPATCHED: &str = "event_dispatched";
    pub const EVENT_DISPATCH_FAILED: &str = "event_dispatch_failed";
    pub const EVENT_DISPATCH_GIVE_UP: &str = "event_dispatch_give_up";
    pub const PUBLISH_SCHEMA_MISSING: &str = "publish_schema_missing";
    pub const PUBLISH_SCHEMA_VALIDATION_FAILED: &str = "publish_schema_validation_failed";
    pub const SCHEMA_VALIDATION_FAILED: &str = "schema_validation_failed";
    pub const HANDLER_FAILED: &str = "handler_failed";
    pub const TX_CREATED: &str = "tx_created";
    pub const TX_WORKER_FAILED: &str = "tx_worker_failed";
    pub const TX_CLEANUP: &str = "tx_cleanup";
    pub const TX_CLEANUP_FAILED: &str = "tx_cleanup_failed";
    pub const BUFFER_FULL: &str = "buffer_full";
    pub const BUS_CLOSING: &str = "bus_closing";
    pub const BUS_CLOSED: &str = "bus_closed";
    pub const SHUTDOWN_TIMEOUT: &str = "shutdown_timeout";
}

//─────────────────────────────
//  Bundled sinks
//─────────────────────────────

/// Default sink forwarding records to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl BusLogger for TracingLogger {
    fn log(&self, level: LogLevel, event: &str, fields: &Value) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "ember", event, %fields),
            LogLevel::Info => tracing::info!(target: "ember", event, %fields),
            LogLevel::Warn => tracing::warn!(target: "ember", event, %fields),
            LogLevel::Error => tracing::error!(target: "ember", event, %fields),
        }
    }
}

/// Sink that discards everything. Handy in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl BusLogger for NullLogger {
    fn log(&self, _level: LogLevel, _event: &str, _fields: &Value) {}
}

//─────────────────────────────
//  Panic isolation
//─────────────────────────────

/// Wrapper that isolates the bus from logger faults.
///
/// A panic inside the wrapped sink is caught and discarded.
#[derive(Clone)]
pub struct SafeLogger {
    inner: Arc<dyn BusLogger>,
}

impl SafeLogger {
    /// Wrap a sink.
    pub fn new(inner: Arc<dyn BusLogger>) -> Self {
        Self { inner }
    }

    /// Forward one record, swallowing any panic the sink raises.
    pub fn log(&self, level: LogLevel, event: &str, fields: Value) {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            self.inner.log(level, event, &fields);
        }));
    }
}

impl core::fmt::Debug for SafeLogger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SafeLogger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct PanickyLogger;

    impl BusLogger for PanickyLogger {
        fn log(&self, _level: LogLevel, _event: &str, _fields: &Value) {
            panic!("sink exploded");
        }
    }

    /// Records every call for assertions.
    pub struct RecordingLogger {
        records: Mutex<Vec<(LogLevel, String, Value)>>,
    }

    impl RecordingLogger {
        fn new() -> Self {
            Self {
                records: Mutex::new(Vec::new()),
            }
        }
    }

    impl BusLogger for RecordingLogger {
        fn log(&self, level: LogLevel, event: &str, fields: &Value) {
            self.records
                .lock()
                .unwrap()
                .push((level, event.to_string(), fields.clone()));
        }
    }

    #[test]
    fn safe_logger_swallows_panics() {
        let logger = SafeLogger::new(Arc::new(PanickyLogger));
        // Must not propagate.
        logger.log(LogLevel::Error, tags::HANDLER_FAILED, json!({}));
    }

    #[test]
    fn safe_logger_forwards_records() {
        let recording = Arc::new(RecordingLogger::new());
        let logger = SafeLogger::new(recording.clone());
        logger.log(
            LogLevel::Info,
            tags::EVENT_PUBLISHED,
            json!({"event_type": "test.event"}),
        );

        let records = recording.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, tags::EVENT_PUBLISHED);
        assert_eq!(records[0].2["event_type"], "test.event");
    }
}
