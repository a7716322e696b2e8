#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ember-core** – Core message model for the Ember event bus.
//!
//! This crate defines the value types shared by every layer of the bus: the
//! immutable [`Envelope`] with its causality model, the two-level
//! [`SchemaRegistry`] gating payloads, the unified [`BusError`] kinds, and
//! the structured logging facade. It has no knowledge of dispatch or
//! persistence; those live in `ember-bus` and the `ember-store-*` crates.

use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod envelope;
pub mod error;
pub mod logger;
pub mod schema;

pub use envelope::{CausationStep, DeriveOpts, Envelope, RootOpts};
pub use error::BusError;
pub use logger::{BusLogger, LogLevel, NullLogger, SafeLogger, TracingLogger};
pub use schema::{PayloadSchema, SchemaRef, SchemaRegistry};

//─────────────────────────────
//  Core type aliases
//─────────────────────────────

/// Schema version assumed when an event does not carry one.
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

/// Stable identity token assigned to a listener registration.
///
/// Handler ids make "unsubscribe by reference" well defined and are the key
/// persisted into handler rows by the transactional delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(pub Uuid);

impl HandlerId {
    /// Mint a fresh handler id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time as epoch milliseconds.
///
/// All persisted timestamps use this representation.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_ids_are_unique() {
        assert_ne!(HandlerId::new(), HandlerId::new());
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
