//! Unified error kinds surfaced by the bus and its storage layer.

use thiserror::Error;

/// Errors produced by bus construction, publish, transact and the
/// subscription surface.
///
/// Validation failures are raised to the caller before any dispatch or
/// persistence happens. Handler failures inside the fire-and-forget path
/// never surface here; they are caught by the task wrapper and logged.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BusError {
    /// Operation attempted on a closed bus.
    #[error("bus is closed")]
    Closed,

    /// A publish, transact or envelope construction did not carry a module tag.
    #[error("missing module tag")]
    MissingModule,

    /// A transact event did not carry an event type.
    #[error("missing event type")]
    MissingEventType,

    /// Bus construction without a schema registry.
    #[error("missing schema registry")]
    MissingSchemaRegistry,

    /// No validator registered for the `(event_type, schema_version)` pair.
    #[error("no schema registered for {event_type} version {schema_version}")]
    SchemaMissing {
        event_type: String,
        schema_version: String,
    },

    /// Payload rejected by the registered validator.
    #[error("payload failed schema validation for {event_type} version {schema_version}")]
    SchemaValidation {
        event_type: String,
        schema_version: String,
    },

    /// Deriving the envelope would close a causal cycle.
    #[error("causal cycle detected at ({module}, {event_type})")]
    CycleDetected {
        module: String,
        event_type: String,
    },

    /// Causation path grew beyond the configured bound.
    #[error("causation path depth {depth} exceeds maximum {max_depth}")]
    MaxDepthExceeded { depth: usize, max_depth: usize },

    /// Buffered dispatch queue is saturated; the publisher must back off.
    #[error("dispatch buffer full")]
    BufferFull,

    /// `transact` called on a bus without a configured store.
    #[error("no transactional store configured")]
    NoTxStore,

    /// `transact` called with an empty event batch.
    #[error("transact requires at least one event")]
    EmptyTransaction,

    /// `subscribe` with an inbox requested on a bus without a store.
    #[error("inbox subscription requires a transactional store")]
    InboxRequiresStore,

    /// Underlying storage failure.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
