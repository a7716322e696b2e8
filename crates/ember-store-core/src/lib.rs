#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ember-store-core** – Storage abstraction for the Ember bus.
//!
//! This crate defines the row model of the durable delivery path
//! (`Tx 1—* Msg 1—* HandlerRow`), the status algebra that drives
//! transactions to terminal states, and the [`TxStore`] trait concrete
//! drivers implement. It carries no I/O of its own; the bundled drivers
//! live in `ember-store-memory` and `ember-store-sqlite`.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub use ember_core::HandlerId;

//─────────────────────────────
//  Status algebra
//─────────────────────────────

/// Lifecycle of a persisted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// At least one handler row still has work to do.
    Pending,
    /// Every handler row finished successfully (or there were none).
    Ok,
    /// At least one handler row ended in `failed` or `timeout`.
    Failed,
}

impl TxStatus {
    /// Stable textual form used by the persistent backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    /// Parse the textual form produced by [`as_str`](Self::as_str).
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "pending" => Ok(Self::Pending),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown tx status: {other}")),
        }
    }

    /// Whether the transaction has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Derive the transaction status from its handler-row statuses.
    ///
    /// An empty set maps to `Ok`; any `failed` or `timeout` row maps to
    /// `Failed` even while siblings are still pending; otherwise any
    /// pending row keeps the transaction `Pending`.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = HandlerStatus>,
    {
        let mut seen_any = false;
        let mut seen_pending = false;
        for status in statuses {
            seen_any = true;
            match status {
                HandlerStatus::Failed | HandlerStatus::Timeout => return Self::Failed,
                HandlerStatus::Pending => seen_pending = true,
                HandlerStatus::Ok => {}
            }
        }
        if seen_any && seen_pending {
            Self::Pending
        } else {
            Self::Ok
        }
    }
}

/// Lifecycle of a single handler row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Eligible for execution once `next_at` passes.
    Pending,
    /// Handler reported success.
    Ok,
    /// Handler failed terminally (retries exhausted or non-retryable).
    Failed,
    /// Handler overran its deadline on the final attempt.
    Timeout,
}

impl HandlerStatus {
    /// Stable textual form used by the persistent backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    /// Parse the textual form produced by [`as_str`](Self::as_str).
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "pending" => Ok(Self::Pending),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(anyhow::anyhow!("unknown handler status: {other}")),
        }
    }
}

//─────────────────────────────
//  Payload serialization boundary
//─────────────────────────────

/// How payloads round-trip through a backend.
///
/// The two formats differ only in whether decoding happens at read time:
/// `Json` serializes to a text column on write and parses on read, while
/// `Value` lets backends that can hold structured values skip the text
/// round-trip entirely. Backends without structured storage (SQLite)
/// always write text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// Serialize to a JSON string at write time, parse at read time.
    #[default]
    Json,
    /// Keep the structured value undecoded where the backend allows it.
    Value,
}

/// A payload as a backend holds it.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredPayload {
    /// Serialized JSON text.
    Json(String),
    /// Structured value, stored as-is.
    Value(Value),
}

impl StoredPayload {
    /// Encode a payload for storage under the given format.
    pub fn encode(format: PayloadFormat, payload: &Value) -> Result<Self> {
        match format {
            PayloadFormat::Json => Ok(Self::Json(serde_json::to_string(payload)?)),
            PayloadFormat::Value => Ok(Self::Value(payload.clone())),
        }
    }

    /// Decode back into the structured payload.
    pub fn decode(&self) -> Result<Value> {
        match self {
            Self::Json(text) => Ok(serde_json::from_str(text)?),
            Self::Value(value) => Ok(value.clone()),
        }
    }

    /// Textual form for backends with string-only columns.
    pub fn as_text(&self) -> Result<String> {
        match self {
            Self::Json(text) => Ok(text.clone()),
            Self::Value(value) => Ok(serde_json::to_string(value)?),
        }
    }
}

//─────────────────────────────
//  Row model
//─────────────────────────────

/// Persisted transaction row.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRow {
    /// Transaction id.
    pub tx_id: Uuid,
    /// Aggregated status, kept current by the worker.
    pub status: TxStatus,
    /// Epoch-millis creation time.
    pub created_at: i64,
    /// Epoch-millis last update time.
    pub updated_at: i64,
}

/// Persisted message row, one per event in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgRow {
    /// Message row id.
    pub msg_id: Uuid,
    /// Owning transaction.
    pub tx_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Payload, encoded per the configured format.
    pub payload: StoredPayload,
    /// Module tag of the producer.
    pub module: String,
    /// Schema version the payload claims.
    pub schema_version: String,
    /// Causal-chain id of the reconstructed envelope.
    pub correlation_id: Uuid,
    /// Envelope message id.
    pub message_id: Uuid,
}

/// Persisted per-(message, listener) unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRow {
    /// Handler row id.
    pub h_id: Uuid,
    /// Owning message.
    pub msg_id: Uuid,
    /// Listener this row belongs to, frozen at transact time.
    pub handler_id: HandlerId,
    /// Row status.
    pub status: HandlerStatus,
    /// Attempts consumed so far.
    pub retry_count: u32,
    /// Serialized error map of the last failed attempt, if any.
    pub last_error: Option<String>,
    /// Epoch-millis last update time.
    pub updated_at: i64,
    /// Earliest epoch-millis the row becomes eligible again.
    pub next_at: i64,
}

/// The complete row set of one atomic append, plus its handler count.
#[derive(Debug, Clone)]
pub struct TxData {
    /// Transaction row, always `pending` at append time.
    pub tx: TxRow,
    /// One row per event in the batch.
    pub msgs: Vec<MsgRow>,
    /// One row per `(msg, listener)` pair at snapshot time.
    pub handlers: Vec<HandlerRow>,
}

impl TxData {
    /// Number of handler rows in the append.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// An event as handed to `transact`, before validation and persistence.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Event type tag. Required.
    pub event_type: String,
    /// Opaque payload.
    pub payload: Value,
    /// Module tag of the producer. Required.
    pub module: String,
    /// Schema version; defaults to the registry default when `None`.
    pub schema_version: Option<String>,
}

impl EventDraft {
    /// Build a draft with the default schema version.
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        module: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            module: module.into(),
            schema_version: None,
        }
    }

    /// Override the schema version.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }
}

/// Materialize the rows for one atomic append.
///
/// For each event one [`MsgRow`] is created, plus one [`HandlerRow`] per
/// listener registered for that event type in the snapshot. Listeners are
/// resolved exactly once here; every handler row starts
/// `{status: pending, retry_count: 0, next_at: now}`.
pub fn build_tx_data(
    tx_id: Uuid,
    now: i64,
    events: &[EventDraft],
    listeners: &HashMap<String, Vec<HandlerId>>,
    format: PayloadFormat,
) -> Result<TxData> {
    let mut msgs = Vec::with_capacity(events.len());
    let mut handlers = Vec::new();

    for event in events {
        let msg_id = Uuid::new_v4();
        msgs.push(MsgRow {
            msg_id,
            tx_id,
            event_type: event.event_type.clone(),
            payload: StoredPayload::encode(format, &event.payload)?,
            module: event.module.clone(),
            schema_version: event
                .schema_version
                .clone()
                .unwrap_or_else(|| ember_core::DEFAULT_SCHEMA_VERSION.to_string()),
            correlation_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
        });

        for handler_id in listeners.get(&event.event_type).into_iter().flatten() {
            handlers.push(HandlerRow {
                h_id: Uuid::new_v4(),
                msg_id,
                handler_id: *handler_id,
                status: HandlerStatus::Pending,
                retry_count: 0,
                last_error: None,
                updated_at: now,
                next_at: now,
            });
        }
    }

    Ok(TxData {
        tx: TxRow {
            tx_id,
            status: TxStatus::Pending,
            created_at: now,
            updated_at: now,
        },
        msgs,
        handlers,
    })
}

//─────────────────────────────
//  Pending work and updates
//─────────────────────────────

/// A handler row joined with its message, as returned by the pending query.
///
/// Carries everything the worker needs to reconstruct the envelope and
/// execute the listener. The payload arrives already decoded per the
/// backend's serialization.
#[derive(Debug, Clone)]
pub struct PendingHandler {
    /// Handler row id.
    pub h_id: Uuid,
    /// Owning message.
    pub msg_id: Uuid,
    /// Owning transaction.
    pub tx_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Decoded payload.
    pub payload: Value,
    /// Module tag of the producer.
    pub module: String,
    /// Schema version the payload claims.
    pub schema_version: String,
    /// Causal-chain id.
    pub correlation_id: Uuid,
    /// Envelope message id.
    pub message_id: Uuid,
    /// Listener frozen at transact time.
    pub handler_id: HandlerId,
    /// Attempts consumed so far.
    pub retry_count: u32,
}

/// State transition applied to one handler row after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerUpdate {
    /// Handler row id.
    pub h_id: Uuid,
    /// New status.
    pub status: HandlerStatus,
    /// New retry count.
    pub retry_count: u32,
    /// Serialized error map, when the attempt produced one.
    pub last_error: Option<String>,
    /// Epoch-millis update time.
    pub updated_at: i64,
    /// Next eligibility time (backoff target for retries).
    pub next_at: i64,
}

//─────────────────────────────
//  Store trait
//─────────────────────────────

/// Abstraction over a persistent store for transactions, messages and
/// handler rows.
///
/// `append_tx` is the only multi-row write and must be atomic; on any
/// failure the whole append rolls back. A single in-process writer lock is
/// an acceptable implementation of that contract.
#[async_trait]
pub trait TxStore: Send + Sync {
    /// Create the schema; idempotent.
    async fn init(&self) -> Result<()>;

    /// Atomically append one transaction with its messages and handler rows.
    async fn append_tx(&self, data: &TxData) -> Result<()>;

    /// All handler rows with `status = pending` and `next_at <= now`, joined
    /// with their message.
    async fn pending_handlers(&self, now: i64) -> Result<Vec<PendingHandler>>;

    /// Apply a state transition to one handler row.
    async fn update_handler(&self, update: &HandlerUpdate) -> Result<()>;

    /// Derive the aggregated status of a transaction from its handler rows.
    async fn tx_status(&self, tx_id: Uuid) -> Result<TxStatus>;

    /// Persist a terminal transaction status.
    async fn update_tx(&self, tx_id: Uuid, status: TxStatus, now: i64) -> Result<()>;

    /// Delete terminal transactions older than the retention window,
    /// returning how many were purged. Optional per backend; the default
    /// implementation purges nothing.
    async fn cleanup(&self, now: i64, retention_ms: i64) -> Result<u64> {
        let _ = (now, retention_ms);
        Ok(0)
    }
}
