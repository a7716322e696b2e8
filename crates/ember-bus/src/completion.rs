//! One-shot completion handles for durable transactions.
//!
//! Each in-flight transaction owns a single watch channel holding
//! `Option<TxResult>`. Fulfillment is one atomic send; every receiver
//! clone observes that single value, including clones taken after the
//! fact. The channel therefore serves both views the caller gets: a
//! blocking promise ([`TxHandle::wait`]) and a multiplexed subscription
//! ([`TxHandle::watch`]).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

//─────────────────────────────
//  Results
//─────────────────────────────

/// Terminal error reported for a failed transaction. Individual handler
/// error kinds are collapsed into this single tag; per-row detail lives in
/// the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorKind {
    /// At least one handler row ended in `failed` or `timeout`.
    HandlerFailed,
}

/// Final outcome of a durable transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    /// Whether every handler row succeeded.
    pub ok: bool,
    /// The transaction this result belongs to.
    pub tx_id: Uuid,
    /// Present exactly when `ok` is false.
    pub error: Option<TxErrorKind>,
}

impl TxResult {
    /// Successful outcome.
    pub fn success(tx_id: Uuid) -> Self {
        Self {
            ok: true,
            tx_id,
            error: None,
        }
    }

    /// Failed outcome.
    pub fn failure(tx_id: Uuid) -> Self {
        Self {
            ok: false,
            tx_id,
            error: Some(TxErrorKind::HandlerFailed),
        }
    }
}

//─────────────────────────────
//  Handle
//─────────────────────────────

/// Completion handle returned by [`Bus::transact`](crate::Bus::transact).
///
/// Cloning the handle (or calling [`watch`](Self::watch)) gives additional
/// observers of the same one-shot fulfillment.
#[derive(Debug, Clone)]
pub struct TxHandle {
    tx_id: Uuid,
    receiver: watch::Receiver<Option<TxResult>>,
}

impl TxHandle {
    /// The transaction id this handle tracks.
    pub fn tx_id(&self) -> Uuid {
        self.tx_id
    }

    /// Promise view: wait until the result is delivered.
    ///
    /// Returns `None` only if the bus was torn down before the transaction
    /// reached a terminal state.
    pub async fn wait(&self) -> Option<TxResult> {
        let mut receiver = self.receiver.clone();
        loop {
            if let Some(result) = receiver.borrow_and_update().clone() {
                return Some(result);
            }
            if receiver.changed().await.is_err() {
                return receiver.borrow().clone();
            }
        }
    }

    /// Non-blocking probe for an already-delivered result.
    pub fn try_result(&self) -> Option<TxResult> {
        self.receiver.borrow().clone()
    }

    /// Multiplexer view: an independent receiver of the one-shot result.
    pub fn watch(&self) -> watch::Receiver<Option<TxResult>> {
        self.receiver.clone()
    }

    /// Handle that is already fulfilled, for transactions with no handler
    /// rows.
    pub(crate) fn completed(result: TxResult) -> Self {
        let tx_id = result.tx_id;
        let (_, receiver) = watch::channel(Some(result));
        Self { tx_id, receiver }
    }
}

//─────────────────────────────
//  Table
//─────────────────────────────

/// Registry of in-flight completion channels, keyed by transaction id.
/// Entries are removed by the worker that fulfills them, which makes the
/// fulfillment exactly-once.
#[derive(Debug, Default)]
pub(crate) struct CompletionTable {
    entries: Mutex<HashMap<Uuid, watch::Sender<Option<TxResult>>>>,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh channel for `tx_id` and hand back its handle.
    pub fn register(&self, tx_id: Uuid) -> TxHandle {
        let (sender, receiver) = watch::channel(None);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tx_id, sender);
        TxHandle { tx_id, receiver }
    }

    /// Fulfill and forget the channel for `tx_id`. Returns whether an
    /// in-flight entry existed.
    pub fn complete(&self, tx_id: Uuid, result: TxResult) -> bool {
        let sender = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tx_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(Some(result));
                true
            }
            None => false,
        }
    }

    /// Drop the channel for `tx_id` without fulfilling it. Used when the
    /// store rejects the append after the handle was registered.
    pub fn discard(&self, tx_id: Uuid) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tx_id);
    }

    /// Number of in-flight entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
