//! Background worker driving persisted handler rows to terminal states.
//!
//! One worker task runs per bus instance with a store. Each tick it polls
//! the rows whose `next_at` has passed, executes their handlers under the
//! configured deadline, applies the retry/backoff policy, and completes
//! the transaction's waiters once its aggregated status turns terminal.
//! Store hiccups abort the tick and are logged; the loop carries on.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ember_core::logger::tags;
use ember_core::{now_ms, Envelope, LogLevel};
use ember_store_core::{HandlerStatus, HandlerUpdate, PendingHandler, TxStatus, TxStore};

use crate::completion::TxResult;
use crate::Bus;

//─────────────────────────────
//  Attempt classification
//─────────────────────────────

/// Result of one handler invocation, before the retry policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AttemptOutcome {
    pub status: HandlerStatus,
    pub retryable: bool,
    pub error: Option<AttemptError>,
}

impl AttemptOutcome {
    fn success() -> Self {
        Self {
            status: HandlerStatus::Ok,
            retryable: false,
            error: None,
        }
    }

    fn terminal_failure(kind: &'static str, message: Option<String>) -> Self {
        Self {
            status: HandlerStatus::Failed,
            retryable: false,
            error: Some(AttemptError { kind, message }),
        }
    }

    fn retryable_failure(kind: &'static str, message: Option<String>) -> Self {
        Self {
            status: HandlerStatus::Failed,
            retryable: true,
            error: Some(AttemptError { kind, message }),
        }
    }

    fn timeout() -> Self {
        Self {
            status: HandlerStatus::Timeout,
            retryable: true,
            error: Some(AttemptError {
                kind: "handler_timeout",
                message: None,
            }),
        }
    }
}

/// Error recorded on a handler row after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AttemptError {
    pub kind: &'static str,
    pub message: Option<String>,
}

impl AttemptError {
    /// Serialized error map stored in the row's `last_error` column.
    fn serialize(&self) -> String {
        json!({"error": self.kind, "message": self.message}).to_string()
    }
}

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Compute the state transition for one row after an attempt.
///
/// A retryable failure consumes one attempt out of `max_retries`; while
/// attempts remain the row returns to `pending` with `next_at` pushed out
/// by the backoff. Success keeps the retry count untouched.
pub(crate) fn plan_update(
    row: &PendingHandler,
    outcome: &AttemptOutcome,
    max_retries: u32,
    backoff_ms: i64,
    now: i64,
) -> HandlerUpdate {
    let next_retry = row.retry_count + 1;
    let exhausted = outcome.retryable && next_retry >= max_retries;

    let status = if outcome.status == HandlerStatus::Ok {
        HandlerStatus::Ok
    } else if outcome.retryable && !exhausted {
        HandlerStatus::Pending
    } else {
        outcome.status
    };

    let retry_count = if outcome.status == HandlerStatus::Ok {
        row.retry_count
    } else {
        next_retry
    };

    let next_at = if outcome.retryable && !exhausted {
        now + backoff_ms
    } else {
        now
    };

    HandlerUpdate {
        h_id: row.h_id,
        status,
        retry_count,
        last_error: outcome.error.as_ref().map(AttemptError::serialize),
        updated_at: now,
        next_at,
    }
}

//─────────────────────────────
//  Worker loop
//─────────────────────────────

/// Poll loop body. Exits when cancelled or when the bus is gone.
pub(crate) async fn run(bus: Weak<Bus>, cancel: CancellationToken) {
    tracing::debug!(target: "ember", "tx worker started");
    let mut last_cleanup = now_ms();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(bus) = bus.upgrade() else { break };
        if let Err(err) = bus.worker_tick(&cancel, &mut last_cleanup).await {
            tracing::warn!(target: "ember", error = %err, "tx worker tick failed");
            bus.log(
                LogLevel::Warn,
                tags::TX_WORKER_FAILED,
                json!({"error": err.to_string()}),
            );
        }
        let poll_interval = bus.settings.poll_interval;
        drop(bus);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    tracing::debug!(target: "ember", "tx worker stopped");
}

impl Bus {
    pub(crate) async fn worker_tick(
        &self,
        cancel: &CancellationToken,
        last_cleanup: &mut i64,
    ) -> anyhow::Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };

        let rows = store.pending_handlers(now_ms()).await?;
        for row in rows {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.attempt(&row).await;
            let update = plan_update(
                &row,
                &outcome,
                self.settings.handler_max_retries,
                self.settings.handler_backoff.as_millis() as i64,
                now_ms(),
            );
            self.log_attempt(&row, &outcome, &update);
            store.update_handler(&update).await?;

            let status = store.tx_status(row.tx_id).await?;
            if status.is_terminal() {
                store.update_tx(row.tx_id, status, now_ms()).await?;
                let result = if status == TxStatus::Ok {
                    TxResult::success(row.tx_id)
                } else {
                    TxResult::failure(row.tx_id)
                };
                self.completions.complete(row.tx_id, result);
            }
        }

        self.maybe_cleanup(&store, last_cleanup).await;
        Ok(())
    }

    /// Execute one handler row and classify the outcome.
    async fn attempt(&self, row: &PendingHandler) -> AttemptOutcome {
        let envelope = Envelope {
            message_id: row.message_id,
            correlation_id: row.correlation_id,
            causation_path: Vec::new(),
            message_type: row.event_type.clone(),
            module: row.module.clone(),
            schema_version: row.schema_version.clone(),
            payload: row.payload.clone(),
        };

        // Listener resolution happens against the current table; the
        // snapshot frozen at transact time only fixed the handler id.
        let Some(entry) = self.listeners.find(&row.event_type, row.handler_id).await else {
            return AttemptOutcome::terminal_failure("handler_missing", None);
        };

        if let Some(schema) = &entry.schema {
            if !schema.validate(&envelope.payload) {
                return AttemptOutcome::terminal_failure("schema_validation_failed", None);
            }
        }

        let call = AssertUnwindSafe(entry.handler.handle(self, &envelope)).catch_unwind();
        match tokio::time::timeout(self.settings.tx_handler_timeout, call).await {
            Err(_elapsed) => AttemptOutcome::timeout(),
            Ok(Err(_panic)) => AttemptOutcome::retryable_failure(
                "handler_exception",
                Some("handler panicked".to_string()),
            ),
            Ok(Ok(Ok(true))) => AttemptOutcome::success(),
            Ok(Ok(Ok(false))) => {
                AttemptOutcome::retryable_failure("handler_returned_false", None)
            }
            Ok(Ok(Err(err))) => {
                AttemptOutcome::retryable_failure("handler_exception", Some(err.to_string()))
            }
        }
    }

    fn log_attempt(&self, row: &PendingHandler, outcome: &AttemptOutcome, update: &HandlerUpdate) {
        let error_kind = outcome.error.as_ref().map(|err| err.kind);
        match update.status {
            HandlerStatus::Ok => self.log(
                LogLevel::Debug,
                tags::EVENT_DISPATCHED,
                json!({
                    "tx_id": row.tx_id.to_string(),
                    "event_type": row.event_type,
                    "handler_id": row.handler_id.to_string(),
                    "retry_count": update.retry_count,
                }),
            ),
            HandlerStatus::Pending => self.log(
                LogLevel::Warn,
                tags::EVENT_DISPATCH_FAILED,
                json!({
                    "tx_id": row.tx_id.to_string(),
                    "event_type": row.event_type,
                    "handler_id": row.handler_id.to_string(),
                    "error": error_kind,
                    "retry_count": update.retry_count,
                    "next_at": update.next_at,
                }),
            ),
            HandlerStatus::Failed | HandlerStatus::Timeout => self.log(
                LogLevel::Error,
                tags::EVENT_DISPATCH_GIVE_UP,
                json!({
                    "tx_id": row.tx_id.to_string(),
                    "event_type": row.event_type,
                    "handler_id": row.handler_id.to_string(),
                    "error": error_kind,
                    "retry_count": update.retry_count,
                }),
            ),
        }
    }

    async fn maybe_cleanup(&self, store: &Arc<dyn TxStore>, last_cleanup: &mut i64) {
        let (Some(retention), Some(interval)) = (
            self.settings.tx_retention,
            self.settings.tx_cleanup_interval,
        ) else {
            return;
        };

        let now = now_ms();
        if now - *last_cleanup < interval.as_millis() as i64 {
            return;
        }
        *last_cleanup = now;

        match store.cleanup(now, retention.as_millis() as i64).await {
            Ok(purged) => self.log(
                LogLevel::Debug,
                tags::TX_CLEANUP,
                json!({"purged": purged}),
            ),
            Err(err) => self.log(
                LogLevel::Warn,
                tags::TX_CLEANUP_FAILED,
                json!({"error": err.to_string()}),
            ),
        }
    }
}
