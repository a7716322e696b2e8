#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ember-bus** – In-process event bus with a durable transactional
//! delivery path.
//!
//! The bus offers two delivery modes over one publish/subscribe surface:
//!
//! * [`Bus::publish`] – fire-and-forget dispatch. The payload is gated by
//!   the schema registry, wrapped in an immutable [`Envelope`] carrying
//!   correlation and causation metadata, and handed to every listener on a
//!   concurrent executor ([`DispatchMode`]).
//! * [`Bus::transact`] – durable at-least-once delivery. The event batch is
//!   validated, persisted atomically through a [`TxStore`] backend, and a
//!   background worker drives one handler row per `(message, listener)`
//!   pair through retries, backoff and timeouts. The caller gets a
//!   [`TxHandle`] that resolves exactly once with the terminal outcome.
//!
//! Store drivers live in `ember-store-memory` and `ember-store-sqlite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ember_core::envelope::{DeriveOpts, RootOpts};
use ember_core::logger::tags;
use ember_core::{SafeLogger, DEFAULT_SCHEMA_VERSION};

mod completion;
mod config;
mod dispatch;
mod handler;
mod worker;

pub use completion::{TxErrorKind, TxHandle, TxResult};
pub use config::{
    BusConfig, DispatchMode, DEFAULT_BUFFER_SIZE, DEFAULT_CONCURRENCY, DEFAULT_HANDLER_BACKOFF,
    DEFAULT_HANDLER_MAX_RETRIES, DEFAULT_MAX_DEPTH, DEFAULT_POLL_INTERVAL,
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TX_CLEANUP_INTERVAL, DEFAULT_TX_HANDLER_TIMEOUT,
    DEFAULT_TX_RETENTION,
};
pub use handler::{handler_fn, FnHandler, Handler, ListenerEntry, Matcher, SubscribeOpts};

pub use ember_core::{
    BusError, BusLogger, CausationStep, Envelope, HandlerId, LogLevel, NullLogger, PayloadSchema,
    SchemaRegistry, TracingLogger,
};
pub use ember_store_core::{EventDraft, PayloadFormat, TxStatus, TxStore};

use completion::CompletionTable;
use config::Settings;
use dispatch::Dispatcher;
use handler::ListenerTable;

//─────────────────────────────
//  Publish options
//─────────────────────────────

/// Options accepted by [`Bus::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOpts {
    /// Module tag of the publisher. Required.
    pub module: String,
    /// Schema version; defaults to `"1.0"`.
    pub schema_version: Option<String>,
    /// Correlation id to join an existing chain (root envelopes only).
    pub correlation_id: Option<Uuid>,
    /// Parent envelope to derive from; activates cycle and depth checks.
    pub parent: Option<Envelope>,
}

impl PublishOpts {
    /// Options with just a module tag.
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    /// Override the schema version.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    /// Join an existing correlation chain.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Derive from a parent envelope.
    pub fn with_parent(mut self, parent: Envelope) -> Self {
        self.parent = Some(parent);
        self
    }
}

//─────────────────────────────
//  The bus
//─────────────────────────────

/// The event bus. Construct with [`Bus::new`]; share as `Arc<Bus>`.
pub struct Bus {
    pub(crate) self_ref: Weak<Bus>,
    pub(crate) registry: SchemaRegistry,
    pub(crate) listeners: ListenerTable,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) store: Option<Arc<dyn TxStore>>,
    pub(crate) completions: CompletionTable,
    pub(crate) logger: SafeLogger,
    pub(crate) settings: Settings,
    pub(crate) closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    pub(crate) worker: StdMutex<Option<JoinHandle<()>>>,
}

impl Bus {
    /// Build a bus from options, initialize the store when one is
    /// configured, and start the transaction worker.
    ///
    /// Fails with [`BusError::MissingSchemaRegistry`] when the options
    /// carry no registry. Must be called inside a tokio runtime.
    pub async fn new(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let settings = Settings::from_config(&config);
        let BusConfig {
            mode,
            logger,
            schema_registry,
            tx_store,
            ..
        } = config;

        let registry = schema_registry.ok_or(BusError::MissingSchemaRegistry)?;
        let logger = SafeLogger::new(logger.unwrap_or_else(|| Arc::new(TracingLogger)));
        if let Some(store) = &tx_store {
            store.init().await?;
        }
        let has_store = tx_store.is_some();

        let bus = Arc::new_cyclic(|self_ref| Bus {
            self_ref: self_ref.clone(),
            registry,
            listeners: ListenerTable::new(),
            dispatcher: Dispatcher::new(mode),
            store: tx_store,
            completions: CompletionTable::new(),
            logger,
            settings,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            worker: StdMutex::new(None),
        });

        if has_store {
            let handle = tokio::spawn(worker::run(Arc::downgrade(&bus), bus.cancel.clone()));
            *bus.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        Ok(bus)
    }

    //─────────────────────────────
    //  Subscription surface
    //─────────────────────────────

    /// Register a listener for an event type, in subscription order.
    ///
    /// Returns the registration's stable [`HandlerId`].
    pub async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn Handler>,
        opts: SubscribeOpts,
    ) -> Result<HandlerId, BusError> {
        self.ensure_open()?;
        if opts.inbox && self.store.is_none() {
            return Err(BusError::InboxRequiresStore);
        }

        let id = HandlerId::new();
        self.listeners
            .insert(
                event_type,
                ListenerEntry {
                    id,
                    handler,
                    schema: opts.schema,
                    meta: opts.meta,
                    inbox: opts.inbox,
                },
            )
            .await;
        Ok(id)
    }

    /// Remove listeners matching a handler reference or a meta value,
    /// returning how many were removed.
    pub async fn unsubscribe(
        &self,
        event_type: &str,
        matcher: Matcher,
    ) -> Result<usize, BusError> {
        self.ensure_open()?;
        Ok(self.listeners.remove(event_type, &matcher).await)
    }

    /// Purge listeners for one event type, or all of them.
    pub async fn clear_listeners(&self, event_type: Option<&str>) -> Result<(), BusError> {
        self.ensure_open()?;
        self.listeners.clear(event_type).await;
        Ok(())
    }

    /// Listener count for one event type, or in total.
    pub async fn listener_count(&self, event_type: Option<&str>) -> usize {
        self.listeners.count(event_type).await
    }

    //─────────────────────────────
    //  Fire-and-forget publish
    //─────────────────────────────

    /// Validate, wrap and dispatch one event to every listener.
    ///
    /// Returns the envelope that was dispatched; handler outcomes never
    /// surface here. In buffered mode a saturated queue rejects the
    /// publish with [`BusError::BufferFull`].
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Value,
        opts: PublishOpts,
    ) -> Result<Envelope, BusError> {
        self.ensure_open()?;
        if opts.module.is_empty() {
            return Err(BusError::MissingModule);
        }

        let envelope = match &opts.parent {
            Some(parent) => parent.derive(
                event_type,
                payload,
                DeriveOpts {
                    module: opts.module.clone(),
                    schema_version: opts.schema_version.clone(),
                    max_depth: Some(self.settings.max_depth),
                },
            )?,
            None => Envelope::root(
                event_type,
                payload,
                RootOpts {
                    module: opts.module.clone(),
                    correlation_id: opts.correlation_id,
                    schema_version: opts.schema_version.clone(),
                },
            )?,
        };

        let Some(schema) = self.registry.lookup(event_type, &envelope.schema_version) else {
            self.log(
                LogLevel::Warn,
                tags::PUBLISH_SCHEMA_MISSING,
                json!({
                    "event_type": event_type,
                    "schema_version": envelope.schema_version,
                }),
            );
            return Err(BusError::SchemaMissing {
                event_type: event_type.to_string(),
                schema_version: envelope.schema_version,
            });
        };
        if !schema.validate(&envelope.payload) {
            self.log(
                LogLevel::Warn,
                tags::PUBLISH_SCHEMA_VALIDATION_FAILED,
                json!({
                    "event_type": event_type,
                    "schema_version": envelope.schema_version,
                    "message_id": envelope.message_id.to_string(),
                }),
            );
            return Err(BusError::SchemaValidation {
                event_type: event_type.to_string(),
                schema_version: envelope.schema_version,
            });
        }

        self.log(
            LogLevel::Debug,
            tags::EVENT_PUBLISHED,
            json!({
                "event_type": event_type,
                "module": envelope.module,
                "message_id": envelope.message_id.to_string(),
                "correlation_id": envelope.correlation_id.to_string(),
                "depth": envelope.depth(),
            }),
        );

        for entry in self.listeners.entries(event_type).await {
            if let Some(subscriber_schema) = &entry.schema {
                if !subscriber_schema.validate(&envelope.payload) {
                    self.log(
                        LogLevel::Warn,
                        tags::SCHEMA_VALIDATION_FAILED,
                        json!({
                            "event_type": event_type,
                            "handler_id": entry.id.to_string(),
                            "message_id": envelope.message_id.to_string(),
                        }),
                    );
                    continue;
                }
            }

            let bus = self.shared()?;
            let envelope = envelope.clone();
            let logger = self.logger.clone();
            let handler = Arc::clone(&entry.handler);
            let handler_id = entry.id;
            let task = async move {
                let call =
                    std::panic::AssertUnwindSafe(handler.handle(&bus, &envelope)).catch_unwind();
                match call.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => logger.log(
                        LogLevel::Error,
                        tags::HANDLER_FAILED,
                        json!({
                            "event_type": envelope.message_type,
                            "handler_id": handler_id.to_string(),
                            "error": err.to_string(),
                        }),
                    ),
                    Err(_panic) => logger.log(
                        LogLevel::Error,
                        tags::HANDLER_FAILED,
                        json!({
                            "event_type": envelope.message_type,
                            "handler_id": handler_id.to_string(),
                            "error": "handler panicked",
                        }),
                    ),
                }
            }
            .boxed();

            match self.dispatcher.submit(task) {
                Ok(()) => {}
                Err(BusError::BufferFull) => {
                    self.log(
                        LogLevel::Warn,
                        tags::BUFFER_FULL,
                        json!({
                            "event_type": event_type,
                            "handler_id": entry.id.to_string(),
                        }),
                    );
                    return Err(BusError::BufferFull);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(envelope)
    }

    //─────────────────────────────
    //  Durable transact
    //─────────────────────────────

    /// Validate a batch of events, persist it atomically, and return a
    /// one-shot [`TxHandle`] resolved by the background worker.
    ///
    /// Any validation failure raises before the store is touched. A batch
    /// that produces no handler rows (no subscribers) completes
    /// immediately with a successful result.
    pub async fn transact(&self, events: Vec<EventDraft>) -> Result<TxHandle, BusError> {
        self.ensure_open()?;
        let store = self.store.clone().ok_or(BusError::NoTxStore)?;
        if events.is_empty() {
            return Err(BusError::EmptyTransaction);
        }

        for event in &events {
            if event.module.is_empty() {
                return Err(BusError::MissingModule);
            }
            if event.event_type.is_empty() {
                return Err(BusError::MissingEventType);
            }
            let version = event
                .schema_version
                .as_deref()
                .unwrap_or(DEFAULT_SCHEMA_VERSION);
            let Some(schema) = self.registry.lookup(&event.event_type, version) else {
                return Err(BusError::SchemaMissing {
                    event_type: event.event_type.clone(),
                    schema_version: version.to_string(),
                });
            };
            if !schema.validate(&event.payload) {
                return Err(BusError::SchemaValidation {
                    event_type: event.event_type.clone(),
                    schema_version: version.to_string(),
                });
            }
        }

        let tx_id = Uuid::new_v4();
        let now = ember_core::now_ms();
        let snapshot = self.listeners.snapshot_ids().await;
        let data = ember_store_core::build_tx_data(
            tx_id,
            now,
            &events,
            &snapshot,
            self.settings.payload_format,
        )?;
        let handler_count = data.handler_count();

        // Registered before the append: the worker may poll committed
        // rows before this task resumes.
        let handle = if handler_count == 0 {
            None
        } else {
            Some(self.completions.register(tx_id))
        };
        if let Err(err) = store.append_tx(&data).await {
            self.completions.discard(tx_id);
            return Err(err.into());
        }

        self.log(
            LogLevel::Info,
            tags::TX_CREATED,
            json!({
                "tx_id": tx_id.to_string(),
                "events": data.msgs.len(),
                "handlers": handler_count,
            }),
        );
        for msg in &data.msgs {
            self.log(
                LogLevel::Debug,
                tags::EVENT_PERSISTED,
                json!({
                    "tx_id": tx_id.to_string(),
                    "msg_id": msg.msg_id.to_string(),
                    "event_type": msg.event_type,
                }),
            );
        }

        match handle {
            Some(handle) => Ok(handle),
            // No subscribers at snapshot time: the batch is persisted but
            // there is nothing to wait for.
            None => {
                store
                    .update_tx(tx_id, TxStatus::Ok, ember_core::now_ms())
                    .await?;
                Ok(TxHandle::completed(TxResult::success(tx_id)))
            }
        }
    }

    /// Aggregated status of a transaction, live or historical.
    pub async fn tx_status(&self, tx_id: Uuid) -> Result<TxStatus, BusError> {
        let store = self.store.clone().ok_or(BusError::NoTxStore)?;
        Ok(store.tx_status(tx_id).await?)
    }

    //─────────────────────────────
    //  Lifecycle
    //─────────────────────────────

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the bus: stop the worker, drain the dispatcher within
    /// `timeout` (default per config), and reject further operations.
    /// Idempotent.
    pub async fn close(&self, timeout: Option<Duration>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let timeout = timeout.unwrap_or(self.settings.shutdown_timeout);

        self.log(LogLevel::Info, tags::BUS_CLOSING, json!({}));
        self.cancel.cancel();

        let mut drained = true;
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                abort.abort();
                drained = false;
            }
        }

        if !self.dispatcher.shutdown(timeout).await {
            drained = false;
        }
        if !drained {
            self.log(
                LogLevel::Warn,
                tags::SHUTDOWN_TIMEOUT,
                json!({"timeout_ms": timeout.as_millis() as u64}),
            );
        }

        self.log(LogLevel::Info, tags::BUS_CLOSED, json!({}));
    }

    //─────────────────────────────
    //  Internals
    //─────────────────────────────

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    fn shared(&self) -> Result<Arc<Bus>, BusError> {
        self.self_ref.upgrade().ok_or(BusError::Closed)
    }

    pub(crate) fn log(&self, level: LogLevel, event: &str, fields: Value) {
        self.logger.log(level, event, fields);
    }
}

impl core::fmt::Debug for Bus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus")
            .field("closed", &self.is_closed())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_requires_registry() {
        let err = Bus::new(BusConfig::default()).await.err();
        assert!(matches!(err, Some(BusError::MissingSchemaRegistry)));
    }
}
