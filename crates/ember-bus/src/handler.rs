//! Listener registrations and the handler interface.
//!
//! The listener table is a concurrent, insertion-ordered mapping from event
//! type to registrations. Mutations serialize against the snapshots taken
//! by `publish` and `transact`; a snapshot never observes a half-applied
//! change.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use ember_core::{Envelope, HandlerId, SchemaRef};

use crate::Bus;

//─────────────────────────────
//  Handler interface
//─────────────────────────────

/// Uniform interface every listener implements.
///
/// `Ok(true)` reports success. On the transactional path, `Ok(false)` and
/// `Err(_)` are retryable failures; on the fire-and-forget path the return
/// value is ignored and errors are only logged.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one envelope.
    async fn handle(&self, bus: &Bus, envelope: &Envelope) -> anyhow::Result<bool>;
}

/// Adapter turning a plain async closure into a [`Handler`].
///
/// The closure receives an owned envelope clone and no bus reference;
/// listeners that republish implement [`Handler`] directly.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn handle(&self, _bus: &Bus, envelope: &Envelope) -> anyhow::Result<bool> {
        (self.f)(envelope.clone()).await
    }
}

/// Shorthand for `Arc::new(FnHandler::new(f))` as a trait object.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

//─────────────────────────────
//  Registrations
//─────────────────────────────

/// One listener registration.
#[derive(Clone)]
pub struct ListenerEntry {
    /// Stable identity token, minted at subscribe time.
    pub id: HandlerId,
    /// The handler itself.
    pub handler: Arc<dyn Handler>,
    /// Optional subscriber-level schema gating only this listener.
    pub schema: Option<SchemaRef>,
    /// Opaque metadata, usable as an unsubscribe key.
    pub meta: Option<Value>,
    /// Whether the registration asked for a durable inbox.
    pub inbox: bool,
}

impl core::fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("inbox", &self.inbox)
            .finish()
    }
}

/// Options accepted by [`Bus::subscribe`](crate::Bus::subscribe).
#[derive(Default)]
pub struct SubscribeOpts {
    /// Subscriber-level schema; failures skip this listener only.
    pub schema: Option<SchemaRef>,
    /// Opaque metadata attached to the registration.
    pub meta: Option<Value>,
    /// Request a durable inbox; requires a configured store.
    pub inbox: bool,
}

impl SubscribeOpts {
    /// Attach a subscriber-level schema.
    pub fn with_schema(mut self, schema: impl ember_core::PayloadSchema + 'static) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Attach opaque metadata.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Request a durable inbox.
    pub fn with_inbox(mut self) -> Self {
        self.inbox = true;
        self
    }
}

/// Key used by unsubscribe to select registrations.
#[derive(Clone)]
pub enum Matcher {
    /// Remove entries whose handler is the same allocation.
    Handler(Arc<dyn Handler>),
    /// Remove entries whose metadata equals this value.
    Meta(Value),
}

impl Matcher {
    fn matches(&self, entry: &ListenerEntry) -> bool {
        match self {
            Self::Handler(handler) => Arc::ptr_eq(&entry.handler, handler),
            Self::Meta(meta) => entry.meta.as_ref() == Some(meta),
        }
    }
}

//─────────────────────────────
//  Listener table
//─────────────────────────────

/// Concurrent, insertion-ordered registry of listeners per event type.
#[derive(Debug, Default)]
pub(crate) struct ListenerTable {
    inner: RwLock<HashMap<String, Vec<ListenerEntry>>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a registration, preserving subscription order.
    pub async fn insert(&self, event_type: &str, entry: ListenerEntry) {
        self.inner
            .write()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push(entry);
    }

    /// Remove matching registrations, returning how many went away.
    pub async fn remove(&self, event_type: &str, matcher: &Matcher) -> usize {
        let mut inner = self.inner.write().await;
        let Some(entries) = inner.get_mut(event_type) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|entry| !matcher.matches(entry));
        let removed = before - entries.len();
        if entries.is_empty() {
            inner.remove(event_type);
        }
        removed
    }

    /// Purge one event type, or everything.
    pub async fn clear(&self, event_type: Option<&str>) {
        let mut inner = self.inner.write().await;
        match event_type {
            Some(event_type) => {
                inner.remove(event_type);
            }
            None => inner.clear(),
        }
    }

    /// Registration count for one event type, or in total.
    pub async fn count(&self, event_type: Option<&str>) -> usize {
        let inner = self.inner.read().await;
        match event_type {
            Some(event_type) => inner.get(event_type).map_or(0, Vec::len),
            None => inner.values().map(Vec::len).sum(),
        }
    }

    /// Snapshot of one event type's registrations, in subscription order.
    pub async fn entries(&self, event_type: &str) -> Vec<ListenerEntry> {
        self.inner
            .read()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up one registration by id.
    pub async fn find(&self, event_type: &str, id: HandlerId) -> Option<ListenerEntry> {
        self.inner
            .read()
            .await
            .get(event_type)?
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    /// Project the whole table to handler ids, for transact snapshots.
    pub async fn snapshot_ids(&self) -> HashMap<String, Vec<HandlerId>> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(event_type, entries)| {
                (
                    event_type.clone(),
                    entries.iter().map(|entry| entry.id).collect(),
                )
            })
            .collect()
    }
}
