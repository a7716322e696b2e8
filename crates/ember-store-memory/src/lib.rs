#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ember-store-memory** – In-memory store driver for the Ember bus.
//!
//! This crate provides a fast, non-persistent [`TxStore`] suitable for
//! testing, development, and deployments that can afford to lose in-flight
//! transactions on restart. All rows live in keyed maps behind one RwLock;
//! the write lock stands in for the single writer the store contract
//! expects. Both payload formats are supported; with
//! [`PayloadFormat::Value`] payloads never round-trip through text.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use ember_store_core::{
    HandlerRow, HandlerStatus, HandlerUpdate, MsgRow, PendingHandler, TxData, TxRow, TxStatus,
    TxStore,
};

#[derive(Debug, Default)]
struct Inner {
    txs: HashMap<Uuid, TxRow>,
    msgs: HashMap<Uuid, MsgRow>,
    handlers: HashMap<Uuid, HandlerRow>,
}

/// An in-memory, non-persistent transactional store.
#[derive(Debug, Default)]
pub struct MemoryTxStore {
    inner: RwLock<Inner>,
}

impl MemoryTxStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions currently held.
    pub async fn tx_count(&self) -> usize {
        self.inner.read().await.txs.len()
    }

    /// Number of handler rows currently held.
    pub async fn handler_count(&self) -> usize {
        self.inner.read().await.handlers.len()
    }

    /// Drop all rows. Useful between test cases.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.txs.clear();
        inner.msgs.clear();
        inner.handlers.clear();
    }
}

#[async_trait]
impl TxStore for MemoryTxStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn append_tx(&self, data: &TxData) -> Result<()> {
        let mut inner = self.inner.write().await;
        // Single map insertions behind one write lock; nothing can observe
        // a partial append.
        inner.txs.insert(data.tx.tx_id, data.tx.clone());
        for msg in &data.msgs {
            inner.msgs.insert(msg.msg_id, msg.clone());
        }
        for row in &data.handlers {
            inner.handlers.insert(row.h_id, row.clone());
        }
        Ok(())
    }

    async fn pending_handlers(&self, now: i64) -> Result<Vec<PendingHandler>> {
        let inner = self.inner.read().await;
        let mut due: Vec<&HandlerRow> = inner
            .handlers
            .values()
            .filter(|row| row.status == HandlerStatus::Pending && row.next_at <= now)
            .collect();
        due.sort_by_key(|row| row.next_at);

        let mut out = Vec::with_capacity(due.len());
        for row in due {
            let msg = inner
                .msgs
                .get(&row.msg_id)
                .ok_or_else(|| anyhow::anyhow!("dangling handler row {}", row.h_id))?;
            out.push(PendingHandler {
                h_id: row.h_id,
                msg_id: msg.msg_id,
                tx_id: msg.tx_id,
                event_type: msg.event_type.clone(),
                payload: msg.payload.decode()?,
                module: msg.module.clone(),
                schema_version: msg.schema_version.clone(),
                correlation_id: msg.correlation_id,
                message_id: msg.message_id,
                handler_id: row.handler_id,
                retry_count: row.retry_count,
            });
        }
        Ok(out)
    }

    async fn update_handler(&self, update: &HandlerUpdate) -> Result<()> {
        let mut inner = self.inner.write().await;
        let row = inner
            .handlers
            .get_mut(&update.h_id)
            .ok_or_else(|| anyhow::anyhow!("unknown handler row {}", update.h_id))?;
        row.status = update.status;
        row.retry_count = update.retry_count;
        row.last_error = update.last_error.clone();
        row.updated_at = update.updated_at;
        row.next_at = update.next_at;
        Ok(())
    }

    async fn tx_status(&self, tx_id: Uuid) -> Result<TxStatus> {
        let inner = self.inner.read().await;
        let msg_ids: Vec<Uuid> = inner
            .msgs
            .values()
            .filter(|msg| msg.tx_id == tx_id)
            .map(|msg| msg.msg_id)
            .collect();
        let statuses = inner
            .handlers
            .values()
            .filter(|row| msg_ids.contains(&row.msg_id))
            .map(|row| row.status);
        Ok(TxStatus::aggregate(statuses))
    }

    async fn update_tx(&self, tx_id: Uuid, status: TxStatus, now: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let tx = inner
            .txs
            .get_mut(&tx_id)
            .ok_or_else(|| anyhow::anyhow!("unknown tx {tx_id}"))?;
        tx.status = status;
        tx.updated_at = now;
        Ok(())
    }

    async fn cleanup(&self, now: i64, retention_ms: i64) -> Result<u64> {
        let cutoff = now - retention_ms;
        let mut inner = self.inner.write().await;

        let stale: Vec<Uuid> = inner
            .txs
            .values()
            .filter(|tx| tx.status.is_terminal() && tx.updated_at < cutoff)
            .map(|tx| tx.tx_id)
            .collect();

        // Cascade: tx -> msgs -> handler rows.
        for tx_id in &stale {
            inner.txs.remove(tx_id);
            let msg_ids: Vec<Uuid> = inner
                .msgs
                .values()
                .filter(|msg| msg.tx_id == *tx_id)
                .map(|msg| msg.msg_id)
                .collect();
            for msg_id in msg_ids {
                inner.msgs.remove(&msg_id);
                inner.handlers.retain(|_, row| row.msg_id != msg_id);
            }
        }
        Ok(stale.len() as u64)
    }
}
