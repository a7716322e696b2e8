#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ember-store-sqlite** – SQLite store driver for the Ember bus.
//!
//! This crate provides a durable [`TxStore`] backed by an embedded SQLite
//! database via sqlx. The pool is capped at a single connection, which is
//! the in-process writer lock the store contract expects: `append_tx` and
//! every update serialize on it, and the append itself runs inside one
//! database transaction so partial row sets can never become visible.
//!
//! Payloads are stored as serialized text regardless of the configured
//! payload format and decoded at read time.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use ember_store_core::{
    HandlerId, HandlerStatus, HandlerUpdate, PendingHandler, TxData, TxStatus, TxStore,
};

//─────────────────────────────
//  SQLite store
//─────────────────────────────

/// A persistent transactional store on an embedded SQLite database.
#[derive(Debug)]
pub struct SqliteTxStore {
    pool: SqlitePool,
}

impl SqliteTxStore {
    /// Opens or creates the database at the given path and runs migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = Self::single_writer_pool().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Opens an in-memory database, lost when the store is dropped.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = Self::single_writer_pool().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Builds a store from an existing pool and runs migrations.
    ///
    /// Callers supplying their own pool should cap it at one connection;
    /// the store relies on that to serialize writers.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    fn single_writer_pool() -> SqlitePoolOptions {
        // One connection doubles as the writer lock; an in-memory database
        // must never lose its only connection to an idle/lifetime reap.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    }

    /// Create the schema; idempotent.
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txs (
                tx_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS msgs (
                msg_id TEXT PRIMARY KEY,
                tx_id TEXT NOT NULL REFERENCES txs(tx_id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                module TEXT NOT NULL,
                schema_version TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                message_id TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS handlers (
                h_id TEXT PRIMARY KEY,
                msg_id TEXT NOT NULL REFERENCES msgs(msg_id) ON DELETE CASCADE,
                handler_id TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at INTEGER NOT NULL,
                next_at INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_handlers_status_next_at \
             ON handlers(status, next_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_msgs_tx_id ON msgs(tx_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Total number of transactions held.
    pub async fn tx_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM txs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    /// Total number of handler rows held.
    pub async fn handler_row_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM handlers")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TxStore for SqliteTxStore {
    async fn init(&self) -> Result<()> {
        self.migrate().await
    }

    async fn append_tx(&self, data: &TxData) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO txs (tx_id, status, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(data.tx.tx_id.to_string())
        .bind(data.tx.status.as_str())
        .bind(data.tx.created_at)
        .bind(data.tx.updated_at)
        .execute(&mut *db_tx)
        .await?;

        for msg in &data.msgs {
            sqlx::query(
                r#"
                INSERT INTO msgs
                (msg_id, tx_id, event_type, payload, module, schema_version,
                 correlation_id, message_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(msg.msg_id.to_string())
            .bind(msg.tx_id.to_string())
            .bind(&msg.event_type)
            .bind(msg.payload.as_text()?)
            .bind(&msg.module)
            .bind(&msg.schema_version)
            .bind(msg.correlation_id.to_string())
            .bind(msg.message_id.to_string())
            .execute(&mut *db_tx)
            .await?;
        }

        for handler in &data.handlers {
            sqlx::query(
                r#"
                INSERT INTO handlers
                (h_id, msg_id, handler_id, status, retry_count, last_error,
                 updated_at, next_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(handler.h_id.to_string())
            .bind(handler.msg_id.to_string())
            .bind(handler.handler_id.to_string())
            .bind(handler.status.as_str())
            .bind(i64::from(handler.retry_count))
            .bind(handler.last_error.as_deref())
            .bind(handler.updated_at)
            .bind(handler.next_at)
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn pending_handlers(&self, now: i64) -> Result<Vec<PendingHandler>> {
        let rows = sqlx::query(
            r#"
            SELECT h.h_id, h.msg_id, m.tx_id, m.event_type, m.payload, m.module,
                   m.schema_version, m.correlation_id, m.message_id,
                   h.handler_id, h.retry_count
            FROM handlers h
            JOIN msgs m ON m.msg_id = h.msg_id
            WHERE h.status = ? AND h.next_at <= ?
            ORDER BY h.next_at ASC
            "#,
        )
        .bind(HandlerStatus::Pending.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload_text: String = row.get("payload");
            out.push(PendingHandler {
                h_id: parse_uuid(row.get("h_id"))?,
                msg_id: parse_uuid(row.get("msg_id"))?,
                tx_id: parse_uuid(row.get("tx_id"))?,
                event_type: row.get("event_type"),
                payload: serde_json::from_str(&payload_text)?,
                module: row.get("module"),
                schema_version: row.get("schema_version"),
                correlation_id: parse_uuid(row.get("correlation_id"))?,
                message_id: parse_uuid(row.get("message_id"))?,
                handler_id: parse_handler_id(row.get("handler_id"))?,
                retry_count: u32::try_from(row.get::<i64, _>("retry_count"))?,
            });
        }
        Ok(out)
    }

    async fn update_handler(&self, update: &HandlerUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE handlers
            SET status = ?, retry_count = ?, last_error = ?, updated_at = ?, next_at = ?
            WHERE h_id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(i64::from(update.retry_count))
        .bind(update.last_error.as_deref())
        .bind(update.updated_at)
        .bind(update.next_at)
        .bind(update.h_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("unknown handler row {}", update.h_id));
        }
        Ok(())
    }

    async fn tx_status(&self, tx_id: Uuid) -> Result<TxStatus> {
        let rows = sqlx::query(
            r#"
            SELECT h.status
            FROM handlers h
            JOIN msgs m ON m.msg_id = h.msg_id
            WHERE m.tx_id = ?
            "#,
        )
        .bind(tx_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let statuses = rows
            .into_iter()
            .map(|row| HandlerStatus::parse(row.get("status")))
            .collect::<Result<Vec<_>>>()?;
        Ok(TxStatus::aggregate(statuses))
    }

    async fn update_tx(&self, tx_id: Uuid, status: TxStatus, now: i64) -> Result<()> {
        let result = sqlx::query("UPDATE txs SET status = ?, updated_at = ? WHERE tx_id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(tx_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("unknown tx {tx_id}"));
        }
        Ok(())
    }

    async fn cleanup(&self, now: i64, retention_ms: i64) -> Result<u64> {
        let cutoff = now - retention_ms;
        // Cascading deletes take msgs and handler rows with each tx.
        let result = sqlx::query("DELETE FROM txs WHERE status != ? AND updated_at < ?")
            .bind(TxStatus::Pending.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn parse_uuid(text: String) -> Result<Uuid> {
    Ok(Uuid::parse_str(&text)?)
}

fn parse_handler_id(text: String) -> Result<HandlerId> {
    Ok(HandlerId(Uuid::parse_str(&text)?))
}
