// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite local store.
//!
//! One table per collection, same shape for all four:
//!
//! ```sql
//! CREATE TABLE ledger_entries (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,  -- LocalId, never reused
//!   global_id TEXT UNIQUE,                 -- NULL until first published
//!   is_deleted INTEGER NOT NULL DEFAULT 0,
//!   revision INTEGER NOT NULL,             -- store generation of last write
//!   payload TEXT NOT NULL                  -- JSON of the typed payload
//! )
//! ```
//!
//! plus a `sync_state` key/value table holding the published watermark and
//! the last allocated generation. The database runs in WAL mode.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite};
use tracing::{debug, info};

use crate::config::LedgerSyncConfig;
use crate::record::{Collection, GlobalId, LocalId, Payload, Record};
use crate::resilience::retry::{retry, RetryConfig};
use super::notify::ChangeFeed;
use super::traits::{LocalStore, PurgeStats, StoreError};

const WATERMARK_KEY: &str = "published_watermark";
const GENERATION_KEY: &str = "generation";

#[derive(Clone)]
enum Bind {
    Id(i64),
    Text(String),
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Every connection to an in-memory database is a separate database, so an
/// in-memory pool holds exactly one connection and never retires it.
fn pool_options(in_memory: bool) -> SqlitePoolOptions {
    let options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));
    if in_memory {
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options.max_connections(4)
    }
}

pub struct SqliteLocalStore {
    pool: SqlitePool,
    generation: AtomicU64,
    feed: ChangeFeed,
}

impl SqliteLocalStore {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://ledger.db`.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true)
            .foreign_keys(false);
        if !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                pool_options(in_memory)
                    .connect_with(options)
                    .await
                    .map_err(backend)
            }
        })
        .await?;

        let store = Self {
            pool,
            generation: AtomicU64::new(0),
            feed: ChangeFeed::default(),
        };
        store.init_schema().await?;
        let generation = store.load_generation().await?;
        store.generation.store(generation, Ordering::SeqCst);
        info!(url, generation, "Opened SQLite local store");
        Ok(store)
    }

    /// Open `config.local_url`, or a private in-memory database when unset.
    pub async fn from_config(config: &LedgerSyncConfig) -> Result<Self, StoreError> {
        let url = config.local_url.as_deref().unwrap_or("sqlite::memory:");
        let mut store = Self::new(url).await?;
        store.feed = ChangeFeed::new(config.notify_capacity);
        Ok(store)
    }

    /// A private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::new("sqlite::memory:").await
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for collection in Collection::ALL {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    global_id TEXT UNIQUE,
                    is_deleted INTEGER NOT NULL DEFAULT 0,
                    revision INTEGER NOT NULL DEFAULT 0,
                    payload TEXT NOT NULL
                )",
                collection.table()
            );
            sqlx::query(&sql).execute(&self.pool).await.map_err(backend)?;
        }
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Highest generation ever handed out, so revisions keep increasing across restarts.
    async fn load_generation(&self) -> Result<u64, StoreError> {
        let mut highest = self.read_state(GENERATION_KEY).await?;
        highest = highest.max(self.read_state(WATERMARK_KEY).await?);
        for collection in Collection::ALL {
            let sql = format!("SELECT COALESCE(MAX(revision), 0) FROM {}", collection.table());
            let max: i64 = sqlx::query_scalar(&sql)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
            highest = highest.max(max.max(0) as u64);
        }
        Ok(highest)
    }

    async fn read_state(&self, key: &str) -> Result<u64, StoreError> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    async fn write_state(&self, key: &str, value: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decode<P: Payload>(row: &SqliteRow) -> Result<Record<P>, StoreError> {
        let id = LocalId(row.try_get::<i64, _>("id").map_err(backend)?);
        let global_id: Option<String> = row.try_get("global_id").map_err(backend)?;
        let is_deleted = row.try_get::<i64, _>("is_deleted").map_err(backend)? != 0;
        let revision: i64 = row.try_get("revision").map_err(backend)?;
        let json: String = row.try_get("payload").map_err(backend)?;
        let payload = serde_json::from_str::<P>(&json).map_err(|e| StoreError::Corrupt {
            collection: P::COLLECTION,
            id,
            reason: e.to_string(),
        })?;
        Ok(Record {
            local_id: id,
            global_id: global_id.map(GlobalId::new),
            is_deleted,
            revision: revision.max(0) as u64,
            payload,
        })
    }

    fn encode<P: Payload>(payload: &P) -> Result<String, StoreError> {
        serde_json::to_string(payload)
            .map_err(|e| StoreError::Backend(format!("failed to encode {}: {e}", P::COLLECTION)))
    }

    async fn fetch_where<P: Payload>(
        &self,
        clause: &str,
        bind: Option<Bind>,
    ) -> Result<Vec<Record<P>>, StoreError> {
        let sql = format!(
            "SELECT id, global_id, is_deleted, revision, payload FROM {} {clause} ORDER BY id",
            P::COLLECTION.table()
        );
        let rows = retry("sqlite_fetch", &RetryConfig::query(), || {
            let query = match bind.clone() {
                Some(Bind::Id(id)) => sqlx::query(&sql).bind(id),
                Some(Bind::Text(text)) => sqlx::query(&sql).bind(text),
                None => sqlx::query(&sql),
            };
            async move { query.fetch_all(&self.pool).await.map_err(backend) }
        })
        .await?;
        rows.iter().map(Self::decode::<P>).collect()
    }

    /// Run a single-row write; zero affected rows means the row does not exist.
    async fn touch_row<'q>(
        &self,
        collection: Collection,
        id: LocalId,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<(), StoreError> {
        let result = query.execute(&self.pool).await.map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { collection, id });
        }
        self.feed.notify(collection);
        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn fetch_all<P: Payload>(&self) -> Result<Vec<Record<P>>, StoreError> {
        self.fetch_where::<P>("", None).await
    }

    async fn fetch<P: Payload>(&self, id: LocalId) -> Result<Option<Record<P>>, StoreError> {
        let rows = self
            .fetch_where::<P>("WHERE id = ?", Some(Bind::Id(id.0)))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_by_global_id<P: Payload>(
        &self,
        global_id: &GlobalId,
    ) -> Result<Option<Record<P>>, StoreError> {
        let rows = self
            .fetch_where::<P>("WHERE global_id = ?", Some(Bind::Text(global_id.to_string())))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert<P: Payload>(
        &self,
        global_id: Option<GlobalId>,
        payload: P,
    ) -> Result<LocalId, StoreError> {
        let json = Self::encode(&payload)?;
        let revision = self.bump();
        let sql = format!(
            "INSERT INTO {} (global_id, is_deleted, revision, payload) VALUES (?, 0, ?, ?)",
            P::COLLECTION.table()
        );
        let result = sqlx::query(&sql)
            .bind(global_id.as_ref().map(GlobalId::as_str))
            .bind(revision as i64)
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.feed.notify(P::COLLECTION);
        Ok(LocalId(result.last_insert_rowid()))
    }

    async fn update_fields<P: Payload>(&self, id: LocalId, payload: P) -> Result<(), StoreError> {
        let json = Self::encode(&payload)?;
        let revision = self.bump();
        let sql = format!(
            "UPDATE {} SET payload = ?, revision = ? WHERE id = ?",
            P::COLLECTION.table()
        );
        let query = sqlx::query(&sql).bind(json).bind(revision as i64).bind(id.0);
        self.touch_row(P::COLLECTION, id, query).await
    }

    async fn set_deleted<P: Payload>(&self, id: LocalId, deleted: bool) -> Result<(), StoreError> {
        let revision = self.bump();
        let sql = format!(
            "UPDATE {} SET is_deleted = ?, revision = ? WHERE id = ?",
            P::COLLECTION.table()
        );
        let query = sqlx::query(&sql)
            .bind(i64::from(deleted))
            .bind(revision as i64)
            .bind(id.0);
        self.touch_row(P::COLLECTION, id, query).await
    }

    async fn assign_global_id<P: Payload>(
        &self,
        id: LocalId,
        global_id: GlobalId,
    ) -> Result<(), StoreError> {
        let revision = self.bump();
        let sql = format!(
            "UPDATE {} SET global_id = ?, revision = ? WHERE id = ?",
            P::COLLECTION.table()
        );
        let query = sqlx::query(&sql)
            .bind(global_id.as_str().to_string())
            .bind(revision as i64)
            .bind(id.0);
        self.touch_row(P::COLLECTION, id, query).await
    }

    async fn clear<P: Payload>(&self) -> Result<usize, StoreError> {
        let generation = self.bump();
        let sql = format!("DELETE FROM {}", P::COLLECTION.table());
        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(backend)?;
        self.write_state(GENERATION_KEY, generation).await?;
        let removed = result.rows_affected() as usize;
        if removed > 0 {
            self.feed.notify(P::COLLECTION);
        }
        Ok(removed)
    }

    async fn purge(&self, up_to_revision: Option<u64>) -> Result<PurgeStats, StoreError> {
        let cutoff = up_to_revision.map(|r| r as i64);
        let mut removed = 0usize;
        for collection in Collection::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE is_deleted = 1 AND (?1 IS NULL OR revision <= ?1)",
                collection.table()
            );
            let result = sqlx::query(&sql)
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            removed += result.rows_affected() as usize;
        }
        self.write_state(GENERATION_KEY, self.generation()).await?;

        let compacted = removed > 0;
        if compacted {
            sqlx::query("VACUUM").execute(&self.pool).await.map_err(backend)?;
            debug!(removed, "Compacted local database after purge");
        }
        Ok(PurgeStats { removed, compacted })
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn published_watermark(&self) -> Result<u64, StoreError> {
        self.read_state(WATERMARK_KEY).await
    }

    async fn set_published_watermark(&self, generation: u64) -> Result<(), StoreError> {
        self.write_state(WATERMARK_KEY, generation).await
    }

    fn change_feed(&self) -> &ChangeFeed {
        &self.feed
    }
}
