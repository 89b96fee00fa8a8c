//! SQLite-backed [`DocumentStore`].

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::storage::{DocumentStore, StoredState};

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

const DOCUMENT_TABLE: &str = "document_states";
const NOTE_TABLE: &str = "note_states";

fn schema(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    doc_id       TEXT PRIMARY KEY NOT NULL,
    state        BLOB NOT NULL,
    state_vector BLOB NOT NULL,
    updated_at   TEXT NOT NULL
)"
    )
}

/// One table per [`Channel`], all in the same database file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: &'static str,
}

impl SqliteStore {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open (creating if needed) the database at `path`. `":memory:"` opens a
    /// private in-memory database.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = if path == ":memory:" {
            // Shared-cache name unique per call so parallel tests never collide.
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let uri = format!(
                "file:collab-relay-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );
            let options = SqliteConnectOptions::new()
                .filename(&uri)
                .shared_cache(true)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        warn!(path = %parent.display(), error = %e, "Failed to create database directory");
                    }
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        };

        for table in [DOCUMENT_TABLE, NOTE_TABLE] {
            sqlx::query(&schema(table)).execute(&pool).await?;
        }
        info!(path = %path, "Document store ready");
        Ok(Self {
            pool,
            table: DOCUMENT_TABLE,
        })
    }

    /// View of the same database that reads and writes `channel`'s table.
    pub fn channel(&self, channel: Channel) -> Self {
        let table = match channel {
            Channel::Document => DOCUMENT_TABLE,
            Channel::Note => NOTE_TABLE,
        };
        Self {
            pool: self.pool.clone(),
            table,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn load_latest_state(&self, doc_id: &str) -> Result<Option<StoredState>> {
        let sql = format!(
            "SELECT state, state_vector FROM {} WHERE doc_id = ?",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| StoredState {
            state: row.get("state"),
            state_vector: row.get("state_vector"),
        }))
    }

    async fn save_state(&self, doc_id: &str, state: &[u8], state_vector: &[u8]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (doc_id, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(doc_id) DO UPDATE SET
                 state = excluded.state,
                 state_vector = excluded.state_vector,
                 updated_at = excluded.updated_at",
            self.table
        );
        sqlx::query(&sql)
            .bind(doc_id)
            .bind(state)
            .bind(state_vector)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
