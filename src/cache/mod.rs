//! Fast cache for per-document snapshots and bounded update logs.
//!
//! The cache is the durability buffer between live traffic and durable
//! storage. Each document owns a snapshot slot and an append-only update log
//! capped at `max_updates` entries (oldest dropped first). Every write
//! refreshes the entry's time-to-live.
//!
//! The set of "active" documents is defined by cache presence alone: the
//! persister discovers work through [`FastCache::list_active_document_ids`]
//! and never needs another source of truth.
//!
//! # Known data-loss windows
//!
//! - An entry untouched for the TTL expires together with its updates, even
//!   if the persister has not flushed them yet.
//! - A document receiving more than `max_updates` updates between two
//!   persistence passes loses the oldest ones.
//!
//! Both windows are known limitations of the bounded cache.

pub mod memory;
pub mod redis_cache;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;

use crate::error::Result;

pub use self::memory::MemoryCache;
pub use self::redis_cache::RedisCache;

/// Operations every cache backend provides. All failures surface as
/// [`CollabError::CacheUnavailable`](crate::CollabError::CacheUnavailable).
#[async_trait]
pub trait FastCache: Send + Sync {
    /// Replace the cached snapshot and reset the TTL.
    async fn put_snapshot(&self, doc_id: &str, state: Bytes) -> Result<()>;

    /// Cached snapshot, or `None` if absent or expired.
    async fn get_snapshot(&self, doc_id: &str) -> Result<Option<Bytes>>;

    /// Append one delta, trim the log to the newest `max_updates` entries and
    /// refresh the TTL, atomically.
    async fn append_update(&self, doc_id: &str, delta: Bytes) -> Result<()>;

    /// Retained deltas in append order. Empty when none.
    async fn get_updates(&self, doc_id: &str) -> Result<Vec<Bytes>>;

    /// Remove every update entry of the document.
    async fn clear_updates(&self, doc_id: &str) -> Result<()>;

    /// Remove only the `consumed` oldest entries. Entries appended after the
    /// caller's read survive, which closes most of the read-then-clear race.
    /// The window that remains: if the log overflowed between the read and
    /// this call, unread entries may be trimmed.
    async fn trim_consumed(&self, doc_id: &str, consumed: usize) -> Result<()>;

    /// Extend the TTL without touching content. No-op for absent documents.
    async fn refresh_ttl(&self, doc_id: &str) -> Result<()>;

    /// Every document with a live cache entry.
    async fn list_active_document_ids(&self) -> Result<BTreeSet<String>>;
}

/// Key layout shared by the backends: `{prefix}:{doc_id}:state` and
/// `{prefix}:{doc_id}:updates`.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

const STATE_SUFFIX: &str = ":state";
const UPDATES_SUFFIX: &str = ":updates";

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn state_key(&self, doc_id: &str) -> String {
        format!("{}:{}{}", self.prefix, doc_id, STATE_SUFFIX)
    }

    pub fn updates_key(&self, doc_id: &str) -> String {
        format!("{}:{}{}", self.prefix, doc_id, UPDATES_SUFFIX)
    }

    /// Glob matching every key in this space.
    pub fn scan_pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Recover the document id from a key. Ids may themselves contain `:`.
    pub fn doc_id_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix(':')?;
        let id = rest
            .strip_suffix(STATE_SUFFIX)
            .or_else(|| rest.strip_suffix(UPDATES_SUFFIX))?;
        (!id.is_empty()).then_some(id)
    }
}
