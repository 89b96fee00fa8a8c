//! In-process cache backend.
//!
//! Entries live in a concurrent `SkipMap` keyed by document id, each guarded
//! by its own lock, so writers to different documents never contend. Expiry
//! is evaluated lazily on access; expired entries are purged during
//! discovery.

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::FastCache;
use crate::config::CacheConfig;
use crate::error::Result;

#[derive(Debug)]
struct CacheEntry {
    snapshot: Option<Bytes>,
    updates: VecDeque<Bytes>,
    expires_at: Instant,
    /// Set once the entry has been unlinked from the map; holders must re-resolve.
    retired: bool,
}

impl CacheEntry {
    fn new(ttl: Duration) -> Self {
        Self {
            snapshot: None,
            updates: VecDeque::new(),
            expires_at: Instant::now() + ttl,
            retired: false,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.updates.is_empty()
    }

    fn reset(&mut self) {
        self.snapshot = None;
        self.updates.clear();
    }
}

type SharedEntry = Arc<Mutex<CacheEntry>>;

/// Cache backend held entirely in process memory.
pub struct MemoryCache {
    entries: SkipMap<String, SharedEntry>,
    ttl: Duration,
    max_updates: usize,
}

impl MemoryCache {
    pub fn new(ttl: Duration, max_updates: usize) -> Self {
        Self {
            entries: SkipMap::new(),
            ttl,
            max_updates: max_updates.max(1),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_updates)
    }

    /// Run `f` against a live (possibly fresh) entry for `doc_id`.
    fn write<R>(&self, doc_id: &str, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        let shared = self
            .entries
            .get_or_insert(doc_id.to_string(), Arc::new(Mutex::new(CacheEntry::new(self.ttl))))
            .value()
            .clone();
        let mut entry = shared.lock();
        if entry.retired {
            // Unlinked between lookup and lock; resolve the replacement.
            drop(entry);
            return self.write(doc_id, f);
        }
        let now = Instant::now();
        if entry.is_expired(now) {
            entry.reset();
        }
        let result = f(&mut entry);
        entry.expires_at = now + self.ttl;
        result
    }

    /// Run `f` against the entry if it exists and has not expired.
    fn read<R>(&self, doc_id: &str, f: impl FnOnce(&mut CacheEntry) -> R) -> Option<R> {
        let shared = self.entries.get(doc_id)?.value().clone();
        let mut entry = shared.lock();
        if entry.retired || entry.is_expired(Instant::now()) {
            return None;
        }
        let result = f(&mut entry);
        if entry.is_empty() {
            self.unlink(doc_id, &mut entry);
        }
        Some(result)
    }

    fn unlink(&self, doc_id: &str, entry: &mut CacheEntry) {
        entry.retired = true;
        self.entries.remove(doc_id);
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn put_snapshot(&self, doc_id: &str, state: Bytes) -> Result<()> {
        self.write(doc_id, |entry| entry.snapshot = Some(state));
        Ok(())
    }

    async fn get_snapshot(&self, doc_id: &str) -> Result<Option<Bytes>> {
        Ok(self
            .read(doc_id, |entry| entry.snapshot.clone())
            .flatten())
    }

    async fn append_update(&self, doc_id: &str, delta: Bytes) -> Result<()> {
        let max = self.max_updates;
        self.write(doc_id, |entry| {
            entry.updates.push_back(delta);
            while entry.updates.len() > max {
                entry.updates.pop_front();
            }
        });
        Ok(())
    }

    async fn get_updates(&self, doc_id: &str) -> Result<Vec<Bytes>> {
        Ok(self
            .read(doc_id, |entry| entry.updates.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_updates(&self, doc_id: &str) -> Result<()> {
        self.read(doc_id, |entry| entry.updates.clear());
        Ok(())
    }

    async fn trim_consumed(&self, doc_id: &str, consumed: usize) -> Result<()> {
        self.read(doc_id, |entry| {
            let n = consumed.min(entry.updates.len());
            entry.updates.drain(..n);
        });
        Ok(())
    }

    async fn refresh_ttl(&self, doc_id: &str) -> Result<()> {
        let ttl = self.ttl;
        self.read(doc_id, |entry| entry.expires_at = Instant::now() + ttl);
        Ok(())
    }

    async fn list_active_document_ids(&self) -> Result<BTreeSet<String>> {
        let now = Instant::now();
        let mut active = BTreeSet::new();
        for item in self.entries.iter() {
            let mut entry = item.value().lock();
            if entry.retired {
                continue;
            }
            if entry.is_expired(now) || entry.is_empty() {
                self.unlink(item.key(), &mut entry);
                continue;
            }
            active.insert(item.key().clone());
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_updates: usize) -> MemoryCache {
        MemoryCache::new(Duration::from_secs(60), max_updates)
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_updates_in_append_order() {
        let cache = cache(10);
        for s in ["a", "b", "c"] {
            cache.append_update("doc-1", b(s)).await.unwrap();
        }
        assert_eq!(
            cache.get_updates("doc-1").await.unwrap(),
            vec![b("a"), b("b"), b("c")]
        );
    }

    #[tokio::test]
    async fn test_overflow_drops_exactly_the_oldest() {
        let cache = cache(3);
        for s in ["1", "2", "3", "4"] {
            cache.append_update("doc-1", b(s)).await.unwrap();
        }
        assert_eq!(
            cache.get_updates("doc-1").await.unwrap(),
            vec![b("2"), b("3"), b("4")]
        );
    }

    #[tokio::test]
    async fn test_clear_then_get_is_empty() {
        let cache = cache(10);
        cache.append_update("doc-1", b("a")).await.unwrap();
        cache.clear_updates("doc-1").await.unwrap();
        assert!(cache.get_updates("doc-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim_consumed_keeps_later_appends() {
        let cache = cache(10);
        cache.append_update("doc-1", b("a")).await.unwrap();
        cache.append_update("doc-1", b("b")).await.unwrap();
        let read = cache.get_updates("doc-1").await.unwrap();
        cache.append_update("doc-1", b("late")).await.unwrap();
        cache.trim_consumed("doc-1", read.len()).await.unwrap();
        assert_eq!(cache.get_updates("doc-1").await.unwrap(), vec![b("late")]);
    }

    #[tokio::test]
    async fn test_snapshot_replace_and_miss() {
        let cache = cache(10);
        assert!(cache.get_snapshot("doc-1").await.unwrap().is_none());
        cache.put_snapshot("doc-1", b("v1")).await.unwrap();
        cache.put_snapshot("doc-1", b("v2")).await.unwrap();
        assert_eq!(cache.get_snapshot("doc-1").await.unwrap(), Some(b("v2")));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_not_listed() {
        let cache = MemoryCache::new(Duration::from_millis(20), 10);
        cache.append_update("doc-1", b("a")).await.unwrap();
        cache.put_snapshot("doc-1", b("s")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get_updates("doc-1").await.unwrap().is_empty());
        assert!(cache.get_snapshot("doc-1").await.unwrap().is_none());
        assert!(cache.list_active_document_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_ttl_extends_life() {
        let cache = MemoryCache::new(Duration::from_millis(60), 10);
        cache.append_update("doc-1", b("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.refresh_ttl("doc-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get_updates("doc-1").await.unwrap(), vec![b("a")]);
    }

    #[tokio::test]
    async fn test_active_ids_follow_presence() {
        let cache = cache(10);
        cache.append_update("doc-1", b("a")).await.unwrap();
        cache.put_snapshot("doc-2", b("s")).await.unwrap();
        cache.append_update("doc-3", b("c")).await.unwrap();
        cache.clear_updates("doc-3").await.unwrap();

        let ids: Vec<_> = cache.list_active_document_ids().await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["doc-1".to_string(), "doc-2".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_each_present_once() {
        let cache = Arc::new(cache(1000));
        let mut tasks = Vec::new();
        for t in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let payload = Bytes::from(format!("{t}-{i}"));
                    cache.append_update("doc-1", payload).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let updates = cache.get_updates("doc-1").await.unwrap();
        assert_eq!(updates.len(), 400);
        let unique: BTreeSet<_> = updates.iter().collect();
        assert_eq!(unique.len(), 400);
    }
}
