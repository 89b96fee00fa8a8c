//! Redis cache backend.
//!
//! Key layout follows [`KeySpace`]: the snapshot is a plain string value, the
//! update log a list. Append, trim and expiry refresh go out as one atomic
//! pipeline (`MULTI`/`EXEC`), so concurrent appenders for the same document
//! each land exactly once.

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::cache::{FastCache, KeySpace};
use crate::config::CacheConfig;
use crate::error::Result;

/// Keys fetched per `SCAN` round trip during discovery.
const SCAN_BATCH: usize = 100;

/// Cache backend over a shared, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    keys: KeySpace,
    ttl_secs: i64,
    max_updates: isize,
}

impl RedisCache {
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %config.redis_url, "Connected to Redis cache");
        Ok(Self {
            conn,
            keys: KeySpace::new(config.key_prefix.clone()),
            ttl_secs: config.ttl_secs as i64,
            max_updates: config.max_updates.max(1) as isize,
        })
    }

    /// Same connection and limits, keys under `prefix`.
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            keys: KeySpace::new(prefix),
            ..self.clone()
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl FastCache for RedisCache {
    async fn put_snapshot(&self, doc_id: &str, state: Bytes) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(self.keys.state_key(doc_id))
            .arg(state.as_ref())
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        debug!(doc_id, bytes = state.len(), "Cached snapshot");
        Ok(())
    }

    async fn get_snapshot(&self, doc_id: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn();
        let data: Option<Vec<u8>> = conn.get(self.keys.state_key(doc_id)).await?;
        Ok(data.map(Bytes::from))
    }

    async fn append_update(&self, doc_id: &str, delta: Bytes) -> Result<()> {
        let mut conn = self.conn();
        let updates = self.keys.updates_key(doc_id);
        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(&updates)
            .arg(delta.as_ref())
            .ignore()
            .cmd("LTRIM")
            .arg(&updates)
            .arg(-self.max_updates)
            .arg(-1)
            .ignore()
            .cmd("EXPIRE")
            .arg(&updates)
            .arg(self.ttl_secs)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.keys.state_key(doc_id))
            .arg(self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_updates(&self, doc_id: &str) -> Result<Vec<Bytes>> {
        let mut conn = self.conn();
        let entries: Vec<Vec<u8>> = conn.lrange(self.keys.updates_key(doc_id), 0, -1).await?;
        Ok(entries.into_iter().map(Bytes::from).collect())
    }

    async fn clear_updates(&self, doc_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(self.keys.updates_key(doc_id)).await?;
        Ok(())
    }

    async fn trim_consumed(&self, doc_id: &str, consumed: usize) -> Result<()> {
        if consumed == 0 {
            return Ok(());
        }
        let mut conn = self.conn();
        // LTRIM past the end leaves an empty list, which Redis deletes.
        let _: () = redis::cmd("LTRIM")
            .arg(self.keys.updates_key(doc_id))
            .arg(consumed)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn refresh_ttl(&self, doc_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .cmd("EXPIRE")
            .arg(self.keys.state_key(doc_id))
            .arg(self.ttl_secs)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.keys.updates_key(doc_id))
            .arg(self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_active_document_ids(&self) -> Result<BTreeSet<String>> {
        let mut conn = self.conn();
        let pattern = self.keys.scan_pattern();
        let mut ids = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            ids.extend(
                batch
                    .iter()
                    .filter_map(|key| self.keys.doc_id_of(key))
                    .map(str::to_string),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(ids)
    }
}

/// These run against a live server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`.
/// Each test works under its own random key prefix.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackend;

    async fn cache(max_updates: usize) -> Option<RedisCache> {
        let Ok(redis_url) = std::env::var("REDIS_URL") else {
            eprintln!("REDIS_URL not set; skipping");
            return None;
        };
        let config = CacheConfig {
            backend: CacheBackend::Redis,
            redis_url,
            key_prefix: format!("test-{}", uuid::Uuid::new_v4()),
            ttl_secs: 60,
            max_updates,
            ..CacheConfig::default()
        };
        Some(RedisCache::connect(&config).await.unwrap())
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    async fn ttl_of(cache: &RedisCache, key: String) -> i64 {
        let mut conn = cache.conn();
        conn.ttl(key).await.unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_updates_in_append_order() {
        let Some(cache) = cache(10).await else { return };
        for s in ["a", "b", "c"] {
            cache.append_update("doc-1", b(s)).await.unwrap();
        }
        assert_eq!(
            cache.get_updates("doc-1").await.unwrap(),
            vec![b("a"), b("b"), b("c")]
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_overflow_drops_exactly_the_oldest() {
        let Some(cache) = cache(3).await else { return };
        for s in ["1", "2", "3", "4", "5"] {
            cache.append_update("doc-1", b(s)).await.unwrap();
        }
        assert_eq!(
            cache.get_updates("doc-1").await.unwrap(),
            vec![b("3"), b("4"), b("5")]
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_clear_then_get_is_empty() {
        let Some(cache) = cache(10).await else { return };
        cache.append_update("doc-1", b("a")).await.unwrap();
        cache.clear_updates("doc-1").await.unwrap();
        assert!(cache.get_updates("doc-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_trim_consumed_keeps_later_appends() {
        let Some(cache) = cache(10).await else { return };
        cache.append_update("doc-1", b("a")).await.unwrap();
        cache.append_update("doc-1", b("b")).await.unwrap();
        let read = cache.get_updates("doc-1").await.unwrap();
        cache.append_update("doc-1", b("late")).await.unwrap();
        cache.trim_consumed("doc-1", read.len()).await.unwrap();
        assert_eq!(cache.get_updates("doc-1").await.unwrap(), vec![b("late")]);

        cache.trim_consumed("doc-1", 5).await.unwrap();
        assert!(cache.get_updates("doc-1").await.unwrap().is_empty());
        cache.trim_consumed("doc-1", 0).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_snapshot_replace_and_miss() {
        let Some(cache) = cache(10).await else { return };
        assert!(cache.get_snapshot("doc-1").await.unwrap().is_none());
        cache.put_snapshot("doc-1", b("v1")).await.unwrap();
        cache.put_snapshot("doc-1", Bytes::from_static(&[0, 0xff, 1])).await.unwrap();
        assert_eq!(
            cache.get_snapshot("doc-1").await.unwrap(),
            Some(Bytes::from_static(&[0, 0xff, 1]))
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_writes_and_refresh_set_expiry() {
        let Some(cache) = cache(10).await else { return };
        cache.put_snapshot("doc-1", b("s")).await.unwrap();
        cache.append_update("doc-1", b("a")).await.unwrap();
        let state_ttl = ttl_of(&cache, cache.keys.state_key("doc-1")).await;
        let updates_ttl = ttl_of(&cache, cache.keys.updates_key("doc-1")).await;
        assert!((1..=60).contains(&state_ttl));
        assert!((1..=60).contains(&updates_ttl));

        let mut conn = cache.conn();
        let _: () = conn.expire(cache.keys.state_key("doc-1"), 5).await.unwrap();
        cache.refresh_ttl("doc-1").await.unwrap();
        assert!(ttl_of(&cache, cache.keys.state_key("doc-1")).await > 5);

        cache.refresh_ttl("missing").await.unwrap();
        assert!(cache.get_snapshot("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_scan_discovers_ids_in_own_prefix() {
        let Some(cache) = cache(10).await else { return };
        let other = cache.with_prefix(format!("test-{}", uuid::Uuid::new_v4()));
        cache.append_update("doc-1", b("a")).await.unwrap();
        cache.put_snapshot("a:b", b("s")).await.unwrap();
        for i in 0..(SCAN_BATCH * 2) {
            other.put_snapshot(&format!("other-{i}"), b("x")).await.unwrap();
        }
        cache.append_update("doc-3", b("c")).await.unwrap();
        cache.clear_updates("doc-3").await.unwrap();

        let ids: Vec<_> = cache.list_active_document_ids().await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["a:b".to_string(), "doc-1".to_string()]);
        assert_eq!(other.list_active_document_ids().await.unwrap().len(), SCAN_BATCH * 2);
    }

    #[tokio::test]
    #[ignore]
    async fn test_concurrent_appends_each_present_once() {
        let Some(cache) = cache(1000).await else { return };
        let mut tasks = Vec::new();
        for t in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    cache.append_update("doc-1", Bytes::from(format!("{t}-{i}"))).await.unwrap();
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
