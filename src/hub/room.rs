//! Per-document broadcast group.
//!
//! A room owns the membership of client handles for one document and two
//! background tasks:
//!
//! - the **delivery** task drains the room inbox and fans each payload out to
//!   every member except its sender. One inbox per room gives every recipient
//!   the same room-wide order.
//! - the **journal** task appends inbound payloads to the fast cache in arrival
//!   order. It runs off the broadcast path, so a slow or unavailable cache
//!   never delays live delivery.
//!
//! Recipients are fed with `try_send` into their bounded outbound queues. A
//! recipient whose queue is full is evicted from the room: its queue sender
//! is dropped, its outbound pump drains and exits, and the connection closes.
//! Messages are never skipped for a client that stays connected.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::FastCache;
use crate::error::{CollabError, Result};
use crate::hub::client::{ClientHandle, ClientId, DeliveryError};

/// Queue sizes for a room's background tasks.
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    pub inbox_capacity: usize,
    pub journal_capacity: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            journal_capacity: 4096,
        }
    }
}

#[derive(Debug)]
struct Envelope {
    sender: ClientId,
    payload: Bytes,
}

type Members = Arc<RwLock<HashMap<ClientId, ClientHandle>>>;

#[derive(Debug, Default)]
struct RoomCounters {
    delivered: AtomicU64,
    evicted: AtomicU64,
    journal_gaps: AtomicU64,
}

/// Point-in-time counters for one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub clients: usize,
    pub delivered: u64,
    pub evicted: u64,
    pub journal_gaps: u64,
}

pub struct Room {
    doc_id: String,
    members: Members,
    inbox: mpsc::Sender<Envelope>,
    journal: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
    journal_task: Mutex<Option<JoinHandle<()>>>,
    cache: Arc<dyn FastCache>,
    counters: Arc<RoomCounters>,
}

impl Room {
    /// Create a room and spawn its delivery and journal tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(doc_id: impl Into<String>, cache: Arc<dyn FastCache>, settings: RoomSettings) -> Arc<Self> {
        let doc_id = doc_id.into();
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(RoomCounters::default());
        let (closed, _) = watch::channel(false);

        let (inbox, inbox_rx) = mpsc::channel(settings.inbox_capacity.max(1));
        tokio::spawn(run_delivery(
            doc_id.clone(),
            members.clone(),
            counters.clone(),
            inbox_rx,
            closed.subscribe(),
        ));

        let (journal, journal_rx) = mpsc::channel(settings.journal_capacity.max(1));
        let journal_task = tokio::spawn(run_journal(
            doc_id.clone(),
            cache.clone(),
            counters.clone(),
            journal_rx,
            closed.subscribe(),
        ));

        Arc::new(Self {
            doc_id,
            members,
            inbox,
            journal,
            closed,
            journal_task: Mutex::new(Some(journal_task)),
            cache,
            counters,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub(crate) fn cache(&self) -> &Arc<dyn FastCache> {
        &self.cache
    }

    /// Add a member. Returns `false` (and keeps the existing handle) if the
    /// client id is already registered.
    pub fn register(&self, handle: ClientHandle) -> bool {
        let mut members = self.members.write();
        if members.contains_key(&handle.id()) {
            warn!(doc_id = %self.doc_id, client_id = %handle.id(), "Duplicate registration ignored");
            return false;
        }
        info!(
            doc_id = %self.doc_id,
            client_id = %handle.id(),
            user_id = %handle.identity().user_id,
            total = members.len() + 1,
            "Client joined room"
        );
        members.insert(handle.id(), handle);
        true
    }

    /// Remove a member. Unknown ids are a no-op.
    pub fn unregister(&self, client_id: ClientId) -> Option<ClientHandle> {
        let mut members = self.members.write();
        let removed = members.remove(&client_id);
        if removed.is_some() {
            info!(
                doc_id = %self.doc_id,
                client_id = %client_id,
                remaining = members.len(),
                "Client left room"
            );
        }
        removed
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.members.read().contains_key(&client_id)
    }

    pub fn client_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Queue `payload` for every member except `sender`.
    ///
    /// Waits only for room inbox capacity, never for a recipient.
    pub async fn broadcast(&self, sender: ClientId, payload: Bytes) -> Result<()> {
        self.inbox
            .send(Envelope { sender, payload })
            .await
            .map_err(|_| CollabError::Transport(format!("room {} is closed", self.doc_id)))
    }

    /// Hand an inbound update to the journal for caching. Never blocks; a
    /// full journal is logged as a durability gap.
    pub fn record(&self, payload: Bytes) {
        match self.journal.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.journal_gaps.fetch_add(1, Ordering::Relaxed);
                warn!(doc_id = %self.doc_id, "Journal queue full, update not cached");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(doc_id = %self.doc_id, "Journal closed, update not cached");
            }
        }
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            clients: self.client_count(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            journal_gaps: self.counters.journal_gaps.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting traffic and disconnect every member. The journal keeps
    /// running until its queue is drained.
    pub fn close(&self) {
        self.closed.send_replace(true);
        let dropped = std::mem::take(&mut *self.members.write());
        if !dropped.is_empty() {
            info!(doc_id = %self.doc_id, clients = dropped.len(), "Room closed with members");
        }
    }

    /// Wait until every update handed to [`Room::record`] before `close` has
    /// reached the cache (or failed).
    pub async fn wait_drained(&self) {
        let task = self.journal_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(doc_id = %self.doc_id, error = %e, "Journal task failed");
            }
        }
    }
}

async fn run_delivery(
    doc_id: String,
    members: Members,
    counters: Arc<RoomCounters>,
    mut inbox: mpsc::Receiver<Envelope>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.changed() => break,
            envelope = inbox.recv() => match envelope {
                Some(envelope) => fan_out(&doc_id, &members, &counters, envelope),
                None => break,
            },
        }
    }
    debug!(doc_id = %doc_id, "Room delivery stopped");
}

fn fan_out(doc_id: &str, members: &Members, counters: &RoomCounters, envelope: Envelope) {
    let mut evict = Vec::new();
    {
        let members = members.read();
        for (id, handle) in members.iter() {
            if *id == envelope.sender {
                continue;
            }
            match handle.try_deliver(envelope.payload.clone()) {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(reason) => evict.push((*id, reason)),
            }
        }
    }

    if evict.is_empty() {
        return;
    }
    let mut members = members.write();
    for (id, reason) in evict {
        if members.remove(&id).is_some() {
            counters.evicted.fetch_add(1, Ordering::Relaxed);
            match reason {
                DeliveryError::QueueFull => {
                    warn!(doc_id, client_id = %id, "Outbound queue full, disconnecting slow client")
                }
                DeliveryError::Disconnected => {
                    debug!(doc_id, client_id = %id, "Dropping member with closed queue")
                }
            }
        }
    }
}

async fn run_journal(
    doc_id: String,
    cache: Arc<dyn FastCache>,
    counters: Arc<RoomCounters>,
    mut queue: mpsc::Receiver<Bytes>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            update = queue.recv() => match update {
                Some(update) => append(&doc_id, cache.as_ref(), &counters, update).await,
                None => break,
            },
            _ = closed.changed() => {
                queue.close();
                while let Some(update) = queue.recv().await {
                    append(&doc_id, cache.as_ref(), &counters, update).await;
                }
                break;
            }
        }
    }
    debug!(doc_id = %doc_id, "Room journal stopped");
}

async fn append(doc_id: &str, cache: &dyn FastCache, counters: &RoomCounters, update: Bytes) {
    if let Err(e) = cache.append_update(doc_id, update).await {
        counters.journal_gaps.fetch_add(1, Ordering::Relaxed);
        warn!(doc_id, error = %e, code = e.error_code(), "Failed to cache update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::hub::client::ClientIdentity;
    use std::time::Duration;
    use tokio::time::timeout;

    fn cache() -> Arc<dyn FastCache> {
        Arc::new(MemoryCache::new(Duration::from_secs(60), 100))
    }

    fn member(capacity: usize) -> (ClientHandle, mpsc::Receiver<Bytes>) {
        ClientHandle::channel(ClientIdentity::anonymous(), capacity)
    }

    async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Option<Bytes> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let room = Room::new("doc-1", cache(), RoomSettings::default());
        let (a, mut a_rx) = member(8);
        let (b, mut b_rx) = member(8);
        let (c, mut c_rx) = member(8);
        let sender = a.id();
        room.register(a);
        room.register(b);
        room.register(c);

        room.broadcast(sender, Bytes::from_static(b"P")).await.unwrap();

        assert_eq!(recv(&mut b_rx).await, Some(Bytes::from_static(b"P")));
        assert_eq!(recv(&mut c_rx).await, Some(Bytes::from_static(b"P")));
        assert_eq!(recv(&mut a_rx).await, None);
        assert_eq!(recv(&mut b_rx).await, None);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_harmless() {
        let room = Room::new("doc-1", cache(), RoomSettings::default());
        let (a, _a_rx) = member(8);
        assert!(room.register(a.clone()));
        assert!(!room.register(a));
        assert_eq!(room.client_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let room = Room::new("doc-1", cache(), RoomSettings::default());
        let (a, _a_rx) = member(8);
        let id = a.id();
        room.register(a);
        assert!(room.unregister(id).is_some());
        assert!(room.unregister(id).is_none());
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_client_receives_nothing() {
        let room = Room::new("doc-1", cache(), RoomSettings::default());
        let (a, _a_rx) = member(8);
        let (b, mut b_rx) = member(8);
        let sender = a.id();
        let leaving = b.id();
        room.register(a);
        room.register(b);

        room.unregister(leaving);
        room.broadcast(sender, Bytes::from_static(b"P")).await.unwrap();
        assert_eq!(recv(&mut b_rx).await, None);
    }

    #[tokio::test]
    async fn test_slow_client_is_evicted_others_unaffected() {
        let room = Room::new("doc-1", cache(), RoomSettings::default());
        let (sender, _s_rx) = member(8);
        let (slow, _slow_rx) = member(1);
        let (fast, mut fast_rx) = member(16);
        let sender_id = sender.id();
        let slow_id = slow.id();
        room.register(sender);
        room.register(slow);
        room.register(fast);

        for i in 0..4u8 {
            room.broadcast(sender_id, Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..4u8 {
            assert_eq!(recv(&mut fast_rx).await, Some(Bytes::from(vec![i])));
        }
        assert!(!room.contains(slow_id));
        assert_eq!(room.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_room_order_is_shared_by_all_recipients() {
        let room = Room::new("doc-1", cache(), RoomSettings::default());
        let (a, _a_rx) = member(64);
        let (b, _b_rx) = member(64);
        let (x, mut x_rx) = member(64);
        let (y, mut y_rx) = member(64);
        let (a_id, b_id) = (a.id(), b.id());
        for h in [a, b, x, y] {
            room.register(h);
        }

        let ra = room.clone();
        let rb = room.clone();
        let ta = tokio::spawn(async move {
            for i in 0..20u8 {
                ra.broadcast(a_id, Bytes::from(vec![b'a', i])).await.unwrap();
            }
        });
        let tb = tokio::spawn(async move {
            for i in 0..20u8 {
                rb.broadcast(b_id, Bytes::from(vec![b'b', i])).await.unwrap();
            }
        });
        ta.await.unwrap();
        tb.await.unwrap();

        let mut seen_x = Vec::new();
        let mut seen_y = Vec::new();
        for _ in 0..40 {
            seen_x.push(recv(&mut x_rx).await.unwrap());
            seen_y.push(recv(&mut y_rx).await.unwrap());
        }
        assert_eq!(seen_x, seen_y);
    }

    #[tokio::test]
    async fn test_journal_caches_in_arrival_order_and_drains_on_close() {
        let cache = cache();
        let room = Room::new("doc-1", cache.clone(), RoomSettings::default());
        for s in ["a", "b", "c"] {
            room.record(Bytes::copy_from_slice(s.as_bytes()));
        }
        room.close();
        room.wait_drained().await;

        assert_eq!(
            cache.get_updates("doc-1").await.unwrap(),
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }

    /// Backend that is always down.
    struct UnavailableCache;

    #[async_trait::async_trait]
    impl FastCache for UnavailableCache {
        async fn put_snapshot(&self, _doc_id: &str, _payload: Bytes) -> Result<()> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
        async fn get_snapshot(&self, _doc_id: &str) -> Result<Option<Bytes>> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
        async fn append_update(&self, _doc_id: &str, _payload: Bytes) -> Result<()> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
        async fn get_updates(&self, _doc_id: &str) -> Result<Vec<Bytes>> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
        async fn clear_updates(&self, _doc_id: &str) -> Result<()> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
        async fn trim_consumed(&self, _doc_id: &str, _consumed: usize) -> Result<()> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
        async fn refresh_ttl(&self, _doc_id: &str) -> Result<()> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
        async fn list_active_document_ids(&self) -> Result<std::collections::BTreeSet<String>> {
            Err(CollabError::CacheUnavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_cache_outage_keeps_broadcast_and_counts_gap() {
        let room = Room::new("doc-1", Arc::new(UnavailableCache), RoomSettings::default());
        let (a, _a_rx) = member(8);
        let (b, mut b_rx) = member(8);
        let sender = a.id();
        room.register(a);
        room.register(b);

        room.record(Bytes::from_static(b"P"));
        room.broadcast(sender, Bytes::from_static(b"P")).await.unwrap();
        assert_eq!(recv(&mut b_rx).await, Some(Bytes::from_static(b"P")));

        room.close();
        room.wait_drained().await;
        assert_eq!(room.stats().journal_gaps, 1);
    }

    #[tokio::test]
    async fn test_close_disconnects_members() {
        let room = Room::new("doc-1", cache(), RoomSettings::default());
        let (a, mut a_rx) = member(8);
        room.register(a);
        room.close();
        assert!(room.is_empty());
        // Sender side dropped: the queue reports closed.
        assert_eq!(a_rx.recv().await, None);
    }
}
