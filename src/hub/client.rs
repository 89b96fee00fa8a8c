//! Client actors.
//!
//! One actor per live connection. The actor is transport-agnostic: it reads
//! [`Frame`]s from any `Stream` and writes them to any `Sink`, so the
//! WebSocket layer only adapts message types.
//!
//! Two pumps run per connection:
//!
//! - **inbound** (the task calling [`ClientActor::run`]) forwards data frames
//!   to the room for broadcast and to the room journal for caching.
//! - **outbound** (a spawned task) first replays the cached snapshot and
//!   update log, then writes queued broadcasts in FIFO order and sends
//!   keepalive pings.
//!
//! Whichever pump stops first signals the other. The outbound pump owns the
//! sink, so the transport is closed exactly once.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::FastCache;
use crate::channel::Channel;
use crate::error::{CollabError, Result};
use crate::hub::Hub;
use crate::hub::room::Room;

/// Unique per connection, not per user.
pub type ClientId = Uuid;

/// Transport-level unit exchanged with a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Ping,
    Pong,
}

/// Who is on the other end of a connection, as admitted by the connect gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: String,
    pub user_name: String,
    /// Inbound data from read-only clients is discarded.
    pub read_only: bool,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            read_only: false,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", "Anonymous")
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    QueueFull,
    Disconnected,
}

/// Room-side handle to a client's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    identity: Arc<ClientIdentity>,
    queue: mpsc::Sender<Bytes>,
}

impl ClientHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn channel(identity: ClientIdentity, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            identity: Arc::new(identity),
            queue,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Non-blocking enqueue.
    pub fn try_deliver(&self, payload: Bytes) -> std::result::Result<(), DeliveryError> {
        self.queue.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed the connection or the stream ended.
    PeerClosed,
    ReadFailed(String),
    WriteFailed(String),
    /// The room dropped our queue: evicted as a slow consumer, or the room closed.
    Evicted,
    /// No frame arrived between two keepalive pings.
    Unresponsive,
    /// The inbound side stopped first and asked the outbound pump to exit.
    Stopped,
}

pub struct ClientActor {
    id: ClientId,
    channel: Channel,
    identity: ClientIdentity,
    room: Arc<Room>,
    hub: Arc<Hub>,
    outbound: mpsc::Receiver<Bytes>,
    ping_interval: Duration,
}

impl ClientActor {
    pub(crate) fn new(
        id: ClientId,
        channel: Channel,
        identity: ClientIdentity,
        room: Arc<Room>,
        hub: Arc<Hub>,
        outbound: mpsc::Receiver<Bytes>,
        ping_interval: Duration,
    ) -> Self {
        Self {
            id,
            channel,
            identity,
            room,
            hub,
            outbound,
            ping_interval,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Drive the connection until either side stops. Always leaves the room
    /// before returning.
    pub async fn run<St, Si>(self, mut inbound: St, sink: Si) -> Disconnect
    where
        St: Stream<Item = Result<Frame>> + Unpin + Send,
        Si: Sink<Frame, Error = CollabError> + Unpin + Send + 'static,
    {
        let Self {
            id,
            channel,
            identity,
            room,
            hub,
            outbound,
            ping_interval,
        } = self;
        let doc_id = room.doc_id().to_string();
        let alive = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut writer = tokio::spawn(pump_outbound(
            sink,
            outbound,
            room.cache().clone(),
            doc_id.clone(),
            ping_interval,
            alive.clone(),
            stop_rx,
        ));

        let mut writer_exit = None;
        let reason = loop {
            tokio::select! {
                exit = &mut writer => {
                    let exit = exit.unwrap_or_else(|e| Disconnect::WriteFailed(e.to_string()));
                    writer_exit = Some(exit.clone());
                    break exit;
                }
                frame = inbound.next() => match frame {
                    Some(Ok(Frame::Data(payload))) => {
                        alive.store(true, Ordering::Relaxed);
                        if identity.read_only {
                            continue;
                        }
                        room.record(payload.clone());
                        if let Err(e) = room.broadcast(id, payload).await {
                            break Disconnect::WriteFailed(e.to_string());
                        }
                    }
                    Some(Ok(Frame::Ping | Frame::Pong)) => {
                        alive.store(true, Ordering::Relaxed);
                    }
                    Some(Err(e)) => break Disconnect::ReadFailed(e.to_string()),
                    None => break Disconnect::PeerClosed,
                },
            }
        };

        hub.leave(channel, &doc_id, id);

        if writer_exit.is_none() {
            let _ = stop_tx.send(());
            if let Err(e) = writer.await {
                warn!(doc_id = %doc_id, client_id = %id, error = %e, "Outbound pump panicked");
            }
        }

        info!(
            doc_id = %doc_id,
            client_id = %id,
            user_id = %identity.user_id,
            reason = ?reason,
            "Client disconnected"
        );
        reason
    }
}

/// Replay the cached snapshot and update log, in that order. Cache failures
/// are logged and skipped: the client still gets live traffic.
async fn send_initial_state<Si>(sink: &mut Si, cache: &dyn FastCache, doc_id: &str) -> Result<()>
where
    Si: Sink<Frame, Error = CollabError> + Unpin,
{
    match cache.get_snapshot(doc_id).await {
        Ok(Some(state)) if !state.is_empty() => {
            debug!(doc_id, bytes = state.len(), "Sending cached snapshot");
            sink.send(Frame::Data(state)).await?;
        }
        Ok(_) => {}
        Err(e) => warn!(doc_id, error = %e, "Could not load cached snapshot"),
    }

    match cache.get_updates(doc_id).await {
        Ok(updates) => {
            if !updates.is_empty() {
                debug!(doc_id, count = updates.len(), "Sending pending updates");
            }
            for update in updates {
                sink.feed(Frame::Data(update)).await?;
            }
            sink.flush().await?;
        }
        Err(e) => warn!(doc_id, error = %e, "Could not load cached updates"),
    }
    Ok(())
}

async fn pump_outbound<Si>(
    mut sink: Si,
    mut queue: mpsc::Receiver<Bytes>,
    cache: Arc<dyn FastCache>,
    doc_id: String,
    ping_interval: Duration,
    alive: Arc<AtomicBool>,
    mut stop: oneshot::Receiver<()>,
) -> Disconnect
where
    Si: Sink<Frame, Error = CollabError> + Unpin + Send + 'static,
{
    let exit = match send_initial_state(&mut sink, cache.as_ref(), &doc_id).await {
        Err(e) => Disconnect::WriteFailed(e.to_string()),
        Ok(()) => {
            let mut keepalive = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop => break Disconnect::Stopped,
                    payload = queue.recv() => match payload {
                        Some(payload) => {
                            if let Err(e) = sink.send(Frame::Data(payload)).await {
                                break Disconnect::WriteFailed(e.to_string());
                            }
                        }
                        None => break Disconnect::Evicted,
                    },
                    _ = keepalive.tick() => {
                        if !alive.swap(false, Ordering::Relaxed) {
                            break Disconnect::Unresponsive;
                        }
                        if let Err(e) = sink.send(Frame::Ping).await {
                            break Disconnect::WriteFailed(e.to_string());
                        }
                    }
                }
            }
        }
    };

    if let Err(e) = sink.close().await {
        debug!(doc_id = %doc_id, error = %e, "Transport close failed");
    }
    exit
}
