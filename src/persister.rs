//! Scheduled compaction from the fast cache into durable storage.
//!
//! ```text
//!            start()                     stop()
//!   Idle ──────────────► Scheduled ─────────────► Stopped
//!    ▲                      │  tick / force_persist()
//!    │                      ▼
//!    └─────────────── Running (one pass at a time)
//! ```
//!
//! A pass walks every document the cache reports as active. Per document it
//! reads the update log, merges it onto the last durable state, saves the
//! result, trims exactly the entries it consumed and refreshes the cache
//! snapshot. Documents fail independently; a failed document keeps its
//! cache entries and is retried on the next pass.
//!
//! A document with nothing pending only has its TTL extended while it still
//! has an open room (see [`OpenDocuments`]). Everything else is left to
//! expire.

use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::FastCache;
use crate::config::PersisterConfig;
use crate::error::{CollabError, Result};
use crate::merge::UpdateMerger;
use crate::storage::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PersisterState {
    Idle = 0,
    Scheduled = 1,
    Running = 2,
    Stopped = 3,
}

impl PersisterState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Scheduled,
            2 => Self::Running,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// What happened to one document during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// `updates` entries were merged and saved.
    Persisted { updates: usize },
    /// Nothing pending. The TTL was extended only if the document is open.
    Skipped,
}

/// Summary of one persistence pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub attempted: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failures: Vec<(String, CollabError)>,
    /// Set when the active document list itself could not be read.
    pub discovery_error: Option<CollabError>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.discovery_error.is_none()
    }
}

/// Which documents still have connected clients.
pub trait OpenDocuments: Send + Sync {
    fn is_open(&self, doc_id: &str) -> bool;
}

struct Schedule {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Persister {
    cache: Arc<dyn FastCache>,
    store: Arc<dyn DocumentStore>,
    merger: Arc<dyn UpdateMerger>,
    open: Option<Arc<dyn OpenDocuments>>,
    interval: Duration,
    io_timeout: Duration,
    pass_lock: tokio::sync::Mutex<()>,
    state: AtomicU8,
    schedule: Mutex<Option<Schedule>>,
}

impl Persister {
    pub fn new(
        cache: Arc<dyn FastCache>,
        store: Arc<dyn DocumentStore>,
        merger: Arc<dyn UpdateMerger>,
        config: &PersisterConfig,
    ) -> Self {
        Self {
            cache,
            store,
            merger,
            open: None,
            interval: config.interval(),
            io_timeout: config.io_timeout(),
            pass_lock: tokio::sync::Mutex::new(()),
            state: AtomicU8::new(PersisterState::Idle as u8),
            schedule: Mutex::new(None),
        }
    }

    /// Keep idle documents alive while `open` reports them open. Without
    /// it, idle documents are never refreshed.
    pub fn with_open_documents(mut self, open: Arc<dyn OpenDocuments>) -> Self {
        self.open = Some(open);
        self
    }

    fn is_open(&self, doc_id: &str) -> bool {
        self.open.as_ref().is_some_and(|open| open.is_open(doc_id))
    }

    pub fn state(&self) -> PersisterState {
        PersisterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: PersisterState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Begin running a pass every `interval`. Calling `start` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut schedule = self.schedule.lock();
        if schedule.is_some() || self.state() == PersisterState::Stopped {
            return;
        }

        let (stop, mut stop_rx) = oneshot::channel();
        let persister = self.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        persister.run_pass().await;
                    }
                }
            }
        });

        *schedule = Some(Schedule { stop, task });
        self.set_state(PersisterState::Scheduled);
        info!(interval_secs = interval.as_secs(), "Persister started");
    }

    /// Halt the schedule. An in-flight pass runs to completion first.
    pub async fn stop(&self) {
        let schedule = self.schedule.lock().take();
        if let Some(Schedule { stop, task }) = schedule {
            let _ = stop.send(());
            if let Err(e) = task.await {
                error!(error = %e, "Persister schedule task failed");
            }
        }
        // A forced pass may still hold the lock; wait for it.
        let _guard = self.pass_lock.lock().await;
        self.set_state(PersisterState::Stopped);
        info!("Persister stopped");
    }

    /// Run a pass now. Waits for any in-flight pass first; returns after
    /// every discovered document has been attempted.
    pub async fn force_persist(&self) -> PassReport {
        info!("Forced persistence requested");
        self.run_pass().await
    }

    async fn run_pass(&self) -> PassReport {
        let _guard = self.pass_lock.lock().await;
        let previous = self.state();
        self.set_state(PersisterState::Running);
        let report = self.pass().await;
        if self.state() == PersisterState::Running {
            self.set_state(match previous {
                PersisterState::Running => PersisterState::Idle,
                other => other,
            });
        }
        report
    }

    async fn pass(&self) -> PassReport {
        let mut report = PassReport::default();
        let started = Instant::now();

        let doc_ids = match self
            .bounded("list active documents", self.cache.list_active_document_ids(), cache_timeout)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Persistence pass could not discover documents");
                report.discovery_error = Some(e);
                return report;
            }
        };
        if doc_ids.is_empty() {
            debug!("Persistence pass: nothing active");
            return report;
        }

        for doc_id in doc_ids {
            report.attempted += 1;
            match self.persist_document(&doc_id).await {
                Ok(DocumentOutcome::Persisted { updates }) => {
                    report.persisted += 1;
                    debug!(doc_id = %doc_id, updates, "Persisted document");
                }
                Ok(DocumentOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(doc_id = %doc_id, error = %e, code = e.error_code(), "Failed to persist document");
                    report.failures.push((doc_id, e));
                }
            }
        }

        info!(
            attempted = report.attempted,
            persisted = report.persisted,
            skipped = report.skipped,
            failed = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Persistence pass complete"
        );
        report
    }

    /// Compact one document. See the module docs for the steps.
    pub async fn persist_document(&self, doc_id: &str) -> Result<DocumentOutcome> {
        let updates = self
            .bounded("read updates", self.cache.get_updates(doc_id), cache_timeout)
            .await?;
        if updates.is_empty() {
            if self.is_open(doc_id) {
                self.bounded("refresh ttl", self.cache.refresh_ttl(doc_id), cache_timeout)
                    .await?;
            }
            return Ok(DocumentOutcome::Skipped);
        }

        let baseline = self
            .bounded("load state", self.store.load_latest_state(doc_id), storage_timeout)
            .await?
            .map(|stored| stored.state)
            .unwrap_or_default();

        let merged = self.merge(doc_id, baseline, updates.clone()).await?;

        self.bounded(
            "save state",
            self.store.save_state(doc_id, &merged.state, &merged.state_vector),
            storage_timeout,
        )
        .await?;

        let consumed = updates.len();
        self.bounded("trim updates", self.cache.trim_consumed(doc_id, consumed), cache_timeout)
            .await?;
        if self.merger.caches_snapshot() {
            self.bounded(
                "cache snapshot",
                self.cache.put_snapshot(doc_id, Bytes::from(merged.state)),
                cache_timeout,
            )
            .await?;
        }

        Ok(DocumentOutcome::Persisted { updates: consumed })
    }

    async fn merge(
        &self,
        doc_id: &str,
        baseline: Vec<u8>,
        updates: Vec<Bytes>,
    ) -> Result<crate::merge::MergedState> {
        let merger = self.merger.clone();
        let id = doc_id.to_string();
        tokio::task::spawn_blocking(move || merger.apply_updates(&id, &baseline, &updates))
            .await
            .map_err(|e| CollabError::merge(doc_id, e))?
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl Future<Output = Result<T>>,
        on_timeout: fn(&str, Duration) -> CollabError,
    ) -> Result<T> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(op, self.io_timeout)),
        }
    }
}

fn cache_timeout(op: &str, after: Duration) -> CollabError {
    CollabError::CacheUnavailable(format!("{op} timed out after {after:?}"))
}

fn storage_timeout(op: &str, after: Duration) -> CollabError {
    CollabError::Storage(format!("{op} timed out after {after:?}"))
}
