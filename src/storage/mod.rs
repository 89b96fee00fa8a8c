//! Durable storage collaborator.
//!
//! Holds at most one current state blob (plus its state vector) per
//! document. Saving supersedes the previous row atomically. Only the
//! persister talks to durable storage.

pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;

pub use self::sqlite::SqliteStore;

/// The authoritative durable state of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    pub state: Vec<u8>,
    pub state_vector: Vec<u8>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Latest stored state, `None` when the document was never persisted.
    async fn load_latest_state(&self, doc_id: &str) -> Result<Option<StoredState>>;

    /// Replace the stored state of the document.
    async fn save_state(&self, doc_id: &str, state: &[u8], state_vector: &[u8]) -> Result<()>;
}
