//! Seam to the opaque update format.
//!
//! The relay never interprets document payloads. Compaction hands a baseline
//! state and the ordered update log to an [`UpdateMerger`] and stores
//! whatever comes back.

use bytes::Bytes;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{CollabError, Result};

/// Output of a merge: the new snapshot and its state vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedState {
    pub state: Vec<u8>,
    pub state_vector: Vec<u8>,
}

/// Applies ordered deltas onto a baseline snapshot.
///
/// Implementations must apply `updates` in slice order, each exactly once,
/// and be deterministic for a given input. An empty `base` means "no prior
/// state".
pub trait UpdateMerger: Send + Sync {
    fn apply_updates(&self, doc_id: &str, base: &[u8], updates: &[Bytes]) -> Result<MergedState>;

    /// Whether merged state can be handed to joining clients as a single
    /// frame. When false, the persister leaves the cache snapshot alone.
    fn caches_snapshot(&self) -> bool {
        true
    }
}

/// Merger for Yjs-compatible (v1 encoded) updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsMerger;

impl YrsMerger {
    fn apply(doc: &Doc, doc_id: &str, payload: &[u8]) -> Result<()> {
        let update = Update::decode_v1(payload).map_err(|e| CollabError::merge(doc_id, e))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::merge(doc_id, e))?;
        Ok(())
    }
}

impl UpdateMerger for YrsMerger {
    fn apply_updates(&self, doc_id: &str, base: &[u8], updates: &[Bytes]) -> Result<MergedState> {
        let doc = Doc::new();
        if !base.is_empty() {
            Self::apply(&doc, doc_id, base)?;
        }
        for update in updates {
            Self::apply(&doc, doc_id, update)?;
        }

        let txn = doc.transact();
        Ok(MergedState {
            state: txn.encode_state_as_update_v1(&StateVector::default()),
            state_vector: txn.state_vector().encode_v1(),
        })
    }
}

/// Merger for text notes.
///
/// Note frames are free-form UTF-8 with no merge semantics of their own, so
/// the durable state is the ordered transcript: a JSON array of every frame
/// received. The state vector is the frame count, big-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptMerger;

impl UpdateMerger for TranscriptMerger {
    fn apply_updates(&self, doc_id: &str, base: &[u8], updates: &[Bytes]) -> Result<MergedState> {
        let mut frames: Vec<String> = if base.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(base).map_err(|e| CollabError::merge(doc_id, e))?
        };
        for update in updates {
            let text = std::str::from_utf8(update).map_err(|e| CollabError::merge(doc_id, e))?;
            frames.push(text.to_string());
        }

        let state = serde_json::to_vec(&frames).map_err(|e| CollabError::merge(doc_id, e))?;
        Ok(MergedState {
            state,
            state_vector: (frames.len() as u64).to_be_bytes().to_vec(),
        })
    }

    fn caches_snapshot(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    fn text_update(doc: &Doc, at: u32, chunk: &str) -> Bytes {
        let before = doc.transact().state_vector();
        {
            let text = doc.get_or_insert_text("content");
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, at, chunk);
        }
        Bytes::from(doc.transact().encode_state_as_update_v1(&before))
    }

    fn content_of(state: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_merge_from_empty_baseline() {
        let client = Doc::with_client_id(1);
        let a = text_update(&client, 0, "Hello");
        let b = text_update(&client, 5, ", world");

        let merged = YrsMerger.apply_updates("doc-1", &[], &[a, b]).unwrap();
        assert_eq!(content_of(&merged.state), "Hello, world");
        assert!(!merged.state_vector.is_empty());
    }

    #[test]
    fn test_merge_onto_existing_baseline() {
        let client = Doc::with_client_id(7);
        let a = text_update(&client, 0, "abc");
        let base = YrsMerger.apply_updates("doc-1", &[], &[a]).unwrap();

        let b = text_update(&client, 3, "def");
        let merged = YrsMerger
            .apply_updates("doc-1", &base.state, &[b])
            .unwrap();
        assert_eq!(content_of(&merged.state), "abcdef");
    }

    #[test]
    fn test_reapplying_is_stable() {
        let client = Doc::with_client_id(3);
        let a = text_update(&client, 0, "x");
        let once = YrsMerger.apply_updates("doc-1", &[], &[a.clone()]).unwrap();
        let twice = YrsMerger
            .apply_updates("doc-1", &once.state, &[a])
            .unwrap();
        assert_eq!(content_of(&twice.state), "x");
        assert_eq!(once.state_vector, twice.state_vector);
    }

    #[test]
    fn test_garbage_payload_is_merge_error() {
        let err = YrsMerger
            .apply_updates("doc-1", &[], &[Bytes::from_static(&[0xff, 0xff, 0xff])])
            .unwrap_err();
        assert!(matches!(err, CollabError::Merge { ref doc_id, .. } if doc_id == "doc-1"));
    }

    #[test]
    fn test_transcript_appends_in_order() {
        let first = TranscriptMerger
            .apply_updates("note-1", &[], &[Bytes::from_static(b"{\"op\":1}")])
            .unwrap();
        let merged = TranscriptMerger
            .apply_updates("note-1", &first.state, &[Bytes::from_static(b"hello")])
            .unwrap();

        let frames: Vec<String> = serde_json::from_slice(&merged.state).unwrap();
        assert_eq!(frames, vec!["{\"op\":1}".to_string(), "hello".to_string()]);
        assert_eq!(merged.state_vector, 2u64.to_be_bytes().to_vec());
        assert!(!TranscriptMerger.caches_snapshot());
        assert!(YrsMerger.caches_snapshot());
    }

    #[test]
    fn test_transcript_rejects_non_utf8() {
        let err = TranscriptMerger
            .apply_updates("note-1", &[], &[Bytes::from_static(&[0xff])])
            .unwrap_err();
        assert!(matches!(err, CollabError::Merge { ref doc_id, .. } if doc_id == "note-1"));
    }
}
