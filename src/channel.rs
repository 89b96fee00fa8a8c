//! Document families served by the relay.
//!
//! Each channel has its own rooms, cache namespace and durable table, so a
//! document id used on both routes names two unrelated documents.

use std::sync::Arc;

use crate::cache::FastCache;

/// How data frames are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Binary,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Binary Yjs documents.
    Document,
    /// Text-framed notes.
    Note,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Document, Channel::Note];

    pub fn name(self) -> &'static str {
        match self {
            Self::Document => "doc",
            Self::Note => "note",
        }
    }

    pub fn wire(self) -> WireFormat {
        match self {
            Self::Document => WireFormat::Binary,
            Self::Note => WireFormat::Text,
        }
    }

    /// Hub key for a room. Notes are namespaced as `note:{id}`.
    pub fn room_key(self, doc_id: &str) -> String {
        match self {
            Self::Document => doc_id.to_string(),
            Self::Note => format!("note:{doc_id}"),
        }
    }
}

/// One cache per channel. Backends must not share a key space.
#[derive(Clone)]
pub struct ChannelCaches {
    pub document: Arc<dyn FastCache>,
    pub note: Arc<dyn FastCache>,
}

impl ChannelCaches {
    pub fn new(document: Arc<dyn FastCache>, note: Arc<dyn FastCache>) -> Self {
        Self { document, note }
    }

    pub fn get(&self, channel: Channel) -> &Arc<dyn FastCache> {
        match channel {
            Channel::Document => &self.document,
            Channel::Note => &self.note,
        }
    }
}
