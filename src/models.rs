//! Core data types shared across the chunking and search pipelines.

use serde::{Deserialize, Serialize};

/// Raw input from the chat-protocol client / archive importer. Read-only to
/// the core; this crate never constructs one outside of tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub text: String,
    pub timestamp_ms: i64,
}

/// An ordered run of same-sender messages coalesced within a short time
/// window. In-memory only, never persisted.
#[derive(Debug, Clone)]
pub struct CoalescedMessage {
    pub message_ids: Vec<String>,
    pub sender_id: i64,
    pub sender_name: String,
    pub text: String,
    pub start_ts: i64,
    pub end_ts: i64,
}

/// A run of [`CoalescedMessage`]s from one thread, separated from its
/// neighbors by a gap exceeding `session.gap_minutes`. In-memory only.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub entries: Vec<CoalescedMessage>,
}

/// A bounded, indexable passage of conversation. The unit everything else in
/// this crate operates on: persisted by the Chunk Store, read by both
/// searchers, returned (with extra ranking fields) by the Hybrid Service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub thread_id: i64,
    pub thread_name: String,
    pub session_idx: i64,
    pub chunk_idx: i64,
    pub message_ids: Vec<String>,
    pub participant_ids: Vec<i64>,
    pub participant_names: Vec<String>,
    pub text: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: i64,
    pub is_indexable: bool,
    pub char_count: i64,
    pub alnum_count: i64,
    pub unique_word_count: i64,
    pub content_hash: String,
    pub vector_synced: bool,
}

/// A chunk fragment as returned by context expansion: a smaller view than
/// [`Chunk`], exposing only what a neighbor in the conversation needs to
/// carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFragment {
    pub chunk_id: String,
    pub chunk_idx: i64,
    pub text: String,
    pub is_indexable: bool,
}

impl From<&Chunk> for ChunkFragment {
    fn from(c: &Chunk) -> Self {
        ChunkFragment {
            chunk_id: c.chunk_id.clone(),
            chunk_idx: c.chunk_idx,
            text: c.text.clone(),
            is_indexable: c.is_indexable,
        }
    }
}
