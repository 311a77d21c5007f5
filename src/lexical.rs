//! The Lexical Searcher (C7): turns a free-text query into an OR-of-terms
//! FTS5 MATCH expression and runs it through the Chunk Store.

use crate::store::{ChunkStore, LexicalHit};
use anyhow::Result;

const RESERVED_CHARS: &[char] = &['"', '\'', '(', ')', '*', ':', '^'];

/// Strips surrounding quotes, splits on whitespace, discards tokens shorter
/// than 2 code points, escapes the engine's reserved characters, wraps each
/// token in double quotes, and combines with `OR`.
///
/// Returns an empty string when the query has no usable tokens, which the
/// Chunk Store treats as "no results" rather than "match everything".
pub fn parse_query(raw: &str) -> String {
    let unquoted = raw.trim().trim_matches('"');

    let terms: Vec<String> = unquoted
        .split_whitespace()
        .map(escape_token)
        .filter(|t| t.chars().count() >= 2)
        .map(|t| format!("\"{}\"", t))
        .collect();

    terms.join(" OR ")
}

fn escape_token(token: &str) -> String {
    token.chars().filter(|c| !RESERVED_CHARS.contains(c)).collect()
}

pub struct LexicalSearcher {
    store: ChunkStore,
}

impl LexicalSearcher {
    pub fn new(store: ChunkStore) -> Self {
        LexicalSearcher { store }
    }

    /// Runs the full-text query with BM25 ordering, restricted to
    /// `is_indexable = true`, limited to `limit` candidates.
    pub async fn search(&self, raw_query: &str, limit: i64) -> Result<Vec<LexicalHit>> {
        let parsed = parse_query(raw_query);
        if parsed.is_empty() {
            return Ok(Vec::new());
        }
        self.store.lexical_search(&parsed, limit).await
    }
}
