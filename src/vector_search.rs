//! The Vector Searcher (C8): embeds a query, runs k-NN against the vector
//! database, reconstructs Chunk-shaped hits, and drops low-quality results.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, QualityConfig};
use crate::embedding::EmbeddingClient;
use crate::models::Chunk;
use crate::quality::is_low_quality;
use crate::vector::VectorStore;

/// A vector-search hit, carrying a reconstructed [`Chunk`] plus its 1-based
/// rank and raw similarity score.
#[derive(Debug, Clone)]
pub struct VectorSearchHit {
    pub chunk: Chunk,
    pub rank: i64,
    pub score: f32,
}

pub struct VectorSearcher {
    embedder: EmbeddingClient,
    vectors: Arc<dyn VectorStore>,
    quality: QualityConfig,
    fetch_multiplier: i64,
    ef: u32,
}

impl VectorSearcher {
    pub fn new(embedder: EmbeddingClient, vectors: Arc<dyn VectorStore>, config: &Config) -> Self {
        VectorSearcher {
            embedder,
            vectors,
            quality: config.quality.clone(),
            fetch_multiplier: config.milvus.search.fetch_multiplier,
            ef: config.milvus.search.ef,
        }
    }

    /// `Search(query_text, limit) -> [VectorHit]`: embeds the query, searches
    /// with `ef = max(configured ef, limit * fetch_multiplier)` to give the
    /// quality filter enough candidates to drop from, then trims to `limit`.
    pub async fn search(
        &self,
        query_text: &str,
        limit: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<VectorSearchHit>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed(query_text, cancel).await?;
        self.search_with_vector(&query_vector, limit).await
    }

    /// Same as [`Self::search`] but skips embedding, for callers (the Hybrid
    /// Service) that already embedded the query once for both searchers.
    pub async fn search_with_vector(&self, query_vector: &[f32], limit: i64) -> Result<Vec<VectorSearchHit>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let fetch_limit = limit * self.fetch_multiplier.max(1);
        let effective_ef = self.ef.max(fetch_limit.max(0) as u32);

        let raw_hits = self.vectors.search(&query_vector, fetch_limit, effective_ef).await?;

        let mut hits = Vec::new();
        for hit in raw_hits {
            if is_low_quality(&hit.text, &self.quality) {
                continue;
            }
            hits.push(hit);
            if hits.len() as i64 >= limit {
                break;
            }
        }

        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(idx, hit)| VectorSearchHit {
                score: hit.score,
                rank: (idx + 1) as i64,
                chunk: reconstruct_chunk(hit),
            })
            .collect())
    }
}

fn reconstruct_chunk(hit: crate::vector::VectorHit) -> Chunk {
    let message_ids: Vec<String> = serde_json::from_str(&hit.message_ids_json).unwrap_or_default();
    let participant_ids: Vec<i64> = serde_json::from_str(&hit.participant_ids_json).unwrap_or_default();
    let participant_names: Vec<String> =
        serde_json::from_str(&hit.participant_names_json).unwrap_or_default();

    Chunk {
        chunk_id: hit.chunk_id,
        thread_id: hit.thread_id,
        thread_name: hit.thread_name,
        session_idx: hit.session_idx,
        chunk_idx: hit.chunk_idx,
        message_ids,
        participant_ids,
        participant_names,
        text: hit.text,
        start_ts: hit.start_ts,
        end_ts: hit.end_ts,
        message_count: hit.message_count,
        is_indexable: true,
        char_count: 0,
        alnum_count: 0,
        unique_word_count: 0,
        content_hash: String::new(),
        vector_synced: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::VectorHit;

    fn sample_hit(chunk_id: &str, text: &str, score: f32) -> VectorHit {
        VectorHit {
            chunk_id: chunk_id.to_string(),
            thread_id: 1,
            thread_name: "Alpha".to_string(),
            session_idx: 0,
            chunk_idx: 0,
            participant_ids_json: "[1]".to_string(),
            participant_names_json: "[\"Alice\"]".to_string(),
            text: text.to_string(),
            message_ids_json: "[\"m1\"]".to_string(),
            start_ts: 0,
            end_ts: 0,
            message_count: 1,
            score,
        }
    }

    #[test]
    fn reconstruct_chunk_parses_json_fields() {
        let hit = sample_hit("c1", "hello there friend, how has your week been going lately?", 0.9);
        let chunk = reconstruct_chunk(hit);
        assert_eq!(chunk.chunk_id, "c1");
        assert_eq!(chunk.participant_ids, vec![1]);
        assert_eq!(chunk.participant_names, vec!["Alice".to_string()]);
        assert_eq!(chunk.message_ids, vec!["m1".to_string()]);
    }
}
