//! The Hybrid Service (C9): the one public entry point the HTTP Surface
//! calls. Orchestrates embedding, the two searchers, Reciprocal Rank Fusion,
//! and context expansion behind a uniform `Search`/`Stats`/`Health` contract.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::{CoreError, CoreResult};
use crate::lexical::LexicalSearcher;
use crate::models::{Chunk, ChunkFragment};
use crate::store::ChunkStore;
use crate::vector::VectorStore;
use crate::vector_search::VectorSearcher;

const MAX_QUERY_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Bm25,
    Hybrid,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Hybrid
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub context: i64,
    pub rrf_k: Option<f64>,
    pub w_vector: Option<f64>,
    pub w_bm25: Option<f64>,
    pub candidate_mult: Option<i64>,
}

fn default_limit() -> i64 {
    20
}

impl SearchRequest {
    /// Strips control characters (keeping tab and newline), trims, and
    /// clamps numeric fields, rejecting what can't be coerced into range.
    fn sanitized(&self) -> CoreResult<SanitizedRequest> {
        let query: String = self
            .query
            .chars()
            .filter(|c| !c.is_control() || *c == '\t' || *c == '\n')
            .collect();
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(CoreError::invalid_argument("query must not be empty"));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(CoreError::invalid_argument(format!(
                "query exceeds {} characters",
                MAX_QUERY_CHARS
            )));
        }

        if !(1..=100).contains(&self.limit) {
            return Err(CoreError::invalid_argument("limit must be in 1..=100"));
        }
        if !(0..=5).contains(&self.context) {
            return Err(CoreError::invalid_argument("context must be in 0..=5"));
        }

        let candidate_mult = self.candidate_mult.unwrap_or(2);
        if !(1..=10).contains(&candidate_mult) {
            return Err(CoreError::invalid_argument("candidate_mult must be in 1..=10"));
        }

        let rrf_k = self.rrf_k.unwrap_or(60.0);

        let (w_vector, w_bm25) = normalize_weights(self.w_vector, self.w_bm25);

        Ok(SanitizedRequest {
            query,
            mode: self.mode,
            limit: self.limit,
            context: self.context,
            rrf_k,
            w_vector,
            w_bm25,
            candidate_mult,
        })
    }
}

/// Normalizes `(w_vector, w_bm25)` by their sum; falls back to equal weights
/// if either is missing, non-finite, or the pair is non-positive.
fn normalize_weights(w_vector: Option<f64>, w_bm25: Option<f64>) -> (f64, f64) {
    let v = w_vector.unwrap_or(0.5);
    let b = w_bm25.unwrap_or(0.5);
    let sum = v + b;
    if !v.is_finite() || !b.is_finite() || sum <= 0.0 {
        return (0.5, 0.5);
    }
    (v / sum, b / sum)
}

struct SanitizedRequest {
    query: String,
    mode: SearchMode,
    limit: i64,
    context: i64,
    rrf_k: f64,
    w_vector: f64,
    w_bm25: f64,
    candidate_mult: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub vector_rank: Option<i64>,
    pub vector_score: Option<f32>,
    pub bm25_rank: Option<i64>,
    pub bm25_score: Option<f64>,
    pub rrf_score: Option<f64>,
    pub context_before: Vec<ChunkFragment>,
    pub context_after: Vec<ChunkFragment>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub degraded: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub vector_row_count: i64,
    pub vector_index_type: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub lexical_total_rows: i64,
    pub lexical_indexable_rows: i64,
    pub lexical_table: String,
    pub config_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: HealthStatus,
    pub vector_ok: bool,
    pub lexical_ok: bool,
    pub embedding_ok: bool,
}

/// A single fused candidate, accumulated from whichever of the two ranked
/// lists mention its `chunk_id`.
struct Candidate {
    chunk: Chunk,
    vector_rank: Option<i64>,
    vector_score: Option<f32>,
    bm25_rank: Option<i64>,
    bm25_score: Option<f64>,
}

pub struct HybridService {
    store: ChunkStore,
    lexical: LexicalSearcher,
    vector_search: VectorSearcher,
    vectors: Arc<dyn VectorStore>,
    embedder: EmbeddingClient,
    config: Config,
}

impl HybridService {
    pub fn new(
        store: ChunkStore,
        lexical: LexicalSearcher,
        vector_search: VectorSearcher,
        vectors: Arc<dyn VectorStore>,
        embedder: EmbeddingClient,
        config: Config,
    ) -> Self {
        HybridService {
            store,
            lexical,
            vector_search,
            vectors,
            embedder,
            config,
        }
    }

    pub async fn search(&self, req: &SearchRequest, cancel: &CancellationToken) -> CoreResult<SearchResponse> {
        let req = req.sanitized()?;

        let mut response = match req.mode {
            SearchMode::Vector => self.search_vector_only(&req, cancel).await?,
            SearchMode::Bm25 => self.search_bm25_only(&req).await?,
            SearchMode::Hybrid => self.search_hybrid(&req, cancel).await?,
        };

        if req.context > 0 {
            self.expand_context(&mut response, req.context).await;
        }

        info!(mode = ?req.mode, limit = req.limit, hits = response.hits.len(), degraded = response.degraded, "search completed");
        Ok(response)
    }

    async fn search_vector_only(&self, req: &SanitizedRequest, cancel: &CancellationToken) -> CoreResult<SearchResponse> {
        let hits = self
            .vector_search
            .search(&req.query, req.limit, cancel)
            .await
            .map_err(CoreError::Internal)?;

        let hits = hits
            .into_iter()
            .map(|h| SearchHit {
                chunk: h.chunk,
                vector_rank: Some(h.rank),
                vector_score: Some(h.score),
                bm25_rank: None,
                bm25_score: None,
                rrf_score: None,
                context_before: Vec::new(),
                context_after: Vec::new(),
            })
            .collect();

        Ok(SearchResponse {
            hits,
            degraded: false,
            warnings: Vec::new(),
        })
    }

    async fn search_bm25_only(&self, req: &SanitizedRequest) -> CoreResult<SearchResponse> {
        let hits = self
            .lexical
            .search(&req.query, req.limit)
            .await
            .map_err(CoreError::Internal)?;

        let hits = hits
            .into_iter()
            .map(|h| SearchHit {
                chunk: h.chunk,
                vector_rank: None,
                vector_score: None,
                bm25_rank: Some(h.rank),
                bm25_score: Some(h.bm25_score),
                rrf_score: None,
                context_before: Vec::new(),
                context_after: Vec::new(),
            })
            .collect();

        Ok(SearchResponse {
            hits,
            degraded: false,
            warnings: Vec::new(),
        })
    }

    async fn search_hybrid(&self, req: &SanitizedRequest, cancel: &CancellationToken) -> CoreResult<SearchResponse> {
        let candidate_limit = req.limit * req.candidate_mult;

        let query_vector = match self.embedder.embed(&req.query, cancel).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed, synthesizing hybrid result from bm25 alone");
                let bhits = self
                    .lexical
                    .search(&req.query, candidate_limit)
                    .await
                    .map_err(CoreError::Internal)?;
                let mut response = self.fuse(Vec::new(), bhits.into_iter().map(Some).collect(), req);
                response.degraded = true;
                response.warnings.push(format!("embedding unavailable: {}", e));
                response.hits.truncate(req.limit as usize);
                return Ok(response);
            }
        };

        let (vector_result, lexical_result) = tokio::join!(
            self.vector_search.search_with_vector(&query_vector, candidate_limit),
            self.lexical.search(&req.query, candidate_limit),
        );

        let response = match (vector_result, lexical_result) {
            (Err(ve), Err(le)) => {
                return Err(CoreError::Internal(anyhow::anyhow!(
                    "both vector ({}) and lexical ({}) search failed",
                    ve,
                    le
                )));
            }
            (Ok(vhits), Err(le)) => {
                warn!(error = %le, "lexical search failed, synthesizing from vector alone");
                let mut response = self.fuse(vhits.into_iter().map(Some).collect(), Vec::new(), req);
                response.degraded = true;
                response.warnings.push(format!("lexical backend unavailable: {}", le));
                response
            }
            (Err(ve), Ok(bhits)) => {
                warn!(error = %ve, "vector search failed, synthesizing from lexical alone");
                let mut response = self.fuse(Vec::new(), bhits.into_iter().map(Some).collect(), req);
                response.degraded = true;
                response.warnings.push(format!("vector backend unavailable: {}", ve));
                response
            }
            (Ok(vhits), Ok(bhits)) => self.fuse(
                vhits.into_iter().map(Some).collect(),
                bhits.into_iter().map(Some).collect(),
                req,
            ),
        };

        let mut response = response;
        response.hits.truncate(req.limit as usize);
        Ok(response)
    }

    /// Reciprocal Rank Fusion over the (possibly one-sided) candidate lists.
    fn fuse(
        &self,
        vector_hits: Vec<Option<crate::vector_search::VectorSearchHit>>,
        bm25_hits: Vec<Option<crate::store::LexicalHit>>,
        req: &SanitizedRequest,
    ) -> SearchResponse {
        fuse_candidates(vector_hits, bm25_hits, req)
    }

    async fn expand_context(&self, response: &mut SearchResponse, radius: i64) {
        let mut any_failed = false;
        for hit in &mut response.hits {
            match self
                .store
                .get_context(hit.chunk.thread_id, hit.chunk.session_idx, hit.chunk.chunk_idx, radius)
                .await
            {
                Ok(fragments) => {
                    hit.context_before = fragments
                        .iter()
                        .filter(|f| f.chunk_idx < hit.chunk.chunk_idx)
                        .cloned()
                        .collect();
                    hit.context_after = fragments
                        .iter()
                        .filter(|f| f.chunk_idx > hit.chunk.chunk_idx)
                        .cloned()
                        .collect();
                }
                Err(e) => {
                    any_failed = true;
                    warn!(error = %e, chunk_id = %hit.chunk.chunk_id, "context expansion failed for hit");
                    response
                        .warnings
                        .push(format!("context expansion failed for {}: {}", hit.chunk.chunk_id, e));
                }
            }
        }
        if any_failed {
            warn!("one or more hits returned without context expansion");
        }
    }

    pub async fn stats(&self) -> CoreResult<Stats> {
        let vector_row_count = self.vectors.row_count().await.map_err(CoreError::Internal)?;
        let lexical_total_rows = self.store.total_chunks().await.map_err(CoreError::Internal)?;
        let lexical_indexable_rows = self.store.indexable_chunks().await.map_err(CoreError::Internal)?;

        Ok(Stats {
            vector_row_count,
            vector_index_type: self.config.milvus.index.index_type.clone(),
            embedding_model: self.embedder.model().to_string(),
            embedding_dimension: self.embedder.dimension(),
            lexical_total_rows,
            lexical_indexable_rows,
            lexical_table: self.store.fts_table().to_string(),
            config_hash: self.config.content_hash(),
        })
    }

    pub async fn health(&self) -> Health {
        let (vector_ok, lexical_ok, embedding_ok) = tokio::join!(
            async { self.vectors.ping().await.is_ok() },
            async { self.store.ping().await.is_ok() },
            self.embedder.is_available(),
        );

        let status = if vector_ok && lexical_ok && embedding_ok {
            HealthStatus::Ok
        } else if !vector_ok && !lexical_ok {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        Health {
            status,
            vector_ok,
            lexical_ok,
            embedding_ok,
        }
    }
}

fn fuse_candidates(
    vector_hits: Vec<Option<crate::vector_search::VectorSearchHit>>,
    bm25_hits: Vec<Option<crate::store::LexicalHit>>,
    req: &SanitizedRequest,
) -> SearchResponse {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for hit in vector_hits.into_iter().flatten() {
        candidates.insert(
            hit.chunk.chunk_id.clone(),
            Candidate {
                chunk: hit.chunk,
                vector_rank: Some(hit.rank),
                vector_score: Some(hit.score),
                bm25_rank: None,
                bm25_score: None,
            },
        );
    }

    for hit in bm25_hits.into_iter().flatten() {
        candidates
            .entry(hit.chunk.chunk_id.clone())
            .and_modify(|c| {
                c.bm25_rank = Some(hit.rank);
                c.bm25_score = Some(hit.bm25_score);
            })
            .or_insert_with(|| Candidate {
                chunk: hit.chunk.clone(),
                vector_rank: None,
                vector_score: None,
                bm25_rank: Some(hit.rank),
                bm25_score: Some(hit.bm25_score),
            });
    }

    let mut scored: Vec<SearchHit> = candidates
        .into_values()
        .map(|c| {
            let term_v = c
                .vector_rank
                .map(|r| req.w_vector / (req.rrf_k + r as f64))
                .unwrap_or(0.0);
            let term_b = c
                .bm25_rank
                .map(|r| req.w_bm25 / (req.rrf_k + r as f64))
                .unwrap_or(0.0);
            SearchHit {
                chunk: c.chunk,
                vector_rank: c.vector_rank,
                vector_score: c.vector_score,
                bm25_rank: c.bm25_rank,
                bm25_score: c.bm25_score,
                rrf_score: Some(term_v + term_b),
                context_before: Vec::new(),
                context_after: Vec::new(),
            }
        })
        .collect();

    scored.sort_by(compare_hits);

    SearchResponse {
        hits: scored,
        degraded: false,
        warnings: Vec::new(),
    }
}

/// Total ordering for RRF results: `rrf_score` desc, both-sides-present
/// first, lower `bm25_rank`, lower `vector_rank`, `chunk_id` asc.
fn compare_hits(a: &SearchHit, b: &SearchHit) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let rrf_a = a.rrf_score.unwrap_or(0.0);
    let rrf_b = b.rrf_score.unwrap_or(0.0);
    let by_rrf = rrf_b.total_cmp(&rrf_a);
    if by_rrf != Ordering::Equal {
        return by_rrf;
    }

    let both_a = a.vector_rank.is_some() && a.bm25_rank.is_some();
    let both_b = b.vector_rank.is_some() && b.bm25_rank.is_some();
    let by_both = both_b.cmp(&both_a);
    if by_both != Ordering::Equal {
        return by_both;
    }

    let by_bm25 = a.bm25_rank.unwrap_or(i64::MAX).cmp(&b.bm25_rank.unwrap_or(i64::MAX));
    if by_bm25 != Ordering::Equal {
        return by_bm25;
    }

    let by_vector = a.vector_rank.unwrap_or(i64::MAX).cmp(&b.vector_rank.unwrap_or(i64::MAX));
    if by_vector != Ordering::Equal {
        return by_vector;
    }

    a.chunk.chunk_id.cmp(&b.chunk.chunk_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;
    use crate::store::LexicalHit;
    use crate::vector_search::VectorSearchHit;

    fn chunk(id: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            thread_id: 1,
            thread_name: "Alpha".into(),
            session_idx: 0,
            chunk_idx: 0,
            message_ids: vec![],
            participant_ids: vec![],
            participant_names: vec![],
            text: "placeholder text".into(),
            start_ts: 0,
            end_ts: 0,
            message_count: 1,
            is_indexable: true,
            char_count: 10,
            alnum_count: 8,
            unique_word_count: 2,
            content_hash: String::new(),
            vector_synced: true,
        }
    }

    #[test]
    fn normalize_weights_falls_back_on_nonpositive() {
        assert_eq!(normalize_weights(Some(0.0), Some(0.0)), (0.5, 0.5));
        assert_eq!(normalize_weights(Some(f64::NAN), Some(1.0)), (0.5, 0.5));
        assert_eq!(normalize_weights(Some(-1.0), Some(-1.0)), (0.5, 0.5));
    }

    #[test]
    fn normalize_weights_scales_by_sum() {
        let (v, b) = normalize_weights(Some(1.0), Some(3.0));
        assert!((v - 0.25).abs() < 1e-9);
        assert!((b - 0.75).abs() < 1e-9);
    }

    /// Scenario S4: vector [A,B,C] ranks 1,2,3; lexical [B,D,A] ranks 1,2,3;
    /// rrf_k=60, equal weights. B should rank first (best on both lists).
    #[test]
    fn s4_hybrid_fusion_orders_by_rrf_score() {
        let req = SanitizedRequest {
            query: "q".into(),
            mode: SearchMode::Hybrid,
            limit: 10,
            context: 0,
            rrf_k: 60.0,
            w_vector: 0.5,
            w_bm25: 0.5,
            candidate_mult: 2,
        };

        let vector_hits = vec![
            Some(VectorSearchHit { chunk: chunk("A"), rank: 1, score: 0.9 }),
            Some(VectorSearchHit { chunk: chunk("B"), rank: 2, score: 0.8 }),
            Some(VectorSearchHit { chunk: chunk("C"), rank: 3, score: 0.7 }),
        ];
        let bm25_hits = vec![
            Some(LexicalHit { chunk: chunk("B"), rank: 1, bm25_score: 9.0 }),
            Some(LexicalHit { chunk: chunk("D"), rank: 2, bm25_score: 8.0 }),
            Some(LexicalHit { chunk: chunk("A"), rank: 3, bm25_score: 7.0 }),
        ];

        let response = fuse_candidates(vector_hits, bm25_hits, &req);
        let ids: Vec<&str> = response.hits.iter().map(|h| h.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids[0], "B");
        assert_eq!(ids[1], "A");
    }

    /// Scenario S5: embedding down, hybrid falls back to a pure bm25 list
    /// with rrf_score = 0.5 / (60 + rank) and vector_rank = None.
    #[test]
    fn s5_degraded_hybrid_synthesizes_rrf_from_bm25_alone() {
        let req = SanitizedRequest {
            query: "q".into(),
            mode: SearchMode::Hybrid,
            limit: 10,
            context: 0,
            rrf_k: 60.0,
            w_vector: 0.5,
            w_bm25: 0.5,
            candidate_mult: 2,
        };
        let bm25_hits = vec![Some(LexicalHit { chunk: chunk("X"), rank: 1, bm25_score: 5.0 })];

        let response = fuse_candidates(Vec::new(), bm25_hits, &req);
        let hit = &response.hits[0];
        assert_eq!(hit.vector_rank, None);
        assert!((hit.rrf_score.unwrap() - (0.5 / 61.0)).abs() < 1e-9);
    }
}
