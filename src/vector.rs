//! Vector DB client wrapper (C5 write side / C8 read side share this).
//!
//! The vector database engine itself — its HNSW graph, its distance
//! computation — is an explicit non-goal; this module only adapts
//! `milvus-sdk-rust`'s wire client to the shapes the Vector Indexer and
//! Vector Searcher need. No singleton: one [`MilvusVectorStore`] instance is
//! constructed at startup and handed to both, per the "no singletons in the
//! search path" redesign note.

use anyhow::{Context, Result};
use async_trait::async_trait;
use milvus::client::Client as MilvusClient;
use milvus::collection::Collection;
use milvus::index::{IndexParams, IndexType, MetricType};
use milvus::schema::{CollectionSchemaBuilder, FieldSchema};
use milvus::value::Value;

use crate::config::{IndexConfig, Metric, MilvusConfig, VectorSearchConfig};

const THREAD_NAME_MAX: usize = 512;
const TEXT_MAX: usize = 8192;
const MESSAGE_IDS_MAX_BYTES: usize = 8192;
const PARTICIPANT_IDS_MAX_BYTES: usize = 1024;
const PARTICIPANT_NAMES_MAX_BYTES: usize = 2048;

/// One row as stored in the vector collection (schema per spec §4.4).
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub chunk_id: String,
    pub thread_id: i64,
    pub thread_name: String,
    pub session_idx: i64,
    pub chunk_idx: i64,
    pub participant_ids_json: String,
    pub participant_names_json: String,
    pub text: String,
    pub message_ids_json: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: i64,
    pub embedding: Vec<f32>,
}

/// A k-NN hit, carrying enough stored scalar fields to reconstruct a
/// [`crate::models::Chunk`] without a round-trip to the Chunk Store (§4.7).
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub thread_id: i64,
    pub thread_name: String,
    pub session_idx: i64,
    pub chunk_idx: i64,
    pub participant_ids_json: String,
    pub participant_names_json: String,
    pub text: String,
    pub message_ids_json: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: i64,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert_batch(&self, rows: Vec<VectorRow>) -> Result<()>;
    async fn search(&self, query_vector: &[f32], limit: i64, ef: u32) -> Result<Vec<VectorHit>>;
    async fn ping(&self) -> Result<()>;
    async fn row_count(&self) -> Result<i64>;
}

/// Truncates a string by code points (never by byte length, which could
/// split a multi-byte character).
fn truncate_code_points(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Truncates a JSON array's serialized form by dropping trailing elements
/// until it fits within `max_bytes`, falling back to `"[]"`.
fn truncate_json_array(items: &[String], max_bytes: usize) -> String {
    let mut candidate: Vec<String> = items.to_vec();
    loop {
        let serialized = serde_json::to_string(&candidate).unwrap_or_else(|_| "[]".to_string());
        if serialized.len() <= max_bytes {
            return serialized;
        }
        if candidate.is_empty() {
            return "[]".to_string();
        }
        candidate.pop();
    }
}

/// Builds a bounded [`VectorRow`] from a Chunk's fields, applying the
/// overflow strategy from spec §4.4.
pub fn build_row(
    chunk_id: &str,
    thread_id: i64,
    thread_name: &str,
    session_idx: i64,
    chunk_idx: i64,
    participant_ids: &[i64],
    participant_names: &[String],
    text: &str,
    message_ids: &[String],
    start_ts: i64,
    end_ts: i64,
    message_count: i64,
    embedding: Vec<f32>,
) -> VectorRow {
    let participant_ids_strs: Vec<String> = participant_ids.iter().map(|id| id.to_string()).collect();
    VectorRow {
        chunk_id: chunk_id.to_string(),
        thread_id,
        thread_name: truncate_code_points(thread_name, THREAD_NAME_MAX),
        session_idx,
        chunk_idx,
        participant_ids_json: truncate_json_array(&participant_ids_strs, PARTICIPANT_IDS_MAX_BYTES),
        participant_names_json: truncate_json_array(participant_names, PARTICIPANT_NAMES_MAX_BYTES),
        text: truncate_code_points(text, TEXT_MAX),
        message_ids_json: truncate_json_array(message_ids, MESSAGE_IDS_MAX_BYTES),
        start_ts,
        end_ts,
        message_count,
        embedding,
    }
}

fn metric_type(metric: Metric) -> MetricType {
    match metric {
        Metric::L2 => MetricType::L2,
        Metric::IP => MetricType::IP,
        Metric::Cosine => MetricType::COSINE,
    }
}

pub struct MilvusVectorStore {
    client: MilvusClient,
    collection_name: String,
    dimension: usize,
    index: IndexConfig,
    search_cfg: VectorSearchConfig,
}

impl MilvusVectorStore {
    pub async fn connect(cfg: &MilvusConfig, dimension: usize) -> Result<Self> {
        let client = MilvusClient::new(cfg.address.clone())
            .await
            .context("connecting to vector database")?;

        let store = MilvusVectorStore {
            client,
            collection_name: cfg.chunk_collection.clone(),
            dimension,
            index: cfg.index.clone(),
            search_cfg: cfg.search.clone(),
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        if self.collection().await.is_ok() {
            return Ok(());
        }

        let schema = CollectionSchemaBuilder::new(&self.collection_name, "chat chunk vectors")
            .add_field(FieldSchema::new_primary_varchar("chunk_id", "", 32, false))
            .add_field(FieldSchema::new_varchar("thread_name", "", THREAD_NAME_MAX as i32))
            .add_field(FieldSchema::new_int64("thread_id", ""))
            .add_field(FieldSchema::new_int64("session_idx", ""))
            .add_field(FieldSchema::new_int64("chunk_idx", ""))
            .add_field(FieldSchema::new_varchar(
                "participant_ids",
                "",
                PARTICIPANT_IDS_MAX_BYTES as i32,
            ))
            .add_field(FieldSchema::new_varchar(
                "participant_names",
                "",
                PARTICIPANT_NAMES_MAX_BYTES as i32,
            ))
            .add_field(FieldSchema::new_varchar("text", "", TEXT_MAX as i32))
            .add_field(FieldSchema::new_varchar(
                "message_ids",
                "",
                MESSAGE_IDS_MAX_BYTES as i32,
            ))
            .add_field(FieldSchema::new_int64("start_ts", ""))
            .add_field(FieldSchema::new_int64("end_ts", ""))
            .add_field(FieldSchema::new_int64("message_count", ""))
            .add_field(FieldSchema::new_float_vector(
                "embedding",
                "",
                self.dimension as i32,
            ))
            .build()
            .context("building vector collection schema")?;

        let collection = self
            .client
            .create_collection(schema, None)
            .await
            .context("creating vector collection")?;

        let index_params = IndexParams::new(
            "embedding_index".to_string(),
            IndexType::HNSW,
            metric_type(self.index.metric),
            [
                ("M".to_string(), self.index.m.to_string()),
                ("efConstruction".to_string(), self.index.ef_construction.to_string()),
            ]
            .into_iter()
            .collect(),
        );
        collection
            .create_index("embedding", index_params)
            .await
            .context("creating vector index")?;
        collection.load(1).await.context("loading vector collection")?;

        Ok(())
    }

    async fn collection(&self) -> Result<Collection> {
        self.client
            .get_collection(&self.collection_name)
            .await
            .context("looking up vector collection")
    }
}

#[async_trait]
impl VectorStore for MilvusVectorStore {
    async fn upsert_batch(&self, rows: Vec<VectorRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let collection = self.collection().await?;

        let chunk_ids: Vec<String> = rows.iter().map(|r| r.chunk_id.clone()).collect();
        let thread_ids: Vec<i64> = rows.iter().map(|r| r.thread_id).collect();
        let thread_names: Vec<String> = rows.iter().map(|r| r.thread_name.clone()).collect();
        let session_idxs: Vec<i64> = rows.iter().map(|r| r.session_idx).collect();
        let chunk_idxs: Vec<i64> = rows.iter().map(|r| r.chunk_idx).collect();
        let participant_ids: Vec<String> = rows.iter().map(|r| r.participant_ids_json.clone()).collect();
        let participant_names: Vec<String> =
            rows.iter().map(|r| r.participant_names_json.clone()).collect();
        let texts: Vec<String> = rows.iter().map(|r| r.text.clone()).collect();
        let message_ids: Vec<String> = rows.iter().map(|r| r.message_ids_json.clone()).collect();
        let start_tss: Vec<i64> = rows.iter().map(|r| r.start_ts).collect();
        let end_tss: Vec<i64> = rows.iter().map(|r| r.end_ts).collect();
        let message_counts: Vec<i64> = rows.iter().map(|r| r.message_count).collect();
        let embeddings: Vec<Vec<f32>> = rows.into_iter().map(|r| r.embedding).collect();

        // Deleting by primary key first makes this an upsert: milvus-sdk-rust's
        // insert path is append-only at the segment level.
        collection
            .delete(&format!(
                "chunk_id in [{}]",
                chunk_ids
                    .iter()
                    .map(|id| format!("\"{}\"", id))
                    .collect::<Vec<_>>()
                    .join(",")
            ))
            .await
            .context("deleting stale vector rows before upsert")?;

        collection
            .insert(
                vec![
                    Value::from(chunk_ids),
                    Value::from(thread_names),
                    Value::from(thread_ids),
                    Value::from(session_idxs),
                    Value::from(chunk_idxs),
                    Value::from(participant_ids),
                    Value::from(participant_names),
                    Value::from(texts),
                    Value::from(message_ids),
                    Value::from(start_tss),
                    Value::from(end_tss),
                    Value::from(message_counts),
                    Value::from(embeddings),
                ],
                None,
            )
            .await
            .context("inserting vector rows")?;

        collection.flush().await.context("flushing vector collection")?;
        Ok(())
    }

    async fn search(&self, query_vector: &[f32], limit: i64, ef: u32) -> Result<Vec<VectorHit>> {
        let effective_ef = ef.max(self.search_cfg.ef);
        let collection = self.collection().await?;

        let results = collection
            .search(
                vec![Value::from(query_vector.to_vec())],
                "embedding",
                limit as i32,
                metric_type(self.index.metric),
                vec![
                    "thread_id",
                    "thread_name",
                    "session_idx",
                    "chunk_idx",
                    "participant_ids",
                    "participant_names",
                    "text",
                    "message_ids",
                    "start_ts",
                    "end_ts",
                    "message_count",
                ],
                &[("ef".to_string(), effective_ef.to_string())].into_iter().collect(),
            )
            .await
            .context("running vector k-NN search")?;

        let mut hits = Vec::new();
        for row in results.into_rows() {
            hits.push(VectorHit {
                chunk_id: row.get_varchar("chunk_id")?,
                thread_id: row.get_int64("thread_id")?,
                thread_name: row.get_varchar("thread_name")?,
                session_idx: row.get_int64("session_idx")?,
                chunk_idx: row.get_int64("chunk_idx")?,
                participant_ids_json: row.get_varchar("participant_ids")?,
                participant_names_json: row.get_varchar("participant_names")?,
                text: row.get_varchar("text")?,
                message_ids_json: row.get_varchar("message_ids")?,
                start_ts: row.get_int64("start_ts")?,
                end_ts: row.get_int64("end_ts")?,
                message_count: row.get_int64("message_count")?,
                score: row.score(),
            });
        }
        Ok(hits)
    }

    async fn ping(&self) -> Result<()> {
        self.collection().await?;
        Ok(())
    }

    async fn row_count(&self) -> Result<i64> {
        let collection = self.collection().await?;
        collection.num_entities().await.map(|n| n as i64).context("counting vector rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_code_points_not_bytes() {
        let text: String = std::iter::repeat('😀').take(10).collect();
        let truncated = truncate_code_points(&text, 3);
        assert_eq!(truncated.chars().count(), 3);
    }

    #[test]
    fn truncate_json_array_drops_trailing_elements() {
        let items: Vec<String> = (0..1000).map(|i| format!("item-{}", i)).collect();
        let out = truncate_json_array(&items, 64);
        assert!(out.len() <= 64);
        let parsed: Vec<String> = serde_json::from_str(&out).unwrap();
        assert!(parsed.len() < items.len());
    }

    #[test]
    fn truncate_json_array_falls_back_to_empty() {
        let items = vec!["x".repeat(1000)];
        let out = truncate_json_array(&items, 4);
        assert_eq!(out, "[]");
    }
}
