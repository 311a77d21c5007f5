//! Single source of truth for chunking, quality, embedding, index, and
//! hybrid-search parameters (C1). Loaded once at startup and treated as
//! immutable; any observed mutation implies a restart (spec §5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub milvus: MilvusConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunking: ChunkingConfig::default(),
            quality: QualityConfig::default(),
            embedding: EmbeddingConfig::default(),
            milvus: MilvusConfig::default(),
            hybrid: HybridConfig::default(),
            database: DatabaseConfig::default(),
            metadata: MetadataConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub coalesce: CoalesceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub size: SizeConfig,
    #[serde(default)]
    pub format: FormatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceConfig {
    #[serde(default = "default_max_gap_seconds")]
    pub max_gap_seconds: i64,
    #[serde(default = "default_max_combined_chars")]
    pub max_combined_chars: i64,
}

fn default_max_gap_seconds() -> i64 {
    120
}
fn default_max_combined_chars() -> i64 {
    900
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        CoalesceConfig {
            max_gap_seconds: default_max_gap_seconds(),
            max_combined_chars: default_max_combined_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_gap_minutes")]
    pub gap_minutes: i64,
}

fn default_gap_minutes() -> i64 {
    45
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            gap_minutes: default_gap_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeConfig {
    #[serde(default = "default_target_chars")]
    pub target_chars: i64,
    #[serde(default = "default_max_chars")]
    pub max_chars: i64,
    #[serde(default = "default_min_chars")]
    pub min_chars: i64,
}

fn default_target_chars() -> i64 {
    900
}
fn default_max_chars() -> i64 {
    1400
}
fn default_min_chars() -> i64 {
    0
}

impl Default for SizeConfig {
    fn default() -> Self {
        SizeConfig {
            target_chars: default_target_chars(),
            max_chars: default_max_chars(),
            min_chars: default_min_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(default = "default_sender_prefix")]
    pub sender_prefix: bool,
}

fn default_sender_prefix() -> bool {
    true
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig {
            sender_prefix: default_sender_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_min_quality_chars")]
    pub min_chars: i64,
    #[serde(default = "default_min_alnum_chars")]
    pub min_alnum_chars: i64,
    #[serde(default = "default_min_unique_words")]
    pub min_unique_words: i64,
    #[serde(default)]
    pub url_special_case: UrlSpecialCaseConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
}

fn default_min_quality_chars() -> i64 {
    250
}
fn default_min_alnum_chars() -> i64 {
    140
}
fn default_min_unique_words() -> i64 {
    8
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            min_chars: default_min_quality_chars(),
            min_alnum_chars: default_min_alnum_chars(),
            min_unique_words: default_min_unique_words(),
            url_special_case: UrlSpecialCaseConfig::default(),
            filters: FiltersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlSpecialCaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_url_min_alnum_chars")]
    pub min_alnum_chars: i64,
}

fn default_url_min_alnum_chars() -> i64 {
    60
}

impl Default for UrlSpecialCaseConfig {
    fn default() -> Self {
        UrlSpecialCaseConfig {
            enabled: false,
            min_alnum_chars: default_url_min_alnum_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default = "default_max_url_density")]
    pub max_url_density: f64,
    #[serde(default = "default_true")]
    pub skip_attachment_only: bool,
    #[serde(default = "default_true")]
    pub skip_base64_blobs: bool,
}

fn default_max_url_density() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}

impl Default for FiltersConfig {
    fn default() -> Self {
        FiltersConfig {
            max_url_density: default_max_url_density(),
            skip_attachment_only: true,
            skip_base64_blobs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

fn default_embedding_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding".to_string()
}
fn default_embedding_dimension() -> usize {
    768
}
fn default_embedding_batch_size() -> usize {
    32
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Metric {
    L2,
    IP,
    Cosine,
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Cosine
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilvusConfig {
    #[serde(default = "default_milvus_address")]
    pub address: String,
    #[serde(default = "default_chunk_collection")]
    pub chunk_collection: String,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: VectorSearchConfig,
}

fn default_milvus_address() -> String {
    "http://127.0.0.1:19530".to_string()
}
fn default_chunk_collection() -> String {
    "chat_chunks".to_string()
}

impl Default for MilvusConfig {
    fn default() -> Self {
        MilvusConfig {
            address: default_milvus_address(),
            chunk_collection: default_chunk_collection(),
            index: IndexConfig::default(),
            search: VectorSearchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_type", rename = "type")]
    pub index_type: String,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default = "default_m")]
    pub m: u32,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: u32,
}

fn default_index_type() -> String {
    "HNSW".to_string()
}
fn default_m() -> u32 {
    16
}
fn default_ef_construction() -> u32 {
    200
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            index_type: default_index_type(),
            metric: Metric::default(),
            m: default_m(),
            ef_construction: default_ef_construction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchConfig {
    #[serde(default = "default_search_ef")]
    pub ef: u32,
    #[serde(default = "default_fetch_multiplier")]
    pub fetch_multiplier: i64,
}

fn default_search_ef() -> u32 {
    64
}
fn default_fetch_multiplier() -> i64 {
    3
}

impl Default for VectorSearchConfig {
    fn default() -> Self {
        VectorSearchConfig {
            ef: default_search_ef(),
            fetch_multiplier: default_fetch_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rrf: RrfConfig,
    #[serde(default)]
    pub weights: WeightsConfig,
    #[serde(default)]
    pub bm25: Bm25Config,
}

impl Default for HybridConfig {
    fn default() -> Self {
        HybridConfig {
            enabled: true,
            rrf: RrfConfig::default(),
            weights: WeightsConfig::default(),
            bm25: Bm25Config::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrfConfig {
    #[serde(default = "default_rrf_k")]
    pub k: f64,
}

fn default_rrf_k() -> f64 {
    60.0
}

impl Default for RrfConfig {
    fn default() -> Self {
        RrfConfig { k: default_rrf_k() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsConfig {
    #[serde(default = "default_weight")]
    pub vector: f64,
    #[serde(default = "default_weight")]
    pub bm25: f64,
}

fn default_weight() -> f64 {
    0.5
}

impl Default for WeightsConfig {
    fn default() -> Self {
        WeightsConfig {
            vector: default_weight(),
            bm25: default_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Config {
    #[serde(default = "default_bm25_table")]
    pub table: String,
}

fn default_bm25_table() -> String {
    "chunks_fts".to_string()
}

impl Default for Bm25Config {
    fn default() -> Self {
        Bm25Config {
            table: default_bm25_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./data/chatvault.sqlite")
}

impl Default for SqliteConfig {
    fn default() -> Self {
        SqliteConfig {
            path: default_sqlite_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_table")]
    pub table: String,
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

fn default_metadata_table() -> String {
    "index_metadata".to_string()
}

impl Default for MetadataConfig {
    fn default() -> Self {
        MetadataConfig {
            table: default_metadata_table(),
            keys: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            cors_permissive: false,
        }
    }
}

/// Loads and validates the configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file at {}", path.display()))?;
    let cfg: Config = toml::from_str(&raw).context("parsing config TOML")?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.chunking.size.max_chars < cfg.chunking.size.target_chars {
        bail!("chunking.size.max_chars must be >= chunking.size.target_chars");
    }
    if cfg.embedding.dimension == 0 {
        bail!("embedding.dimension must be > 0");
    }
    if cfg.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    let table = &cfg.hybrid.bm25.table;
    let is_valid_identifier = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.chars().next().unwrap().is_ascii_digit();
    if !is_valid_identifier {
        bail!("hybrid.bm25.table must be a valid SQL identifier, got {:?}", table);
    }
    Ok(())
}

impl Config {
    /// Stable digest over the canonical re-serialization of this config,
    /// truncated to 16 hex chars to match the rest of the system's hashing
    /// convention (see `store::compute_content_hash`). Used by Stats() and
    /// the metadata table.
    pub fn content_hash(&self) -> String {
        let canonical = toml::to_string(self).expect("Config always serializes");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        hex::encode(digest)[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_stable_and_sensitive() {
        let a = Config::default();
        let mut b = Config::default();
        assert_eq!(a.content_hash(), b.content_hash());
        b.quality.min_chars += 1;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn rejects_bad_bm25_table_identifier() {
        let mut cfg = Config::default();
        cfg.hybrid.bm25.table = "bad table; drop".to_string();
        assert!(validate(&cfg).is_err());
    }
}
