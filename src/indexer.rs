//! The Vector Indexer (C5): the write-side pipeline that keeps the vector
//! database's row set caught up with newly admitted or edited chunks.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::models::Chunk;
use crate::store::ChunkStore;
use crate::vector::{build_row, VectorStore};

pub struct VectorIndexer {
    store: ChunkStore,
    embedder: EmbeddingClient,
    vectors: Arc<dyn VectorStore>,
    batch_size: i64,
}

/// Summary of one `RunOnce` pass, for logging and the CLI's exit status.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexRunStats {
    pub batches: u64,
    pub chunks_embedded: u64,
}

impl VectorIndexer {
    pub fn new(
        store: ChunkStore,
        embedder: EmbeddingClient,
        vectors: Arc<dyn VectorStore>,
        config: &Config,
    ) -> Self {
        VectorIndexer {
            store,
            embedder,
            vectors,
            batch_size: config.embedding.batch_size as i64,
        }
    }

    /// Repeatedly pulls batches of unsynced indexable chunks until none
    /// remain, embedding and upserting each batch, then marking it synced.
    /// A batch that fails to embed or upsert is left unsynced and retried on
    /// the next run; it does not abort the whole pass.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<IndexRunStats> {
        let mut stats = IndexRunStats::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let batch = self.store.unsynced_indexable_chunks(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            match self.index_batch(&batch, cancel).await {
                Ok(()) => {
                    stats.batches += 1;
                    stats.chunks_embedded += batch.len() as u64;
                    info!(batch_size = batch.len(), "indexed batch of chunks");
                }
                Err(e) => {
                    warn!(error = %e, batch_size = batch.len(), "failed to index batch, will retry next run");
                    break;
                }
            }
        }

        Ok(stats)
    }

    async fn index_batch(&self, batch: &[Chunk], cancel: &CancellationToken) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts, cancel).await?;

        let rows = batch
            .iter()
            .zip(vectors.into_iter())
            .map(|(chunk, embedding)| {
                build_row(
                    &chunk.chunk_id,
                    chunk.thread_id,
                    &chunk.thread_name,
                    chunk.session_idx,
                    chunk.chunk_idx,
                    &chunk.participant_ids,
                    &chunk.participant_names,
                    &chunk.text,
                    &chunk.message_ids,
                    chunk.start_ts,
                    chunk.end_ts,
                    chunk.message_count,
                    embedding,
                )
            })
            .collect();

        self.vectors.upsert_batch(rows).await?;

        let ids: Vec<String> = batch.iter().map(|c| c.chunk_id.clone()).collect();
        self.store.mark_synced(&ids).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::VectorRow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeVectorStore {
        upserted: Mutex<Vec<VectorRow>>,
    }

    #[async_trait]
    impl VectorStore for FakeVectorStore {
        async fn upsert_batch(&self, rows: Vec<VectorRow>) -> Result<()> {
            self.upserted.lock().unwrap().extend(rows);
            Ok(())
        }
        async fn search(&self, _query_vector: &[f32], _limit: i64, _ef: u32) -> Result<Vec<crate::vector::VectorHit>> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn row_count(&self) -> Result<i64> {
            Ok(self.upserted.lock().unwrap().len() as i64)
        }
    }

    #[tokio::test]
    async fn run_once_respects_cancellation_before_touching_backend() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations_on(&pool, "chunks_fts").await.unwrap();
        let store = ChunkStore::new(pool, "chunks_fts".to_string());

        for idx in 0..5 {
            let mut c = sample_chunk(idx);
            c.content_hash = crate::store::compute_content_hash(&c);
            store.upsert(&c).await.unwrap();
        }

        let embedder = EmbeddingClient::new(&crate::config::EmbeddingConfig {
            dimension: 3,
            ..Default::default()
        })
        .unwrap();

        let vectors = Arc::new(FakeVectorStore {
            upserted: Mutex::new(Vec::new()),
        });

        let mut config = Config::default();
        config.embedding.batch_size = 2;
        config.embedding.dimension = 3;

        let indexer = VectorIndexer::new(store.clone(), embedder, vectors.clone(), &config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = indexer.run_once(&cancel).await.unwrap();
        assert_eq!(result.batches, 0);
        assert_eq!(store.unsynced_indexable_chunks(100).await.unwrap().len(), 5);
    }

    fn sample_chunk(idx: i64) -> Chunk {
        Chunk {
            chunk_id: format!("c{idx}"),
            thread_id: 1,
            thread_name: "Alpha".into(),
            session_idx: 0,
            chunk_idx: idx,
            message_ids: vec!["m1".into()],
            participant_ids: vec![1],
            participant_names: vec!["Alice".into()],
            text: "hello there, this is a sample chunk".into(),
            start_ts: 0,
            end_ts: 0,
            message_count: 1,
            is_indexable: true,
            char_count: 30,
            alnum_count: 25,
            unique_word_count: 6,
            content_hash: String::new(),
            vector_synced: false,
        }
    }
}
