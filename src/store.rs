//! The Chunk Store (C4): the system of record for Chunks.
//!
//! Maintains the `chunks` table and, transitively through triggers installed
//! by [`crate::migrate`], the lexical full-text index over it. This module
//! never issues the `CREATE TRIGGER` DDL itself (that lives in `migrate`) but
//! relies on it: every write here is a plain `INSERT ... ON CONFLICT` inside
//! one transaction, and the FTS mirror follows for free.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::models::{Chunk, ChunkFragment};

#[derive(Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
    fts_table: String,
}

/// A lexical search hit: the matched chunk plus its 1-based rank and
/// positive BM25 score (the engine returns `rank` as a negative number).
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk: Chunk,
    pub rank: i64,
    pub bm25_score: f64,
}

impl ChunkStore {
    pub fn new(pool: SqlitePool, fts_table: String) -> Self {
        ChunkStore { pool, fts_table }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `Upsert(chunk)` per spec §4.3: inserts or replaces all fields; resets
    /// `vector_synced` to false iff the stored hash differs from the new one
    /// (or there was no stored row). The FTS mirror updates transactionally
    /// via triggers, not here.
    pub async fn upsert(&self, chunk: &Chunk) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String, i64)> = sqlx::query(
            "SELECT content_hash, vector_synced FROM chunks WHERE chunk_id = ?",
        )
        .bind(&chunk.chunk_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| (row.get::<String, _>("content_hash"), row.get::<i64, _>("vector_synced")));

        let vector_synced: bool = match &existing {
            None => false,
            Some((hash, synced)) => hash == &chunk.content_hash && *synced != 0,
        };

        let message_ids_json = serde_json::to_string(&chunk.message_ids)?;
        let participant_ids_json = serde_json::to_string(&chunk.participant_ids)?;
        let participant_names_json = serde_json::to_string(&chunk.participant_names)?;

        sqlx::query(
            r#"
            INSERT INTO chunks (
                chunk_id, thread_id, thread_name, session_idx, chunk_idx,
                message_ids, participant_ids, participant_names, text,
                start_ts, end_ts, message_count, is_indexable,
                char_count, alnum_count, unique_word_count,
                content_hash, vector_synced
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                thread_id = excluded.thread_id,
                thread_name = excluded.thread_name,
                session_idx = excluded.session_idx,
                chunk_idx = excluded.chunk_idx,
                message_ids = excluded.message_ids,
                participant_ids = excluded.participant_ids,
                participant_names = excluded.participant_names,
                text = excluded.text,
                start_ts = excluded.start_ts,
                end_ts = excluded.end_ts,
                message_count = excluded.message_count,
                is_indexable = excluded.is_indexable,
                char_count = excluded.char_count,
                alnum_count = excluded.alnum_count,
                unique_word_count = excluded.unique_word_count,
                content_hash = excluded.content_hash,
                vector_synced = excluded.vector_synced
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(chunk.thread_id)
        .bind(&chunk.thread_name)
        .bind(chunk.session_idx)
        .bind(chunk.chunk_idx)
        .bind(&message_ids_json)
        .bind(&participant_ids_json)
        .bind(&participant_names_json)
        .bind(&chunk.text)
        .bind(chunk.start_ts)
        .bind(chunk.end_ts)
        .bind(chunk.message_count)
        .bind(chunk.is_indexable)
        .bind(chunk.char_count)
        .bind(chunk.alnum_count)
        .bind(chunk.unique_word_count)
        .bind(&chunk.content_hash)
        .bind(vector_synced)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(vector_synced)
    }

    /// `GetContext(thread_id, session_idx, chunk_idx, radius)` per §4.3.
    pub async fn get_context(
        &self,
        thread_id: i64,
        session_idx: i64,
        chunk_idx: i64,
        radius: i64,
    ) -> Result<Vec<ChunkFragment>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, chunk_idx, text, is_indexable
            FROM chunks
            WHERE thread_id = ? AND session_idx = ?
              AND chunk_idx BETWEEN ? AND ?
              AND chunk_idx != ?
            ORDER BY chunk_idx ASC
            "#,
        )
        .bind(thread_id)
        .bind(session_idx)
        .bind(chunk_idx - radius)
        .bind(chunk_idx + radius)
        .bind(chunk_idx)
        .fetch_all(&self.pool)
        .await
        .context("querying GetContext")?;

        Ok(rows
            .iter()
            .map(|row| ChunkFragment {
                chunk_id: row.get("chunk_id"),
                chunk_idx: row.get("chunk_idx"),
                text: row.get("text"),
                is_indexable: row.get::<i64, _>("is_indexable") != 0,
            })
            .collect())
    }

    /// `GetByID(chunk_id) -> Chunk?`.
    pub async fn get_by_id(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_chunk(&r)).transpose()
    }

    /// `LexicalSearch(parsed_query, limit)` per §4.3/§4.6: top-N by BM25
    /// restricted to `is_indexable = true`.
    pub async fn lexical_search(&self, parsed_query: &str, limit: i64) -> Result<Vec<LexicalHit>> {
        if parsed_query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT c.*, f.rank AS fts_rank
            FROM {fts} f
            JOIN chunks c ON c.chunk_id = f.chunk_id
            WHERE f MATCH ? AND f.is_indexable = 1
            ORDER BY f.rank ASC
            LIMIT ?
            "#,
            fts = self.fts_table
        );

        let rows = sqlx::query(&sql)
            .bind(parsed_query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("running lexical search")?;

        let mut hits = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let chunk = row_to_chunk(row)?;
            let raw_rank: f64 = row.get("fts_rank");
            hits.push(LexicalHit {
                chunk,
                rank: (idx + 1) as i64,
                bm25_score: -raw_rank,
            });
        }
        Ok(hits)
    }

    /// Indexable chunks not yet synced to the vector DB, oldest first,
    /// bounded by `batch_size` (C5).
    pub async fn unsynced_indexable_chunks(&self, batch_size: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE is_indexable = 1 AND vector_synced = 0 ORDER BY chunk_id LIMIT ?",
        )
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn mark_synced(&self, chunk_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in chunk_ids {
            sqlx::query("UPDATE chunks SET vector_synced = 1 WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn total_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn indexable_chunks(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE is_indexable = 1")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub fn fts_table(&self) -> &str {
        &self.fts_table
    }

    /// Probes that the FTS table exists and is queryable, for Health().
    pub async fn ping(&self) -> Result<()> {
        let sql = format!("SELECT count(*) FROM {} LIMIT 1", self.fts_table);
        sqlx::query(&sql).fetch_optional(&self.pool).await?;
        Ok(())
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let message_ids: Vec<String> = serde_json::from_str(row.get::<String, _>("message_ids").as_str())?;
    let participant_ids: Vec<i64> =
        serde_json::from_str(row.get::<String, _>("participant_ids").as_str())?;
    let participant_names: Vec<String> =
        serde_json::from_str(row.get::<String, _>("participant_names").as_str())?;

    Ok(Chunk {
        chunk_id: row.get("chunk_id"),
        thread_id: row.get("thread_id"),
        thread_name: row.get("thread_name"),
        session_idx: row.get("session_idx"),
        chunk_idx: row.get("chunk_idx"),
        message_ids,
        participant_ids,
        participant_names,
        text: row.get("text"),
        start_ts: row.get("start_ts"),
        end_ts: row.get("end_ts"),
        message_count: row.get("message_count"),
        is_indexable: row.get::<i64, _>("is_indexable") != 0,
        char_count: row.get("char_count"),
        alnum_count: row.get("alnum_count"),
        unique_word_count: row.get("unique_word_count"),
        content_hash: row.get("content_hash"),
        vector_synced: row.get::<i64, _>("vector_synced") != 0,
    })
}

/// Deterministic content hash per spec §4.3: a digest over the fields
/// visible to the vector DB plus `is_indexable`, truncated to 16 hex chars.
/// `content_hash` changes iff one of these fields changes — mutating an
/// analytic-only field (`alnum_count`, `char_count`, ...) never changes it.
pub fn compute_content_hash(chunk: &Chunk) -> String {
    let message_ids_json = serde_json::to_string(&chunk.message_ids).unwrap_or_default();
    let participant_ids_json = serde_json::to_string(&chunk.participant_ids).unwrap_or_default();
    let participant_names_json = serde_json::to_string(&chunk.participant_names).unwrap_or_default();
    let indexable_flag: &[u8] = if chunk.is_indexable { b"1" } else { b"0" };

    let mut hasher = Sha256::new();
    hasher.update(chunk.text.as_bytes());
    hasher.update([0u8]);
    hasher.update(message_ids_json.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk.thread_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(participant_ids_json.as_bytes());
    hasher.update([0u8]);
    hasher.update(participant_names_json.as_bytes());
    hasher.update([0u8]);
    hasher.update(indexable_flag);
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        Chunk {
            chunk_id: "abc".into(),
            thread_id: 1,
            thread_name: "Alpha".into(),
            session_idx: 0,
            chunk_idx: 0,
            message_ids: vec!["m1".into()],
            participant_ids: vec![1],
            participant_names: vec!["Alice".into()],
            text: "hello there".into(),
            start_ts: 0,
            end_ts: 0,
            message_count: 1,
            is_indexable: true,
            char_count: 11,
            alnum_count: 9,
            unique_word_count: 2,
            content_hash: String::new(),
            vector_synced: false,
        }
    }

    #[test]
    fn hash_unaffected_by_analytic_fields() {
        let mut a = sample_chunk();
        a.content_hash = compute_content_hash(&a);
        let mut b = a.clone();
        b.alnum_count += 5;
        b.char_count += 5;
        b.unique_word_count += 1;
        assert_eq!(compute_content_hash(&a), compute_content_hash(&b));
    }

    #[test]
    fn hash_changes_with_text() {
        let mut a = sample_chunk();
        a.content_hash = compute_content_hash(&a);
        let mut b = a.clone();
        b.text.push_str(" more");
        assert_ne!(compute_content_hash(&a), compute_content_hash(&b));
    }

    #[test]
    fn hash_changes_with_indexable_flag() {
        let a = sample_chunk();
        let mut b = a.clone();
        b.is_indexable = !a.is_indexable;
        assert_ne!(compute_content_hash(&a), compute_content_hash(&b));
    }

    #[tokio::test]
    async fn upsert_idempotent_preserves_vector_synced() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations_on(&pool, "chunks_fts").await.unwrap();
        let store = ChunkStore::new(pool, "chunks_fts".to_string());

        let mut chunk = sample_chunk();
        chunk.content_hash = compute_content_hash(&chunk);
        let synced_after_first = store.upsert(&chunk).await.unwrap();
        assert!(!synced_after_first);

        store.mark_synced(&[chunk.chunk_id.clone()]).await.unwrap();

        // Re-upserting the identical chunk (same hash) must not reset sync state.
        let synced_after_second = store.upsert(&chunk).await.unwrap();
        assert!(synced_after_second);

        // Changing the text (and therefore the hash) must reset it.
        chunk.text.push_str(" edited");
        chunk.content_hash = compute_content_hash(&chunk);
        let synced_after_edit = store.upsert(&chunk).await.unwrap();
        assert!(!synced_after_edit);
    }

    #[tokio::test]
    async fn get_context_returns_siblings_ordered_excluding_self() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations_on(&pool, "chunks_fts").await.unwrap();
        let store = ChunkStore::new(pool, "chunks_fts".to_string());

        for idx in 0..10 {
            let mut c = sample_chunk();
            c.chunk_id = format!("c{}", idx);
            c.chunk_idx = idx;
            c.content_hash = compute_content_hash(&c);
            store.upsert(&c).await.unwrap();
        }

        let fragments = store.get_context(1, 0, 7, 2).await.unwrap();
        let idxs: Vec<i64> = fragments.iter().map(|f| f.chunk_idx).collect();
        assert_eq!(idxs, vec![5, 6, 8, 9]);
    }
}
