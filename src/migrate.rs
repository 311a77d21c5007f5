//! Database schema migrations for the Chunk Store (C4).
//!
//! The lexical full-text table's row set is kept equal to `chunks` by
//! triggers that run inside the same transaction as every insert, update,
//! and delete on `chunks` — there is no application-level re-sync step.

use anyhow::Result;
use sqlx::sqlite::SqlitePool;

use crate::config::Config;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    run_migrations_on(&pool, &config.hybrid.bm25.table).await?;
    pool.close().await;
    Ok(())
}

/// Runs migrations against an already-open pool, parameterized by the
/// configured FTS5 table name (validated as a SQL identifier by
/// `config::load_config`).
pub async fn run_migrations_on(pool: &SqlitePool, fts_table: &str) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            thread_id INTEGER NOT NULL,
            thread_name TEXT NOT NULL,
            session_idx INTEGER NOT NULL,
            chunk_idx INTEGER NOT NULL,
            message_ids TEXT NOT NULL,
            participant_ids TEXT NOT NULL,
            participant_names TEXT NOT NULL,
            text TEXT NOT NULL,
            start_ts INTEGER NOT NULL,
            end_ts INTEGER NOT NULL,
            message_count INTEGER NOT NULL,
            is_indexable INTEGER NOT NULL,
            char_count INTEGER NOT NULL,
            alnum_count INTEGER NOT NULL,
            unique_word_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            vector_synced INTEGER NOT NULL DEFAULT 0,
            UNIQUE(thread_id, session_idx, chunk_idx)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_thread_session ON chunks(thread_id, session_idx, chunk_idx)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_unsynced ON chunks(vector_synced) WHERE is_indexable = 1",
    )
    .execute(pool)
    .await?;

    let create_fts = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {table} USING fts5(chunk_id UNINDEXED, is_indexable UNINDEXED, text)",
        table = fts_table
    );
    sqlx::query(&create_fts).execute(pool).await?;

    for (name, stmt) in trigger_statements(fts_table) {
        sqlx::query(&format!("DROP TRIGGER IF EXISTS {name}"))
            .execute(pool)
            .await?;
        sqlx::query(&stmt).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY REFERENCES chunks(chunk_id) ON DELETE CASCADE,
            embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            synced_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Trigger DDL keeping `{fts_table}` in lockstep with `chunks`, re-created on
/// every migration run so a changed `fts_table` name (or a schema
/// correction) always takes effect.
fn trigger_statements(fts_table: &str) -> Vec<(String, String)> {
    vec![
        (
            "chunks_ai".to_string(),
            format!(
                "CREATE TRIGGER chunks_ai AFTER INSERT ON chunks BEGIN \
                 INSERT INTO {t}(chunk_id, is_indexable, text) VALUES (new.chunk_id, new.is_indexable, new.text); \
                 END",
                t = fts_table
            ),
        ),
        (
            "chunks_ad".to_string(),
            format!(
                "CREATE TRIGGER chunks_ad AFTER DELETE ON chunks BEGIN \
                 DELETE FROM {t} WHERE chunk_id = old.chunk_id; \
                 END",
                t = fts_table
            ),
        ),
        (
            "chunks_au".to_string(),
            format!(
                "CREATE TRIGGER chunks_au AFTER UPDATE ON chunks BEGIN \
                 DELETE FROM {t} WHERE chunk_id = old.chunk_id; \
                 INSERT INTO {t}(chunk_id, is_indexable, text) VALUES (new.chunk_id, new.is_indexable, new.text); \
                 END",
                t = fts_table
            ),
        ),
    ]
}
