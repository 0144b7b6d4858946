use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Vector index: one row per (kind, record, chunk)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_kind TEXT NOT NULL,
            source_id INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL DEFAULT 0,
            content_text TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_kind, source_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_watermarks (
            source_kind TEXT PRIMARY KEY,
            last_indexed_at INTEGER NOT NULL,
            last_write_date INTEGER NOT NULL,
            total_records INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_record_index_kind ON record_index(source_kind)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_record_index_created_at ON record_index(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
