//! Per-kind sync watermarks.
//!
//! Status reporting only: the highest record write date seen per kind,
//! when the kind was last indexed, and the record/chunk counts of that
//! run. The incremental cut itself is the source-owned synced flag, so a
//! drifting watermark can never skip records.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::SyncWatermark;

/// Record the outcome of an indexing run for one kind. The stored
/// last_write_date only moves forward; an older value in a later run
/// (e.g. a partial re-index) never regresses it.
pub async fn upsert_watermark(
    pool: &SqlitePool,
    source_kind: &str,
    last_write_date: DateTime<Utc>,
    total_records: i64,
    total_chunks: i64,
) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO sync_watermarks (source_kind, last_indexed_at, last_write_date, total_records, total_chunks)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(source_kind) DO UPDATE SET
            last_indexed_at = excluded.last_indexed_at,
            last_write_date = MAX(sync_watermarks.last_write_date, excluded.last_write_date),
            total_records = excluded.total_records,
            total_chunks = excluded.total_chunks
        "#,
    )
    .bind(source_kind)
    .bind(now)
    .bind(last_write_date.timestamp())
    .bind(total_records)
    .bind(total_chunks)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_watermarks(pool: &SqlitePool) -> Result<Vec<SyncWatermark>> {
    let rows = sqlx::query(
        "SELECT source_kind, last_indexed_at, last_write_date, total_records, total_chunks \
         FROM sync_watermarks ORDER BY source_kind",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SyncWatermark {
            source_kind: row.get("source_kind"),
            last_indexed_at: epoch_to_utc(row.get("last_indexed_at")),
            last_write_date: epoch_to_utc(row.get("last_write_date")),
            total_records: row.get("total_records"),
            total_chunks: row.get("total_chunks"),
        })
        .collect())
}

fn epoch_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
