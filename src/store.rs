//! Vector store over SQLite.
//!
//! One row per (source_kind, source_id, chunk_index); that triple is the
//! upsert key, so re-indexing a record replaces its chunks in place
//! (last-writer-wins) and never duplicates them. Embeddings are stored as
//! little-endian f32 BLOBs, pre-normalized by the embedding client, and
//! ranking is cosine similarity computed over the candidate set in Rust.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{ChunkRecord, SearchHit, StoredRecord};

/// Metadata field matched by substring rather than equality.
pub const NAME_FILTER_FIELD: &str = "patient_name";

/// Conjunctive metadata filter. Every term must match: the designated
/// name-like field by case-insensitive substring, all other fields by
/// equality on the stringified metadata value.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    terms: Vec<(String, Value)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, metadata: &Value) -> bool {
        self.terms.iter().all(|(key, want)| {
            let Some(actual) = metadata.get(key) else {
                return false;
            };
            if key == NAME_FILTER_FIELD {
                stringified(actual)
                    .to_lowercase()
                    .contains(&stringified(want).to_lowercase())
            } else {
                stringified(actual) == stringified(want)
            }
        })
    }

    /// JSON rendering for response metadata (`filters_applied`).
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.terms
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

fn stringified(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct KindStats {
    pub source_kind: String,
    pub total_chunks: i64,
    pub unique_records: i64,
    pub first_indexed: Option<i64>,
    pub last_updated: Option<i64>,
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a batch of chunk rows in one transaction. On key conflict
    /// the content, metadata, embedding, and updated_at are replaced;
    /// created_at is preserved. Returns the number of rows written.
    pub async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO record_index
                    (source_kind, source_id, chunk_index, content_text, metadata, embedding, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source_kind, source_id, chunk_index) DO UPDATE SET
                    content_text = excluded.content_text,
                    metadata = excluded.metadata,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.source_kind)
            .bind(record.source_id)
            .bind(record.chunk_index)
            .bind(&record.content)
            .bind(record.metadata.to_string())
            .bind(vec_to_blob(&record.embedding))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len() as u64)
    }

    /// Delete chunk rows left behind when a record re-indexes to fewer
    /// chunks than before. `keep` is the record's new chunk count.
    pub async fn prune_stale_chunks(&self, source_kind: &str, source_id: i64, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM record_index WHERE source_kind = ? AND source_id = ? AND chunk_index >= ?",
        )
        .bind(source_kind)
        .bind(source_id)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Cosine-ranked top-K search with an optional conjunctive metadata
    /// filter. Candidates are scanned and scored in Rust; stored vectors
    /// are pre-normalized, so the score is effectively a dot product.
    pub async fn similarity_search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            "SELECT id, source_kind, source_id, content_text, metadata, embedding FROM record_index",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = Vec::new();
        for row in &rows {
            let metadata = parse_metadata(row.get("metadata"));
            if let Some(filter) = filter {
                if !filter.matches(&metadata) {
                    continue;
                }
            }

            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            let similarity = cosine_similarity(query, &vec) as f64;

            hits.push(SearchHit {
                id: row.get("id"),
                content: row.get("content_text"),
                metadata,
                source_kind: row.get("source_kind"),
                source_id: row.get("source_id"),
                similarity,
            });
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);

        Ok(hits)
    }

    /// Unranked fetch of stored chunks, most recent first. Exact filter
    /// only; no similarity involved.
    pub async fn raw_fetch(
        &self,
        kind: Option<&str>,
        filter: Option<&MetadataFilter>,
        limit: i64,
    ) -> Result<Vec<StoredRecord>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT id, source_kind, source_id, content_text, metadata, created_at \
                     FROM record_index WHERE source_kind = ? ORDER BY created_at DESC, id DESC",
                )
                .bind(kind)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, source_kind, source_id, content_text, metadata, created_at \
                     FROM record_index ORDER BY created_at DESC, id DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut results = Vec::new();
        for row in &rows {
            if results.len() as i64 >= limit {
                break;
            }
            let metadata = parse_metadata(row.get("metadata"));
            if let Some(filter) = filter {
                if !filter.matches(&metadata) {
                    continue;
                }
            }
            results.push(StoredRecord {
                id: row.get("id"),
                content: row.get("content_text"),
                metadata,
                source_kind: row.get("source_kind"),
                source_id: row.get("source_id"),
                created_at: row.get("created_at"),
            });
        }

        Ok(results)
    }

    /// Per-kind chunk and record counts for status reporting.
    pub async fn index_stats(&self) -> Result<Vec<KindStats>> {
        let rows = sqlx::query(
            r#"
            SELECT source_kind,
                   COUNT(*) AS total_chunks,
                   COUNT(DISTINCT source_id) AS unique_records,
                   MIN(created_at) AS first_indexed,
                   MAX(updated_at) AS last_updated
            FROM record_index
            GROUP BY source_kind
            ORDER BY source_kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| KindStats {
                source_kind: row.get("source_kind"),
                total_chunks: row.get("total_chunks"),
                unique_records: row.get("unique_records"),
                first_indexed: row.get("first_indexed"),
                last_updated: row.get("last_updated"),
            })
            .collect())
    }
}

fn parse_metadata(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_equality_is_stringified() {
        let meta = json!({"patient_code": "P-11", "source_id": 42});
        assert!(MetadataFilter::new()
            .with("patient_code", "P-11")
            .matches(&meta));
        // Numeric metadata matches its string rendering
        assert!(MetadataFilter::new().with("source_id", "42").matches(&meta));
        assert!(!MetadataFilter::new()
            .with("patient_code", "P-12")
            .matches(&meta));
    }

    #[test]
    fn test_filter_name_field_is_substring() {
        let meta = json!({"patient_name": "Asha Verma"});
        assert!(MetadataFilter::new()
            .with(NAME_FILTER_FIELD, "verma")
            .matches(&meta));
        assert!(!MetadataFilter::new()
            .with(NAME_FILTER_FIELD, "sharma")
            .matches(&meta));
    }

    #[test]
    fn test_filter_is_conjunctive() {
        let meta = json!({"patient_code": "P-11", "state": "confirmed"});
        let filter = MetadataFilter::new()
            .with("patient_code", "P-11")
            .with("state", "draft");
        assert!(!filter.matches(&meta));
    }

    #[test]
    fn test_filter_missing_key_excludes() {
        let meta = json!({"patient_code": "P-11"});
        assert!(!MetadataFilter::new().with("state", "confirmed").matches(&meta));
    }
}
