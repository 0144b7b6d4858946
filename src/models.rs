//! Core data types shared across the indexing and retrieval pipeline.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Raw record fetched from the practice system, before flattening.
///
/// The payload shape varies by kind and is owned by the source system, so
/// it stays an opaque JSON value with typed accessors at points of use.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub kind: String,
    pub id: i64,
    pub payload: Value,
}

impl SourceRecord {
    pub fn from_payload(kind: &str, payload: Value) -> Option<Self> {
        let id = payload.get("id").and_then(Value::as_i64)?;
        Some(Self {
            kind: kind.to_string(),
            id,
            payload,
        })
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Sub-collection accessor; absent or malformed lists read as empty.
    pub fn list_field(&self, key: &str) -> &[Value] {
        self.payload
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The record's last-modified timestamp, coerced from the wire string.
    /// Unparseable or missing values fall back to now.
    pub fn write_date(&self) -> DateTime<Utc> {
        self.str_field("write_date")
            .and_then(parse_write_date)
            .unwrap_or_else(Utc::now)
    }
}

/// Coerce a source-system timestamp string into UTC.
pub fn parse_write_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

/// One embeddable unit produced by flattening a source record.
#[derive(Debug, Clone)]
pub struct FlatChunk {
    pub chunk_index: i64,
    pub text: String,
    pub metadata: Value,
}

/// Fully prepared row for the vector index, keyed by
/// (source_kind, source_id, chunk_index).
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub source_kind: String,
    pub source_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub metadata: Value,
    pub embedding: Vec<f32>,
}

/// Ranked hit returned by similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub content: String,
    pub metadata: Value,
    pub source_kind: String,
    pub source_id: i64,
    pub similarity: f64,
}

/// Unranked stored chunk returned by the raw-fetch path.
#[derive(Debug, Clone, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub content: String,
    pub metadata: Value,
    pub source_kind: String,
    pub source_id: i64,
    pub created_at: i64,
}

/// Per-kind sync bookkeeping row. Status-only: the incremental cut is the
/// source-owned synced flag, not a comparison against this watermark.
#[derive(Debug, Clone, Serialize)]
pub struct SyncWatermark {
    pub source_kind: String,
    pub last_indexed_at: DateTime<Utc>,
    pub last_write_date: DateTime<Utc>,
    pub total_records: i64,
    pub total_chunks: i64,
}

/// Per-kind result of an indexing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexOutcome {
    pub records_indexed: u64,
    pub chunks_created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_requires_id() {
        assert!(SourceRecord::from_payload("appointment", json!({"name": "A-1"})).is_none());
        let rec = SourceRecord::from_payload("appointment", json!({"id": 7})).unwrap();
        assert_eq!(rec.id, 7);
    }

    #[test]
    fn test_write_date_formats() {
        assert!(parse_write_date("2024-03-01T10:30:00Z").is_some());
        assert!(parse_write_date("2024-03-01 10:30:00").is_some());
        assert!(parse_write_date("last tuesday").is_none());
    }

    #[test]
    fn test_write_date_falls_back_to_now() {
        let rec =
            SourceRecord::from_payload("patient", json!({"id": 1, "write_date": "garbage"}))
                .unwrap();
        let before = Utc::now();
        let coerced = rec.write_date();
        assert!(coerced >= before);
    }

    #[test]
    fn test_list_field_tolerates_absence() {
        let rec = SourceRecord::from_payload("prescription", json!({"id": 1})).unwrap();
        assert!(rec.list_field("medications").is_empty());
    }
}
