//! Condition (diagnosis code list) linearization. Short fixed-vocabulary
//! entries, always a single chunk.

use chrono::Utc;
use serde_json::json;

use crate::config::ChunkingConfig;
use crate::models::{FlatChunk, SourceRecord};

use super::prune_nulls;

pub fn flatten(record: &SourceRecord, _chunking: &ChunkingConfig) -> Vec<FlatChunk> {
    let mut parts: Vec<String> = Vec::new();

    let name = record.str_field("name").unwrap_or("(unnamed condition)");
    match record.str_field("code") {
        Some(code) => parts.push(format!("Condition {} ({})", name, code)),
        None => parts.push(format!("Condition {}", name)),
    }
    if let Some(long_name) = record.str_field("long_name") {
        parts.push(long_name.to_string());
    }

    let metadata = prune_nulls(&json!({
        "source_kind": record.kind,
        "source_id": record.id,
        "code": record.payload.get("code"),
        "chunk_index": 0,
        "total_chunks": 1,
        "indexed_at": Utc::now().to_rfc3339(),
    }));

    vec![FlatChunk {
        chunk_index: 0,
        text: parts.join("\n"),
        metadata,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_code_and_long_name() {
        let rec = SourceRecord::from_payload(
            "condition",
            json!({"id": 5, "code": "I10", "name": "Essential hypertension",
                   "long_name": "Essential (primary) hypertension"}),
        )
        .unwrap();
        let chunks = flatten(&rec, &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("Essential hypertension (I10)"));
        assert_eq!(chunks[0].metadata["code"], "I10");
    }
}
