//! Patient profile linearization. Always a single chunk.

use chrono::Utc;
use serde_json::json;

use crate::config::ChunkingConfig;
use crate::models::{FlatChunk, SourceRecord};

use super::{field_text, prune_nulls};

pub fn flatten(record: &SourceRecord, _chunking: &ChunkingConfig) -> Vec<FlatChunk> {
    let payload = &record.payload;
    let mut parts: Vec<String> = Vec::new();

    let mut header = format!(
        "Patient {}",
        record.str_field("name").unwrap_or("(unnamed)")
    );
    if let Some(code) = field_text(payload, "code") {
        header.push_str(&format!(" (ID: {})", code));
    }
    parts.push(header);

    if let Some(age) = field_text(payload, "age") {
        parts.push(format!("Age: {}", age));
    }
    if let Some(gender) = record.str_field("gender") {
        parts.push(format!("Gender: {}", gender));
    }
    if let Some(blood_group) = record.str_field("blood_group") {
        parts.push(format!("Blood Group: {}", blood_group));
    }
    if let Some(allergies) = record.str_field("allergies") {
        parts.push(format!("Known Allergies: {}", allergies));
    }
    if let Some(phone) = field_text(payload, "phone") {
        parts.push(format!("Phone: {}", phone));
    }
    if let Some(email) = record.str_field("email") {
        parts.push(format!("Email: {}", email));
    }
    if let Some(address) = record.str_field("address") {
        parts.push(format!("Address: {}", address));
    }

    let metadata = prune_nulls(&json!({
        "source_kind": record.kind,
        "source_id": record.id,
        "patient_id": record.id,
        "patient_code": payload.get("code"),
        "patient_name": payload.get("name"),
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
    fn test_profile_text_and_filter_keys() {
        let rec = SourceRecord::from_payload(
            "patient",
            json!({
                "id": 11,
                "code": "P-2024-011",
                "name": "Asha Verma",
                "age": 54,
                "gender": "female",
                "blood_group": "B+",
                "phone": "98765",
            }),
        )
        .unwrap();

        let chunks = flatten(&rec, &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("Patient Asha Verma (ID: P-2024-011)"));
        assert!(chunks[0].text.contains("Blood Group: B+"));
        assert!(!chunks[0].text.contains("Email"));
        assert_eq!(chunks[0].metadata["patient_code"], "P-2024-011");
    }
}
