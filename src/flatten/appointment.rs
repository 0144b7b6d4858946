//! Appointment linearization: header, patient, practitioner, time span,
//! chief complaint, fee. Always a single chunk.

use chrono::Utc;
use serde_json::json;

use crate::config::ChunkingConfig;
use crate::models::{FlatChunk, SourceRecord};

use super::{field_text, prune_nulls};

pub fn flatten(record: &SourceRecord, _chunking: &ChunkingConfig) -> Vec<FlatChunk> {
    let mut parts: Vec<String> = Vec::new();

    parts.push(format!(
        "Appointment {}",
        record.str_field("name").unwrap_or("(unnumbered)")
    ));
    if let Some(date) = field_text(&record.payload, "date") {
        parts.push(format!("Date: {}", date));
    }
    if let Some(state) = record.str_field("state") {
        parts.push(format!("Status: {}", state));
    }

    if let Some(name) = record.str_field("patient_name") {
        let mut line = format!("Patient: {}", name);
        if let Some(code) = field_text(&record.payload, "patient_code") {
            line.push_str(&format!(" (ID: {})", code));
        }
        if let Some(age) = field_text(&record.payload, "patient_age") {
            line.push_str(&format!(", {} years old", age));
        }
        if let Some(gender) = record.str_field("patient_gender") {
            line.push_str(&format!(", {}", capitalize(gender)));
        }
        parts.push(line);
    }

    if let Some(name) = record.str_field("doctor_name") {
        let mut line = format!("Doctor: {}", name);
        if let Some(designation) = record.str_field("doctor_designation") {
            line.push_str(&format!(" ({})", designation));
        }
        parts.push(line);
    }

    if let (Some(start), Some(stop)) = (
        field_text(&record.payload, "start_at"),
        field_text(&record.payload, "stop_at"),
    ) {
        parts.push(format!("Time: {} - {}", start, stop));
    }

    if let Some(description) = record.str_field("description") {
        parts.push(format!("Chief Complaint: {}", description));
    }

    if let Some(fee) = field_text(&record.payload, "fee") {
        parts.push(format!("Consultation Fee: {}", fee));
    }

    let metadata = prune_nulls(&json!({
        "source_kind": record.kind,
        "source_id": record.id,
        "patient_id": record.payload.get("patient_id"),
        "patient_code": record.payload.get("patient_code"),
        "patient_name": record.payload.get("patient_name"),
        "doctor_id": record.payload.get("doctor_id"),
        "appointment_date": record.payload.get("date"),
        "state": record.payload.get("state"),
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

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> SourceRecord {
        SourceRecord::from_payload(
            "appointment",
            json!({
                "id": 41,
                "name": "APT-0041",
                "date": "2024-03-05",
                "state": "confirmed",
                "patient_name": "Asha Verma",
                "patient_code": "P-2024-011",
                "patient_age": 54,
                "patient_gender": "female",
                "doctor_name": "Dr. Rao",
                "doctor_designation": "Cardiologist",
                "start_at": "2024-03-05 09:30:00",
                "stop_at": "2024-03-05 10:00:00",
                "description": "chest tightness on exertion",
                "fee": 1200.0,
                "write_date": "2024-03-04 18:00:00"
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_single_chunk_with_all_sections() {
        let chunks = flatten(&record(), &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        let text = &chunks[0].text;
        assert!(text.contains("Appointment APT-0041"));
        assert!(text.contains("Patient: Asha Verma (ID: P-2024-011), 54 years old, Female"));
        assert!(text.contains("Doctor: Dr. Rao (Cardiologist)"));
        assert!(text.contains("Chief Complaint: chest tightness"));
    }

    #[test]
    fn test_absent_fields_are_skipped() {
        let rec =
            SourceRecord::from_payload("appointment", json!({"id": 2, "name": "APT-0002"}))
                .unwrap();
        let chunks = flatten(&rec, &ChunkingConfig::default());
        let text = &chunks[0].text;
        assert!(!text.contains("Patient:"));
        assert!(!text.contains("Fee"));
    }

    #[test]
    fn test_metadata_carries_filter_keys() {
        let chunks = flatten(&record(), &ChunkingConfig::default());
        let meta = &chunks[0].metadata;
        assert_eq!(meta["patient_code"], "P-2024-011");
        assert_eq!(meta["patient_name"], "Asha Verma");
        assert_eq!(meta["total_chunks"], 1);
    }
}
