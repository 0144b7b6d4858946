//! Prescription linearization.
//!
//! The richest template: a clinical narrative assembled from the header,
//! patient and physician blocks, then each sub-collection in a fixed
//! order. Long narratives are split into overlapping word windows; every
//! chunk's metadata records its index and the total count.

use chrono::Utc;
use serde_json::{json, Value};

use crate::chunk::{chunk_words, needs_chunking};
use crate::config::ChunkingConfig;
use crate::models::{FlatChunk, SourceRecord};

use super::{field_text, item_str, prune_nulls, scalar_text};

pub fn flatten(record: &SourceRecord, chunking: &ChunkingConfig) -> Vec<FlatChunk> {
    let text = build_text(record);
    let base_metadata = build_metadata(record);

    if !needs_chunking(&text) {
        let mut metadata = base_metadata;
        set(&mut metadata, "chunk_index", json!(0));
        set(&mut metadata, "total_chunks", json!(1));
        return vec![FlatChunk {
            chunk_index: 0,
            text,
            metadata,
        }];
    }

    let windows = chunk_words(&text, chunking.chunk_size, chunking.chunk_overlap);
    let total = windows.len();
    windows
        .into_iter()
        .enumerate()
        .map(|(idx, window)| {
            let mut metadata = base_metadata.clone();
            set(&mut metadata, "chunk_index", json!(idx));
            set(&mut metadata, "total_chunks", json!(total));
            FlatChunk {
                chunk_index: idx as i64,
                text: window,
                metadata,
            }
        })
        .collect()
}

fn set(metadata: &mut Value, key: &str, value: Value) {
    if let Some(map) = metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

fn build_metadata(record: &SourceRecord) -> Value {
    let diagnosis_codes: Vec<&str> = record
        .list_field("diagnoses")
        .iter()
        .filter_map(|d| item_str(d, "code"))
        .collect();

    prune_nulls(&json!({
        "source_kind": record.kind,
        "source_id": record.id,
        "patient_id": record.payload.get("patient_id"),
        "patient_code": record.payload.get("patient_code"),
        "patient_name": record.payload.get("patient_name"),
        "physician_id": record.payload.get("physician_id"),
        "prescription_date": record.payload.get("date"),
        "state": record.payload.get("state"),
        "diagnosis_codes": diagnosis_codes,
        // Verbatim structured sub-lists so consumers can recover structure
        // without re-parsing the narrative.
        "medications": record.payload.get("medications"),
        "diagnoses": record.payload.get("diagnoses"),
        "complaints": record.payload.get("complaints"),
        "investigations": record.payload.get("investigations"),
        "vitals": record.payload.get("vitals"),
        "signs": record.payload.get("signs"),
        "past_medical_history": record.payload.get("past_medical_history"),
        "medication_history": record.payload.get("medication_history"),
        "family_history": record.payload.get("family_history"),
        "social_history": record.payload.get("social_history"),
        "exercises": record.payload.get("exercises"),
        "ortho_items": record.payload.get("ortho_items"),
        "advice_notes": record.payload.get("advice_notes"),
        "status_updates": {
            "symptom_status": record.payload.get("symptom_status"),
            "medication_adherence": record.payload.get("medication_adherence"),
            "side_effects": record.payload.get("side_effects"),
        },
        "indexed_at": Utc::now().to_rfc3339(),
    }))
}

fn build_text(record: &SourceRecord) -> String {
    let payload = &record.payload;
    let mut parts: Vec<String> = Vec::new();

    parts.push(format!(
        "Prescription {}",
        record.str_field("name").unwrap_or("(unnumbered)")
    ));
    if let Some(date) = field_text(payload, "date") {
        parts.push(format!("Date: {}", date));
    }

    if let Some(name) = record.str_field("patient_name") {
        let mut line = format!("Patient: {}", name);
        if let Some(code) = field_text(payload, "patient_code") {
            line.push_str(&format!(" (ID: {})", code));
        }
        if let Some(age) = field_text(payload, "patient_age") {
            line.push_str(&format!(", {} years old", age));
        }
        if let Some(gender) = record.str_field("patient_gender") {
            line.push_str(&format!(", {}", gender));
        }
        parts.push(line);
    }

    if let Some(name) = record.str_field("physician_name") {
        let mut line = format!("Physician: {}", name);
        if let Some(designation) = record.str_field("physician_designation") {
            line.push_str(&format!(" ({})", designation));
        }
        parts.push(line);
    }

    section(&mut parts, "Diagnosis:", record.list_field("diagnoses"), |d| {
        let name = item_str(d, "name")?;
        let mut line = name.to_string();
        if let Some(code) = item_str(d, "code") {
            line.push_str(&format!(" (ICD: {})", code));
        }
        if let Some(long_name) = item_str(d, "long_name") {
            line.push_str(&format!(" - {}", long_name));
        }
        Some(line)
    });

    section(
        &mut parts,
        "Chief Complaints:",
        record.list_field("complaints"),
        |c| {
            let complaint = item_str(c, "complaint")?;
            let mut line = complaint.to_string();
            if let Some(period) = item_str(c, "period") {
                line.push_str(&format!(" for {}", period));
            }
            if let Some(location) = item_str(c, "location") {
                line.push_str(&format!(" at {}", location));
            }
            Some(line)
        },
    );

    section(
        &mut parts,
        "Medications Prescribed:",
        record.list_field("medications"),
        |m| {
            let name = item_str(m, "name")?;
            let mut line = name.to_string();
            if let Some(quantity) = m.get("quantity").filter(|v| !v.is_null()) {
                line.push_str(&format!(", qty {}", scalar_text(quantity)));
            }
            if let Some(days) = m.get("days").filter(|v| !v.is_null()) {
                line.push_str(&format!(" for {} days", scalar_text(days)));
            }
            if let Some(per_day) = m.get("per_day").filter(|v| !v.is_null()) {
                line.push_str(&format!(" ({}/day)", scalar_text(per_day)));
            }
            if let Some(instruction) = item_str(m, "instruction") {
                line.push_str(&format!(". Special instructions: {}", instruction));
            }
            Some(line)
        },
    );

    section(
        &mut parts,
        "Investigations Ordered:",
        record.list_field("investigations"),
        |i| item_str(i, "name").map(str::to_string),
    );
    if let Some(result) = record.str_field("investigation_result") {
        parts.push(format!("Investigation Results:\n{}", result));
    }

    section(&mut parts, "Vital Signs:", record.list_field("vitals"), |v| {
        let mut readings: Vec<String> = Vec::new();
        if let Some(weight) = v.get("weight").filter(|x| !x.is_null()) {
            readings.push(format!(
                "Weight: {} {}",
                scalar_text(weight),
                item_str(v, "weight_unit").unwrap_or("kg")
            ));
        }
        if let Some(height) = v.get("height").filter(|x| !x.is_null()) {
            readings.push(format!(
                "Height: {} {}",
                scalar_text(height),
                item_str(v, "height_unit").unwrap_or("cm")
            ));
        }
        if let Some(systolic) = v.get("bp_systolic").filter(|x| !x.is_null()) {
            let mut bp = scalar_text(systolic);
            if let Some(diastolic) = v.get("bp_diastolic").filter(|x| !x.is_null()) {
                bp.push_str(&format!("/{}", scalar_text(diastolic)));
            }
            readings.push(format!(
                "Blood Pressure: {} {}",
                bp,
                item_str(v, "bp_unit").unwrap_or("mmHg")
            ));
        }
        if let Some(pulse) = v.get("pulse").filter(|x| !x.is_null()) {
            readings.push(format!(
                "Pulse: {} {}",
                scalar_text(pulse),
                item_str(v, "pulse_unit").unwrap_or("bpm")
            ));
        }
        if let Some(rate) = v.get("respiratory_rate").filter(|x| !x.is_null()) {
            readings.push(format!(
                "Respiratory Rate: {} {}",
                scalar_text(rate),
                item_str(v, "rr_unit").unwrap_or("/min")
            ));
        }
        if readings.is_empty() {
            None
        } else {
            Some(readings.join("; "))
        }
    });

    section(
        &mut parts,
        "Examinations / Signs:",
        record.list_field("signs"),
        |s| {
            let name = item_str(s, "name")?;
            let mut line = name.to_string();
            if let Some(location) = item_str(s, "location") {
                line.push_str(&format!(" at {}", location));
            }
            if let Some(intensity) = item_str(s, "intensity") {
                line.push_str(&format!(" (intensity: {})", intensity));
            }
            Some(line)
        },
    );

    if let Some(history) = record.str_field("patient_history") {
        parts.push(format!("General Patient History:\n{}", history));
    }

    section(
        &mut parts,
        "Past Medical History:",
        record.list_field("past_medical_history"),
        |h| {
            let symptom = item_str(h, "symptom")?;
            match item_str(h, "result") {
                Some(result) => Some(format!("{} - {}", symptom, result)),
                None => Some(symptom.to_string()),
            }
        },
    );

    section(
        &mut parts,
        "Medication History:",
        record.list_field("medication_history"),
        |h| {
            let medicine = item_str(h, "medicine")?;
            match item_str(h, "group") {
                Some(group) => Some(format!("{} ({})", medicine, group)),
                None => Some(medicine.to_string()),
            }
        },
    );

    section(
        &mut parts,
        "Family History:",
        record.list_field("family_history"),
        |h| {
            let condition = item_str(h, "condition")?;
            match item_str(h, "result") {
                Some(result) => Some(format!("{} - {}", condition, result)),
                None => Some(condition.to_string()),
            }
        },
    );

    section(
        &mut parts,
        "Social History:",
        record.list_field("social_history"),
        |h| {
            let habit = item_str(h, "habit")?;
            match item_str(h, "result") {
                Some(result) => Some(format!("{} - {}", habit, result)),
                None => Some(habit.to_string()),
            }
        },
    );

    section(
        &mut parts,
        "Prescribed Exercises:",
        record.list_field("exercises"),
        |e| {
            let name = item_str(e, "name")?;
            let mut line = name.to_string();
            if let Some(part) = item_str(e, "part") {
                line.push_str(&format!(" for {}", part));
            }
            if let Some(movement) = item_str(e, "move") {
                line.push_str(&format!(" (move: {})", movement));
            }
            if let Some(repetition) = item_str(e, "repetition") {
                line.push_str(&format!(" (reps: {})", repetition));
            }
            Some(line)
        },
    );

    section(
        &mut parts,
        "Orthopedic Items Prescribed:",
        record.list_field("ortho_items"),
        |o| {
            let item = item_str(o, "item")?;
            let mut line = item.to_string();
            if let Some(location) = item_str(o, "location") {
                line.push_str(&format!(" for {}", location));
            }
            if let Some(side) = item_str(o, "side") {
                line.push_str(&format!(" ({} side)", side));
            }
            Some(line)
        },
    );

    if let Some(status) = record.str_field("symptom_status") {
        parts.push(format!("Symptom Status: {}", status));
    }
    if let Some(adherence) = record.str_field("medication_adherence") {
        parts.push(format!("Medication Adherence: {}", adherence));
    }
    if let Some(effects) = record.str_field("side_effects") {
        parts.push(format!("Side Effects/Toxicities:\n{}", effects));
    }

    let next_visit = field_text(payload, "next_visit_date");
    let next_days = field_text(payload, "next_visit_days");
    if next_visit.is_some() || next_days.is_some() {
        parts.push("Follow-Up Schedule:".to_string());
        if let Some(date) = next_visit {
            parts.push(format!("- Next Visit Date: {}", date));
        }
        if let Some(days) = next_days {
            parts.push(format!("- Recall Timeframe: {} days", days));
        }
    }

    section(
        &mut parts,
        "Advice/Notes:",
        record.list_field("advice_notes"),
        |n| item_str(n, "text").map(str::to_string),
    );

    if let Some(comments) = record.str_field("additional_comments") {
        parts.push(format!("Additional Comments:\n{}", comments));
    }
    if let Some(description) = record.str_field("description") {
        parts.push(format!("Description/Summary:\n{}", description));
    }

    parts.join("\n")
}

/// Append a bulleted section when at least one item renders to a line.
fn section<F>(parts: &mut Vec<String>, heading: &str, items: &[Value], mut render: F)
where
    F: FnMut(&Value) -> Option<String>,
{
    let lines: Vec<String> = items.iter().filter_map(|item| render(item)).collect();
    if lines.is_empty() {
        return;
    }
    parts.push(heading.to_string());
    for line in lines {
        parts.push(format!("- {}", line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> SourceRecord {
        SourceRecord::from_payload(
            "prescription",
            json!({
                "id": 310,
                "name": "RX-0310",
                "date": "2024-03-05",
                "state": "confirmed",
                "patient_name": "Asha Verma",
                "patient_code": "P-2024-011",
                "patient_age": 54,
                "patient_gender": "female",
                "physician_name": "Dr. Rao",
                "physician_designation": "Cardiologist",
                "diagnoses": [
                    {"name": "Essential hypertension", "code": "I10", "long_name": null},
                    {"name": null, "code": "Z00"}
                ],
                "complaints": [
                    {"complaint": "palpitations", "period": "two weeks", "location": null}
                ],
                "medications": [
                    {"name": "Amlodipine 5mg", "quantity": 30, "days": 30, "per_day": 1,
                     "instruction": "take after breakfast"}
                ],
                "vitals": [
                    {"weight": 68, "weight_unit": "kg", "bp_systolic": 150, "bp_diastolic": 95,
                     "pulse": 88}
                ],
                "write_date": "2024-03-05 11:00:00"
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_sections_in_order_and_absent_skipped() {
        let chunks = flatten(&record(), &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        let text = &chunks[0].text;

        let diag = text.find("Diagnosis:").unwrap();
        let complaints = text.find("Chief Complaints:").unwrap();
        let meds = text.find("Medications Prescribed:").unwrap();
        let vitals = text.find("Vital Signs:").unwrap();
        assert!(diag < complaints && complaints < meds && meds < vitals);

        assert!(text.contains("Essential hypertension (ICD: I10)"));
        assert!(text.contains("palpitations for two weeks"));
        assert!(text.contains("Blood Pressure: 150/95 mmHg"));
        // Nameless diagnosis line and empty sections are skipped entirely
        assert!(!text.contains("Z00"));
        assert!(!text.contains("Family History:"));
    }

    #[test]
    fn test_metadata_embeds_pruned_sublists() {
        let chunks = flatten(&record(), &ChunkingConfig::default());
        let meta = &chunks[0].metadata;
        assert_eq!(meta["diagnosis_codes"], json!(["I10", "Z00"]));
        assert_eq!(meta["medications"][0]["name"], "Amlodipine 5mg");
        // Null long_name pruned from the verbatim copy
        assert!(meta["diagnoses"][0].get("long_name").is_none());
        assert_eq!(meta["patient_code"], "P-2024-011");
        assert_eq!(meta["chunk_index"], 0);
        assert_eq!(meta["total_chunks"], 1);
    }

    #[test]
    fn test_long_narrative_produces_indexed_chunks() {
        let mut payload = record().payload;
        let long_history = (0..900)
            .map(|i| format!("note{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        payload["patient_history"] = json!(long_history);
        let rec = SourceRecord::from_payload("prescription", payload).unwrap();

        let chunks = flatten(&rec, &ChunkingConfig::default());
        assert!(chunks.len() >= 2);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i64);
            assert_eq!(chunk.metadata["chunk_index"], i);
            assert_eq!(chunk.metadata["total_chunks"], total);
        }
    }
}
