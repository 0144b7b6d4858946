//! End-to-end indexing pipeline tests: mocked practice system and
//! embedding service, real flattening, chunking, store, and watermarks.

use httpmock::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use clinrag::config::{ChunkingConfig, EmbeddingConfig, SourceConfig};
use clinrag::connector::PracticeConnector;
use clinrag::db;
use clinrag::embedding::EmbeddingClient;
use clinrag::etl::EtlPipeline;
use clinrag::flatten;
use clinrag::migrate;
use clinrag::models::SourceRecord;
use clinrag::registry::KindRegistry;
use clinrag::watermark;

const DIMS: usize = 4;

fn source_config(server: &MockServer) -> SourceConfig {
    SourceConfig {
        base_url: server.url(""),
        api_key: Some("test-secret".to_string()),
        timeout_secs: 5,
        max_retries: 0,
    }
}

fn embedding_config(server: &MockServer) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "local".to_string(),
        model: "clinical-embed".to_string(),
        dims: DIMS,
        url: Some(server.url("")),
        api_key: None,
        max_retries: 0,
        timeout_secs: 5,
    }
}

async fn pipeline(server: &MockServer) -> (TempDir, sqlx::SqlitePool, EtlPipeline) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("clinrag.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let etl = EtlPipeline::new(
        pool.clone(),
        Arc::new(PracticeConnector::new(&source_config(server)).unwrap()),
        Arc::new(EmbeddingClient::new(&embedding_config(server)).unwrap()),
        Arc::new(KindRegistry::builtin()),
        ChunkingConfig::default(),
    );
    (tmp, pool, etl)
}

fn long_prescription_payload() -> serde_json::Value {
    let history = (0..900)
        .map(|i| format!("note{}", i))
        .collect::<Vec<_>>()
        .join(" ");
    json!({
        "id": 1,
        "name": "RX-0001",
        "date": "2024-03-05",
        "state": "confirmed",
        "patient_name": "Asha Verma",
        "patient_code": "P-2024-011",
        "patient_history": history,
        "write_date": "2024-03-05 11:00:00"
    })
}

/// Texts the pipeline will send for embedding, computed with the same
/// flattener the pipeline uses.
fn expected_chunk_texts(payload: &serde_json::Value) -> Vec<String> {
    let record = SourceRecord::from_payload("prescription", payload.clone()).unwrap();
    flatten::prescription::flatten(&record, &ChunkingConfig::default())
        .into_iter()
        .map(|chunk| chunk.text)
        .collect()
}

async fn mock_embed<'a>(server: &'a MockServer, texts: &[String]) -> httpmock::Mock<'a> {
    let vectors: Vec<Vec<f32>> = (0..texts.len()).map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect();
    let body = json!({"model": "clinical-embed", "input": texts});
    server
        .mock_async(move |when, then| {
            when.method(POST).path("/api/embed").json_body(body);
            then.status(200).json_body(json!({"embeddings": vectors}));
        })
        .await
}

#[tokio::test]
async fn test_end_to_end_long_record_indexing() {
    let server = MockServer::start_async().await;
    let payload = long_prescription_payload();
    let texts = expected_chunk_texts(&payload);
    assert!(texts.len() >= 2, "narrative should exceed the chunk threshold");
    let total = texts.len();

    let fetch = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/fetch_all");
            then.status(200)
                .json_body(json!({"status": "success", "data": [payload]}));
        })
        .await;
    let embed = mock_embed(&server, &texts).await;
    let synced = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/sync/prescriptions/mark_synced")
                .json_body(json!({"ids": [1]}));
            then.status(200)
                .json_body(json!({"status": "success", "data": {"updated": 1}}));
        })
        .await;

    let (_tmp, pool, etl) = pipeline(&server).await;
    let results = etl
        .run_full_indexing(&["prescription".to_string()], None, true)
        .await;

    let outcome = &results["prescription"];
    assert!(outcome.error.is_none());
    assert_eq!(outcome.records_indexed, 1);
    assert_eq!(outcome.chunks_created, total as u64);

    fetch.assert_async().await;
    embed.assert_async().await;
    synced.assert_async().await;

    // Contiguous chunk indices 0..n, each carrying the total
    let mut rows = etl
        .store()
        .raw_fetch(Some("prescription"), None, 100)
        .await
        .unwrap();
    assert_eq!(rows.len(), total);
    rows.sort_by_key(|r| r.metadata["chunk_index"].as_i64().unwrap());
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.metadata["chunk_index"], i);
        assert_eq!(row.metadata["total_chunks"], total);
    }

    // Watermark reflects the batch
    let marks = watermark::load_watermarks(&pool).await.unwrap();
    assert_eq!(marks.len(), 1);
    assert_eq!(marks[0].source_kind, "prescription");
    assert_eq!(marks[0].total_records, 1);
    assert_eq!(marks[0].total_chunks, total as i64);
    assert_eq!(
        marks[0]
            .last_write_date
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        "2024-03-05 11:00:00"
    );
}

#[tokio::test]
async fn test_reindexing_same_record_creates_no_duplicates() {
    let server = MockServer::start_async().await;
    let payload = long_prescription_payload();
    let texts = expected_chunk_texts(&payload);
    let total = texts.len();

    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/fetch_all");
            then.status(200)
                .json_body(json!({"status": "success", "data": [payload]}));
        })
        .await;
    mock_embed(&server, &texts).await;
    let synced = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/mark_synced");
            then.status(200)
                .json_body(json!({"status": "success", "data": {"updated": 1}}));
        })
        .await;

    let (_tmp, _pool, etl) = pipeline(&server).await;
    etl.run_full_indexing(&["prescription".to_string()], None, true)
        .await;
    etl.run_full_indexing(&["prescription".to_string()], None, true)
        .await;

    let rows = etl
        .store()
        .raw_fetch(Some("prescription"), None, 100)
        .await
        .unwrap();
    assert_eq!(rows.len(), total, "replay must converge, not duplicate");
    assert_eq!(synced.hits_async().await, 2);
}

#[tokio::test]
async fn test_kind_failure_does_not_abort_others() {
    let server = MockServer::start_async().await;

    // Appointments upstream is down
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/appointments/fetch_all");
            then.status(500).body("boom");
        })
        .await;

    // Prescriptions work, with a short single-chunk record
    let payload = json!({
        "id": 7,
        "name": "RX-0007",
        "state": "confirmed",
        "patient_code": "P-7",
        "description": "short note",
        "write_date": "2024-03-01 09:00:00"
    });
    let texts = expected_chunk_texts(&payload);
    assert_eq!(texts.len(), 1);

    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/fetch_all");
            then.status(200)
                .json_body(json!({"status": "success", "data": [payload]}));
        })
        .await;
    mock_embed(&server, &texts).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/mark_synced");
            then.status(200)
                .json_body(json!({"status": "success", "data": {"updated": 1}}));
        })
        .await;

    let (_tmp, _pool, etl) = pipeline(&server).await;
    let results = etl
        .run_full_indexing(
            &[
                "appointment".to_string(),
                "prescription".to_string(),
                "invoice".to_string(),
            ],
            None,
            true,
        )
        .await;

    assert!(results["appointment"].error.is_some());
    assert!(results["prescription"].error.is_none());
    assert_eq!(results["prescription"].records_indexed, 1);
    let invoice_err = results["invoice"].error.as_deref().unwrap();
    assert!(invoice_err.contains("unsupported"));
}

#[tokio::test]
async fn test_zero_candidates_writes_nothing() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/fetch_all");
            then.status(200)
                .json_body(json!({"status": "success", "data": []}));
        })
        .await;
    let synced = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/mark_synced");
            then.status(200)
                .json_body(json!({"status": "success", "data": {"updated": 0}}));
        })
        .await;

    let (_tmp, pool, etl) = pipeline(&server).await;
    let results = etl
        .run_full_indexing(&["prescription".to_string()], None, true)
        .await;

    let outcome = &results["prescription"];
    assert!(outcome.error.is_none());
    assert_eq!(outcome.records_indexed, 0);
    assert_eq!(outcome.chunks_created, 0);
    assert_eq!(synced.hits_async().await, 0);
    assert!(watermark::load_watermarks(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mark_synced_failure_keeps_indexed_data() {
    let server = MockServer::start_async().await;
    let payload = json!({
        "id": 9,
        "name": "RX-0009",
        "state": "confirmed",
        "patient_code": "P-9",
        "description": "note",
        "write_date": "2024-03-01 09:00:00"
    });
    let texts = expected_chunk_texts(&payload);

    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/fetch_all");
            then.status(200)
                .json_body(json!({"status": "success", "data": [payload]}));
        })
        .await;
    mock_embed(&server, &texts).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sync/prescriptions/mark_synced");
            then.status(500).body("down");
        })
        .await;

    let (_tmp, _pool, etl) = pipeline(&server).await;
    let results = etl
        .run_full_indexing(&["prescription".to_string()], None, true)
        .await;

    // The index write stands even though the acknowledgement failed
    let outcome = &results["prescription"];
    assert!(outcome.error.is_none());
    assert_eq!(outcome.chunks_created, 1);
    let rows = etl
        .store()
        .raw_fetch(Some("prescription"), None, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}
