//! JSON HTTP API.
//!
//! Exposes the query, chat, indexing, and status surfaces over axum. All
//! responses share one envelope:
//!
//! ```json
//! { "status": "success", "data": ... }
//! { "status": "error", "error_detail": { "code": "...", "message": "..." } }
//! ```
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/query` | Single-turn RAG query |
//! | `POST` | `/api/chat` | Session-aware conversational query |
//! | `POST` | `/api/index` | Run the indexing pipeline |
//! | `GET`  | `/api/index-status` | Per-kind index stats and watermarks |
//! | `GET`  | `/api/records` | Unranked raw chunk fetch |
//! | `POST` | `/api/config/credentials` | Swap the generation model/key at runtime |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Query and chat degrade rather than fail when generation is down; only
//! retrieval and embedding failures produce error envelopes here. The
//! index endpoint always returns the per-kind result map, with per-kind
//! error strings for the kinds that failed.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support the
//! practice system's browser-embedded clients.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::connector::PracticeConnector;
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::etl::EtlPipeline;
use crate::generation::GenerationClient;
use crate::migrate;
use crate::rag::{ChatRequest, RagEngine};
use crate::registry::KindRegistry;
use crate::session::SessionCache;
use crate::store::VectorStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    etl: Arc<EtlPipeline>,
    rag: Arc<RagEngine>,
    generator: Arc<GenerationClient>,
    registry: Arc<KindRegistry>,
    raw_limit: i64,
}

/// Wire up the pool, clients, and services from configuration.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let connector = Arc::new(PracticeConnector::new(&config.source)?);
    let embedder = Arc::new(EmbeddingClient::new(&config.embedding)?);
    let generator = Arc::new(GenerationClient::new(&config.generation)?);
    let sessions = Arc::new(SessionCache::new(Duration::from_secs(
        config.chat.session_ttl_secs,
    )));
    let registry = Arc::new(KindRegistry::builtin());

    let etl = Arc::new(EtlPipeline::new(
        pool.clone(),
        connector,
        embedder.clone(),
        registry.clone(),
        config.chunking.clone(),
    ));
    let rag = Arc::new(RagEngine::new(
        VectorStore::new(pool),
        embedder,
        generator.clone(),
        sessions,
        config.retrieval.top_k,
    ));

    Ok(AppState {
        etl,
        rag,
        generator,
        registry,
        raw_limit: config.retrieval.raw_limit,
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/query", post(handle_query))
        .route("/api/chat", post(handle_chat))
        .route("/api/index", post(handle_index))
        .route("/api/index-status", get(handle_index_status))
        .route("/api/records", get(handle_records))
        .route("/api/config/credentials", post(handle_set_credentials))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let app = build_router(state);

    println!("clinrag API listening on http://{}", config.server.bind);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Response envelope ============

fn success(data: impl Serialize) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "success",
        "data": data,
    }))
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "error_detail": ErrorDetail {
                code: self.code,
                message: self.message,
            },
        });
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Map retrieval-side failures to the most useful status. Generation
/// failures never reach this point for query/chat; the orchestrator
/// degrades them.
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();

    if msg.contains("embedding") {
        AppError {
            status: StatusCode::BAD_GATEWAY,
            code: "embedding_unavailable".to_string(),
            message: msg,
        }
    } else if msg.contains("practice API") {
        AppError {
            status: StatusCode::BAD_GATEWAY,
            code: "source_unavailable".to_string(),
            message: msg,
        }
    } else {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: msg,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/query ============

#[derive(Deserialize)]
struct QueryRequest {
    prompt: String,
    #[serde(default)]
    patient_code: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if request.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }

    let outcome = state
        .rag
        .query(&request.prompt, request.patient_code.as_deref())
        .await
        .map_err(classify_error)?;

    Ok(success(outcome))
}

// ============ POST /api/chat ============

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if request.session_id.trim().is_empty() {
        return Err(bad_request("session_id must not be empty"));
    }
    if request.prompt.trim().is_empty() && !request.reset {
        return Err(bad_request("prompt must not be empty unless reset is set"));
    }

    let outcome = state.rag.chat(&request).await.map_err(classify_error)?;
    Ok(success(outcome))
}

// ============ POST /api/index ============

#[derive(Deserialize)]
struct IndexRequest {
    #[serde(default)]
    kinds: Option<Vec<String>>,
    #[serde(default = "default_incremental")]
    incremental: bool,
    #[serde(default)]
    limit: Option<usize>,
}

fn default_incremental() -> bool {
    true
}

async fn handle_index(
    State(state): State<AppState>,
    Json(request): Json<IndexRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let kinds: Vec<String> = match request.kinds {
        Some(kinds) if !kinds.is_empty() => kinds,
        _ => state
            .registry
            .default_names()
            .into_iter()
            .map(String::from)
            .collect(),
    };

    let results = state
        .etl
        .run_full_indexing(&kinds, request.limit, request.incremental)
        .await;

    let total_records: u64 = results.values().map(|r| r.records_indexed).sum();
    let total_chunks: u64 = results.values().map(|r| r.chunks_created).sum();

    Ok(success(serde_json::json!({
        "results": results,
        "total_records": total_records,
        "total_chunks": total_chunks,
    })))
}

// ============ GET /api/index-status ============

async fn handle_index_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.etl.index_status().await.map_err(classify_error)?;
    Ok(success(status))
}

// ============ GET /api/records ============

#[derive(Deserialize)]
struct RecordsQuery {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    patient_code: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_records(
    State(state): State<AppState>,
    Query(params): Query<RecordsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = params.limit.unwrap_or(state.raw_limit).max(1);
    let records = state
        .rag
        .records(
            params.kind.as_deref(),
            params.patient_code.as_deref(),
            limit,
        )
        .await
        .map_err(classify_error)?;

    Ok(success(serde_json::json!({
        "total_records": records.len(),
        "records": records,
    })))
}

// ============ POST /api/config/credentials ============

#[derive(Deserialize)]
struct CredentialsRequest {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Swap the generation model and/or API key at runtime. Takes effect on
/// the next generation call; no restart.
async fn handle_set_credentials(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if request.api_key.is_none() && request.model.is_none() {
        return Err(bad_request("provide api_key and/or model"));
    }
    if let Some(key) = &request.api_key {
        if key.len() < 10 {
            return Err(bad_request("api_key is implausibly short"));
        }
    }

    state
        .generator
        .set_credentials(request.api_key, request.model);

    Ok(success(serde_json::json!({
        "message": "generation client reconfigured",
        "model": state.generator.model_name(),
    })))
}
