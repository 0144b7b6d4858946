//! Retrieval-augmented query orchestration.
//!
//! Composes the embedding client, vector store, generation client, and
//! session cache: embed the question, retrieve the top-K chunks (with an
//! optional subject filter), assemble a numbered context, and generate.
//! Generation failures never fail the request — the retrieved context is
//! returned verbatim behind a notice, preserving retrieval value when the
//! model is unavailable. Only retrieval/embedding failures surface as
//! errors.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::embedding::EmbeddingClient;
use crate::generation::{build_prompt, GenerationClient, PromptStyle, TranscriptMessage};
use crate::models::SearchHit;
use crate::session::SessionCache;
use crate::store::{MetadataFilter, VectorStore};

/// Instruction substituted automatically whenever retrieval is scoped to
/// one patient.
const PATIENT_SCOPED_INSTRUCTION: &str = "You are a clinical records assistant focused on a \
    single patient. The context holds that patient's known history. When asked about a symptom \
    or condition the records do not mention, do not just say it is absent: relate it to the \
    patient's documented conditions, medications, and complaints, explain plausible connections, \
    and advise prompt medical review when the history warrants it.";

const RESET_ACK: &str = "Conversation history cleared successfully.";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    pub session_id: String,
    #[serde(default)]
    pub patient_code: Option<String>,
    #[serde(default)]
    pub reset: bool,
    /// Caller-owned transcript; when present the session cache holds no
    /// history for this conversation.
    #[serde(default)]
    pub history: Option<Vec<TranscriptMessage>>,
}

#[derive(Debug, serde::Serialize)]
pub struct SourceRef {
    pub content: String,
    pub metadata: Value,
    pub similarity: f64,
}

#[derive(Debug, serde::Serialize)]
pub struct QueryOutcome {
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub metadata: Value,
}

pub struct RagEngine {
    store: VectorStore,
    embedder: Arc<EmbeddingClient>,
    generator: Arc<GenerationClient>,
    sessions: Arc<SessionCache>,
    top_k: usize,
}

impl RagEngine {
    pub fn new(
        store: VectorStore,
        embedder: Arc<EmbeddingClient>,
        generator: Arc<GenerationClient>,
        sessions: Arc<SessionCache>,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            sessions,
            top_k,
        }
    }

    /// Single-turn query: embed, retrieve, generate. Degrades to a
    /// context-only answer when generation fails.
    pub async fn query(&self, prompt: &str, patient_code: Option<&str>) -> Result<QueryOutcome> {
        let filter = patient_code.map(|code| MetadataFilter::new().with("patient_code", code));
        let system_instruction = filter.as_ref().map(|_| PATIENT_SCOPED_INSTRUCTION);

        let query_vec = self.embedder.embed_query(prompt).await?;
        let hits = self
            .store
            .similarity_search(&query_vec, self.top_k, filter.as_ref())
            .await?;
        let context = build_context(&hits);

        let response = match self
            .generator
            .answer(prompt, Some(&context), system_instruction)
            .await
        {
            Ok(answer) => answer,
            Err(err) => {
                warn!(error = %err, "generation failed; returning retrieved context");
                degraded_response(&hits, &context)
            }
        };

        Ok(QueryOutcome {
            response,
            metadata: json!({
                "num_sources": hits.len(),
                "filters_applied": filter.map(|f| f.to_json()).unwrap_or_else(|| json!({})),
            }),
            sources: source_refs(hits),
        })
    }

    /// One turn of a session-aware chat. A reset with an empty prompt is
    /// a pure session wipe: no retrieval, no generation.
    pub async fn chat(&self, request: &ChatRequest) -> Result<QueryOutcome> {
        if request.reset && request.prompt.trim().is_empty() {
            self.sessions.remove(&request.session_id);
            info!(session_id = request.session_id.as_str(), "chat session wiped");
            return Ok(QueryOutcome {
                response: RESET_ACK.to_string(),
                sources: Vec::new(),
                metadata: json!({
                    "num_sources": 0,
                    "session_id": request.session_id,
                    "reset_applied": true,
                    "context_preserved": false,
                    "turn_count": 0,
                }),
            });
        }

        // Scope: the caller's filter wins; an omitted one is restored
        // from the session so follow-up turns stay scoped.
        let snapshot = self.sessions.begin_turn(
            &request.session_id,
            request.reset,
            request.patient_code.clone(),
        );
        let scope = snapshot.scope.clone();
        let filter = scope
            .as_deref()
            .map(|code| MetadataFilter::new().with("patient_code", code));
        let system_instruction = filter.as_ref().map(|_| PATIENT_SCOPED_INSTRUCTION);

        let query_vec = self.embedder.embed_query(&request.prompt).await?;
        let hits = self
            .store
            .similarity_search(&query_vec, self.top_k, filter.as_ref())
            .await?;
        let context = build_context(&hits);

        let external = request.history.as_deref().filter(|h| !h.is_empty());
        let style = match external {
            Some(messages) => PromptStyle::Transcript(messages),
            None if snapshot.resumed && !snapshot.history.is_empty() => PromptStyle::FollowUp,
            None => PromptStyle::Fresh,
        };
        let message = build_prompt(&request.prompt, Some(&context), system_instruction, &style);

        // With a caller-owned transcript the cache history is not
        // replayed; the transcript is already serialized into the prompt.
        let replay = if external.is_some() {
            &[]
        } else {
            snapshot.history.as_slice()
        };

        let (response, context_preserved, turn_count) =
            match self.generator.chat_turn(replay, &message).await {
                Ok(answer) => {
                    let turns = self.sessions.complete_turn(
                        &request.session_id,
                        scope.clone(),
                        &request.prompt,
                        &answer,
                    );
                    (answer, snapshot.resumed, turns)
                }
                Err(err) => {
                    warn!(
                        session_id = request.session_id.as_str(),
                        error = %err,
                        "chat generation failed; returning retrieved context"
                    );
                    (degraded_response(&hits, &context), false, 0)
                }
            };

        Ok(QueryOutcome {
            response,
            metadata: json!({
                "num_sources": hits.len(),
                "filters_applied": filter.map(|f| f.to_json()).unwrap_or_else(|| json!({})),
                "session_id": request.session_id,
                "reset_applied": request.reset,
                "context_preserved": context_preserved,
                "turn_count": turn_count,
            }),
            sources: source_refs(hits),
        })
    }

    /// Unranked raw fetch, optionally scoped to a patient and kind.
    pub async fn records(
        &self,
        kind: Option<&str>,
        patient_code: Option<&str>,
        limit: i64,
    ) -> Result<Vec<crate::models::StoredRecord>> {
        let filter = patient_code.map(|code| MetadataFilter::new().with("patient_code", code));
        self.store.raw_fetch(kind, filter.as_ref(), limit).await
    }
}

/// Numbered context string: each chunk's text plus a flat rendering of
/// its metadata.
fn build_context(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No relevant context found.".to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        parts.push(format!("[Record {}]", i + 1));
        parts.push(hit.content.clone());
        if let Some(map) = hit.metadata.as_object() {
            if !map.is_empty() {
                let rendered: Vec<String> = map
                    .iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => format!("{}: {}", k, s),
                        other => format!("{}: {}", k, other),
                    })
                    .collect();
                parts.push(format!("Metadata: {}", rendered.join(", ")));
            }
        }
        parts.push(String::new());
    }

    parts.join("\n")
}

fn degraded_response(hits: &[SearchHit], context: &str) -> String {
    format!(
        "[assistant unavailable - showing retrieved context]\n\nFound {} relevant records:\n\n{}",
        hits.len(),
        context
    )
}

fn source_refs(hits: Vec<SearchHit>) -> Vec<SourceRef> {
    hits.into_iter()
        .map(|hit| SourceRef {
            content: truncate_chars(&hit.content, 200),
            metadata: hit.metadata,
            similarity: hit.similarity,
        })
        .collect()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}
