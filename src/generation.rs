//! Generation client.
//!
//! Calls a Google-style generative-language REST API: a prompt in, text
//! out, with multi-turn support by replaying the session's turns in the
//! request. The active model and credential live behind a lock and can be
//! swapped at runtime, taking effect on the next call.
//!
//! # Unknown-model fallback
//!
//! When a call fails because the configured model identifier is not
//! recognized, the client asks the provider for its current model list,
//! picks one whose identifier contains the configured fallback family
//! substring (else the first listed), reconfigures itself, and retries
//! the same call exactly once. Any other failure propagates unchanged.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::GenerationConfig;

/// One remembered exchange half within a chat session.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    /// `"user"` or `"model"`.
    pub role: String,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            text: text.into(),
        }
    }
}

/// Caller-owned transcript message, for chats whose history lives outside
/// this service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: String,
}

/// How the outgoing prompt is framed.
pub enum PromptStyle<'a> {
    /// New or reset session: full framing with system instruction,
    /// retrieved context, and the question.
    Fresh,
    /// Live session with remembered turns: shorter follow-up framing.
    FollowUp,
    /// Caller supplied the full transcript: serialize it verbatim with an
    /// instruction to treat it as the conversation history.
    Transcript(&'a [TranscriptMessage]),
}

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a clinical records assistant. Answer questions \
    from the provided practice context. Be precise and professional, cite the relevant records, \
    and say so plainly when the context does not contain enough information.";

/// Assemble the full prompt text for one generation call.
pub fn build_prompt(
    prompt: &str,
    context: Option<&str>,
    system_instruction: Option<&str>,
    style: &PromptStyle<'_>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    match style {
        PromptStyle::Fresh => {
            parts.push(format!(
                "System: {}\n",
                system_instruction.unwrap_or(DEFAULT_SYSTEM_INSTRUCTION)
            ));
            if let Some(context) = context {
                parts.push(format!("Context:\n{}\n", context));
            }
            parts.push(format!("Question: {}\n", prompt));
            parts.push("Answer:".to_string());
        }
        PromptStyle::FollowUp => {
            if let Some(instruction) = system_instruction {
                parts.push(format!("System: {}\n", instruction));
            }
            if let Some(context) = context {
                parts.push(format!("Additional context for this turn:\n{}\n", context));
            }
            parts.push(format!("Follow-up question: {}\n", prompt));
            parts.push("Answer, using the earlier turns of this conversation:".to_string());
        }
        PromptStyle::Transcript(messages) => {
            parts.push(format!(
                "System: {}\n",
                system_instruction.unwrap_or(DEFAULT_SYSTEM_INSTRUCTION)
            ));
            let mut transcript = String::new();
            for message in messages.iter() {
                transcript.push_str(&format!("{}: {}\n", message.role, message.content));
            }
            parts.push(format!(
                "Conversation so far (treat this as the authoritative history):\n{}",
                transcript
            ));
            if let Some(context) = context {
                parts.push(format!("Context:\n{}\n", context));
            }
            parts.push(format!("Question: {}\n", prompt));
            parts.push("Answer:".to_string());
        }
    }

    parts.join("\n")
}

struct GenState {
    api_key: String,
    model: String,
}

pub struct GenerationClient {
    base_url: String,
    state: RwLock<GenState>,
    fallback_family: String,
    client: reqwest::Client,
}

impl GenerationClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            state: RwLock::new(GenState {
                api_key,
                model: config.model.clone(),
            }),
            fallback_family: config.fallback_family.clone(),
            client,
        })
    }

    /// The currently active model identifier.
    pub fn model_name(&self) -> String {
        self.state.read().expect("generation state poisoned").model.clone()
    }

    /// Swap the active credential and/or model at runtime. Takes effect
    /// on the next call; no restart needed.
    pub fn set_credentials(&self, api_key: Option<String>, model: Option<String>) {
        let mut state = self.state.write().expect("generation state poisoned");
        if let Some(api_key) = api_key {
            state.api_key = api_key;
        }
        if let Some(model) = model {
            state.model = model;
        }
        info!(model = state.model.as_str(), "generation client reconfigured");
    }

    /// Single-turn generation. Errors propagate to the caller; the
    /// degradation wrapper lives in the orchestrator, not here.
    pub async fn answer(
        &self,
        prompt: &str,
        context: Option<&str>,
        system_instruction: Option<&str>,
    ) -> Result<String> {
        let full = build_prompt(prompt, context, system_instruction, &PromptStyle::Fresh);
        self.generate_with_fallback(vec![content("user", &full)])
            .await
    }

    /// One turn of a multi-turn chat: the session's remembered turns are
    /// replayed ahead of the new message.
    pub async fn chat_turn(&self, history: &[ChatTurn], message: &str) -> Result<String> {
        let mut contents: Vec<Value> = history
            .iter()
            .map(|turn| content(&turn.role, &turn.text))
            .collect();
        contents.push(content("user", message));
        self.generate_with_fallback(contents).await
    }

    async fn generate_with_fallback(&self, contents: Vec<Value>) -> Result<String> {
        let (model, api_key) = {
            let state = self.state.read().expect("generation state poisoned");
            (state.model.clone(), state.api_key.clone())
        };

        match self.generate(&model, &api_key, &contents).await {
            Ok(text) => Ok(text),
            Err(err) if is_model_not_found(&err) => {
                warn!(model = model.as_str(), "model not recognized; querying provider for a fallback");
                let available = self.list_models(&api_key).await.with_context(|| {
                    format!("model '{}' not found and listing models failed", model)
                })?;
                let fallback = pick_fallback(&available, &self.fallback_family)
                    .with_context(|| format!("model '{}' not found and no fallback available", model))?;

                info!(from = model.as_str(), to = fallback.as_str(), "switching to fallback model");
                self.set_credentials(None, Some(fallback.clone()));
                self.generate(&fallback, &api_key, &contents).await
            }
            Err(err) => Err(err),
        }
    }

    async fn generate(&self, model: &str, api_key: &str, contents: &[Value]) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&json!({ "contents": contents }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("generation API error {}: {}", status, body_text);
        }

        let body: Value = response.json().await?;
        extract_text(&body)
    }

    async fn list_models(&self, api_key: &str) -> Result<Vec<String>> {
        let url = format!("{}/v1beta/models?key={}", self.base_url, api_key);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("model listing error {}: {}", status, body_text);
        }

        let body: Value = response.json().await?;
        let models = body
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("model listing returned no models array"))?;

        Ok(models
            .iter()
            .filter(|m| {
                m.get("supportedGenerationMethods")
                    .and_then(Value::as_array)
                    .map(|methods| methods.iter().any(|v| v.as_str() == Some("generateContent")))
                    .unwrap_or(false)
            })
            .filter_map(|m| m.get("name").and_then(Value::as_str))
            .map(|name| name.trim_start_matches("models/").to_string())
            .collect())
    }
}

fn content(role: &str, text: &str) -> Value {
    json!({ "role": role, "parts": [{ "text": text }] })
}

fn extract_text(body: &Value) -> Result<String> {
    let parts = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("generation response had no candidates"))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        bail!("generation response contained no text parts");
    }
    Ok(text)
}

/// Whether an error is the unknown-model class that warrants fallback.
fn is_model_not_found(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("not found") || msg.contains("404") || msg.contains("not_found")
}

/// Prefer an identifier containing the family substring, else the first
/// available. Placeholder policy; the family comes from configuration.
fn pick_fallback(available: &[String], family: &str) -> Option<String> {
    available
        .iter()
        .find(|name| name.contains(family))
        .or_else(|| available.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_prompt_has_default_instruction() {
        let prompt = build_prompt("any allergies?", Some("ctx"), None, &PromptStyle::Fresh);
        assert!(prompt.starts_with("System: You are a clinical records assistant."));
        assert!(prompt.contains("Context:\nctx"));
        assert!(prompt.contains("Question: any allergies?"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn test_followup_prompt_references_prior_turns() {
        let prompt = build_prompt("and the dosage?", Some("ctx"), None, &PromptStyle::FollowUp);
        assert!(!prompt.contains("System: You are a clinical records assistant."));
        assert!(prompt.contains("Follow-up question: and the dosage?"));
        assert!(prompt.contains("earlier turns"));
    }

    #[test]
    fn test_transcript_prompt_serializes_history_verbatim() {
        let history = vec![
            TranscriptMessage {
                role: "user".into(),
                content: "is the BP high?".into(),
            },
            TranscriptMessage {
                role: "assistant".into(),
                content: "150/95 is elevated.".into(),
            },
        ];
        let prompt = build_prompt(
            "what was prescribed?",
            None,
            None,
            &PromptStyle::Transcript(&history),
        );
        assert!(prompt.contains("authoritative history"));
        assert!(prompt.contains("user: is the BP high?"));
        assert!(prompt.contains("assistant: 150/95 is elevated."));
    }

    #[test]
    fn test_pick_fallback_prefers_family() {
        let models = vec![
            "gemini-2.0-flash".to_string(),
            "gemini-1.5-pro".to_string(),
        ];
        assert_eq!(
            pick_fallback(&models, "gemini-1.5").as_deref(),
            Some("gemini-1.5-pro")
        );
        assert_eq!(
            pick_fallback(&models, "claude").as_deref(),
            Some("gemini-2.0-flash")
        );
        assert!(pick_fallback(&[], "gemini").is_none());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(is_model_not_found(&anyhow::anyhow!(
            "generation API error 404 Not Found: unknown model"
        )));
        assert!(!is_model_not_found(&anyhow::anyhow!(
            "generation API error 500: boom"
        )));
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]
        });
        assert_eq!(extract_text(&body).unwrap(), "ab");
        assert!(extract_text(&json!({"candidates": []})).is_err());
    }
}
