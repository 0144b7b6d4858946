//! HTTP client for the practice-management system's sync API.
//!
//! Two calls per kind: a domain-filtered bulk fetch returning full nested
//! records, and a mark-synced acknowledgement for processed ids. Every
//! call carries a bearer secret and is individually time-bounded.
//!
//! # Retry Strategy
//!
//! Transient failures retry with exponential backoff (1s, 2s, 4s, ...,
//! capped at 2^5): HTTP 429, 5xx, and network errors. Other 4xx responses
//! fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use crate::config::SourceConfig;
use crate::models::SourceRecord;
use crate::registry::KindSpec;

/// A source of records the pipeline can drain and acknowledge.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Bulk-fetch candidate records for a kind. With `incremental`, the
    /// fetch restricts to records the source has not yet marked synced.
    async fn fetch_records(
        &self,
        spec: &KindSpec,
        limit: Option<usize>,
        incremental: bool,
    ) -> Result<Vec<SourceRecord>>;

    /// Tell the source the given records are indexed. Returns the number
    /// of records the source reports as updated.
    async fn mark_synced(&self, spec: &KindSpec, ids: &[i64]) -> Result<u64>;
}

pub struct PracticeConnector {
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl PracticeConnector {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl RecordSource for PracticeConnector {
    async fn fetch_records(
        &self,
        spec: &KindSpec,
        limit: Option<usize>,
        incremental: bool,
    ) -> Result<Vec<SourceRecord>> {
        let mut body = json!({ "domain": spec.domain(incremental) });
        if let Some(limit) = limit {
            body["limit"] = json!(limit);
        }

        let url = format!("{}/api/sync/{}/fetch_all", self.base_url, spec.fetch_path);
        let data = self.post_with_retry(&url, &body).await?;

        let rows = match data {
            Value::Array(rows) => rows,
            other => bail!("fetch_all returned non-list data: {}", other),
        };

        let mut records = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in rows {
            match SourceRecord::from_payload(spec.name, row) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(kind = spec.name, skipped, "dropped records without an id");
        }

        info!(kind = spec.name, count = records.len(), "fetched records");
        Ok(records)
    }

    async fn mark_synced(&self, spec: &KindSpec, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let url = format!("{}/api/sync/{}/mark_synced", self.base_url, spec.fetch_path);
        let data = self.post_with_retry(&url, &json!({ "ids": ids })).await?;

        let updated = data
            .get("updated")
            .and_then(Value::as_u64)
            .or_else(|| data.as_u64())
            .unwrap_or(0);

        info!(kind = spec.name, updated, "marked records synced");
        Ok(updated)
    }
}

impl PracticeConnector {
    /// POST a JSON body, unwrap the `{status, data}` envelope, retry
    /// transient failures with exponential backoff.
    async fn post_with_retry(&self, url: &str, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let envelope: Value = response.json().await?;
                        return unwrap_envelope(envelope);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "practice API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("practice API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "practice API connection error ({}): {}",
                        url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("practice API call failed after retries")))
    }
}

fn unwrap_envelope(envelope: Value) -> Result<Value> {
    match envelope.get("status").and_then(Value::as_str) {
        Some("success") => Ok(envelope.get("data").cloned().unwrap_or(Value::Null)),
        Some("error") => {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error");
            bail!("practice API rejected the request: {}", message)
        }
        _ => bail!("practice API returned an unrecognized envelope: {}", envelope),
    }
}
