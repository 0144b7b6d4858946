//! Embedding client and vector utilities.
//!
//! The embedding model is an external HTTP service consumed as a black
//! box: a batch of texts in, one fixed-dimension vector per text out.
//! Two wire formats are supported, selected by `[embedding] provider`:
//!
//! - **`local`** — engine-style `POST {url}/api/embed` with
//!   `{"model", "input"}` returning `{"embeddings": [[..], ..]}`.
//! - **`openai`** — `POST {url}/v1/embeddings` returning
//!   `{"data": [{"embedding": [..]}, ..]}`.
//!
//! Vectors are L2-normalized here, before storage, so similarity in the
//! store reduces to a dot product.
//!
//! Also provides the vector plumbing shared with the store:
//! [`vec_to_blob`] / [`blob_to_vec`] for BLOB persistence and
//! [`cosine_similarity`] for ranking.

use anyhow::{bail, Result};
use serde_json::Value;
use std::time::Duration;

use crate::config::EmbeddingConfig;

pub struct EmbeddingClient {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    pub fn dims(&self) -> usize {
        self.config.dims
    }

    /// Embed a batch of texts, preserving input order. Each returned
    /// vector is validated against the configured dimensionality and
    /// normalized to unit length.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut embeddings = match self.config.provider.as_str() {
            "local" => self.embed_local(texts).await?,
            "openai" => self.embed_openai(texts).await?,
            other => bail!("Unknown embedding provider: {}", other),
        };

        if embeddings.len() != texts.len() {
            bail!(
                "embedding service returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            );
        }
        for vec in &mut embeddings {
            if vec.len() != self.config.dims {
                bail!(
                    "embedding dimension mismatch: got {}, expected {}",
                    vec.len(),
                    self.config.dims
                );
            }
            normalize(vec);
        }

        Ok(embeddings)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_texts(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_local(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self
            .config
            .url
            .as_deref()
            .unwrap_or("http://localhost:11434");

        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let json = self
            .post_with_retry(&format!("{}/api/embed", url), &body, None)
            .await?;

        let embeddings = json
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("Invalid embed response: missing embeddings array"))?;

        embeddings.iter().map(parse_vector).collect()
    }

    async fn embed_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self
            .config
            .url
            .as_deref()
            .unwrap_or("https://api.openai.com");
        let api_key = match &self.config.api_key {
            Some(key) => key.clone(),
            None => std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("embedding.api_key not set and OPENAI_API_KEY missing"))?,
        };

        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let json = self
            .post_with_retry(&format!("{}/v1/embeddings", url), &body, Some(&api_key))
            .await?;

        let data = json
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

        data.iter()
            .map(|item| {
                let embedding = item
                    .get("embedding")
                    .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
                parse_vector(embedding)
            })
            .collect()
    }

    async fn post_with_retry(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(url).json(body);
            if let Some(key) = bearer {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "embedding API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "embedding API connection error ({}): {}",
                        url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

fn parse_vector(value: &Value) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("embedding is not an array"))?;
    Ok(items
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut v = vec![0.0f32, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
