use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::models::EMBEDDING_DIM;

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Dense-vector embedding client.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Remote embedding client speaking the OpenAI-compatible `/embeddings` API.
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbeddingClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(EMBEDDING_TIMEOUT)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .context("embedding request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("embedding API returned {}", response.status()));
        }

        let body: Value = response
            .json()
            .await
            .context("failed to parse embedding response")?;

        let vector: Vec<f32> = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| anyhow!("embedding response missing data[0].embedding"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if vector.len() != EMBEDDING_DIM {
            return Err(anyhow!(
                "embedding dimension mismatch: got {}, expected {}",
                vector.len(),
                EMBEDDING_DIM
            ));
        }

        info!(chars = text.len(), "query embedded");
        Ok(vector)
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero vectors.
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
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
