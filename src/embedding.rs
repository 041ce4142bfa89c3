//! Embedding provider seam.
//!
//! Embedding generation is an opaque external service. The coordinator and
//! search engine depend only on [`EmbeddingProvider`]; production wires an
//! OpenAI-compatible HTTP endpoint and tests use the deterministic hashing
//! provider. A provider failure is treated as a vector-store failure, never
//! a hard error for the write as a whole.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::LexError;
use crate::store::StoreKind;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LexError>;
}

/// OpenAI-compatible `/v1/embeddings` client.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: SecretString,
}

impl HttpEmbeddingProvider {
    pub fn new(client: reqwest::Client, url: &str, model: &str, api_key: SecretString) -> Self {
        Self {
            client,
            url: url.to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

fn vector_err(message: impl Into<String>) -> LexError {
    LexError::StoreUnavailable {
        store: StoreKind::Vector,
        message: message.into(),
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LexError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| vector_err(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(vector_err(format!(
                "embedding provider returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| vector_err(format!("embedding response decode failed: {e}")))?;

        let embedding = body
            .pointer("/data/0/embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| vector_err("embedding response missing data[0].embedding"))?
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect::<Vec<f32>>();

        if embedding.is_empty() {
            return Err(vector_err("embedding provider returned an empty vector"));
        }
        Ok(embedding)
    }
}

/// Deterministic token-hashing embedder for tests and offline use.
///
/// Same text always maps to the same unit vector, and texts sharing tokens
/// land closer together, which is all the search tests need.
pub struct HashEmbeddingProvider {
    dims: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(32)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LexError> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dims;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbeddingProvider::new(16);
        let a = embedder.embed("lease signed by tenant").await.expect("embed");
        let b = embedder.embed("lease signed by tenant").await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn shared_tokens_score_closer_than_disjoint_text() {
        let embedder = HashEmbeddingProvider::new(32);
        let query = embedder.embed("lease signed").await.expect("embed");
        let near = embedder.embed("lease signed yesterday").await.expect("embed");
        let far = embedder.embed("zoning variance appeal").await.expect("embed");

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&query, &near) > dot(&query, &far));
    }
}
