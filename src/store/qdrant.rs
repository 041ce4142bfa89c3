//! Qdrant adapter: the vector-similarity projection.
//!
//! Talks to Qdrant's REST API directly. Points are keyed by the record's
//! UUID, writes use `wait=true` so a returned upsert is durable, and every
//! similarity search carries a `group_id` must-filter so scoring never sees
//! other groups' points.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::config::DatabaseConfig;
use crate::error::LexError;
use crate::record::{CanonicalRecord, SearchHit};
use crate::store::{StoreKind, VectorStore};

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
}

impl QdrantStore {
    pub fn new(client: reqwest::Client, config: &DatabaseConfig) -> Self {
        Self {
            client,
            base_url: config.qdrant_url.trim_end_matches('/').to_string(),
            collection: config.qdrant_collection.clone(),
        }
    }

    /// Create the collection if it does not exist. Cosine distance; the
    /// vector size follows whatever the embedding provider produces.
    pub async fn ensure_collection(&self, vector_size: usize) -> Result<(), LexError> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let exists = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| vector_err(format!("collection check failed: {e}")))?;
        if exists.status().is_success() {
            return Ok(());
        }

        let response = self
            .client
            .put(&url)
            .json(&json!({
                "vectors": { "size": vector_size, "distance": "Cosine" }
            }))
            .send()
            .await
            .map_err(|e| vector_err(format!("collection create failed: {e}")))?;
        check_status("collection create", response).await?;
        Ok(())
    }

    fn point_payload(record: &CanonicalRecord) -> Value {
        let mut payload = record.payload();
        payload["updated_at"] = json!(record.updated_at.to_rfc3339());
        payload
    }
}

fn vector_err(message: impl Into<String>) -> LexError {
    LexError::StoreUnavailable {
        store: StoreKind::Vector,
        message: message.into(),
    }
}

async fn check_status(operation: &str, response: reqwest::Response) -> Result<Value, LexError> {
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(vector_err(format!("{operation} returned {status}: {detail}")));
    }
    response
        .json()
        .await
        .map_err(|e| vector_err(format!("{operation} decode failed: {e}")))
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, record: &CanonicalRecord, embedding: &[f32]) -> Result<(), LexError> {
        let url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, self.collection
        );
        let response = self
            .client
            .put(&url)
            .json(&json!({
                "points": [{
                    "id": record.id,
                    "vector": embedding,
                    "payload": Self::point_payload(record),
                }]
            }))
            .send()
            .await
            .map_err(|e| vector_err(format!("point upsert failed: {e}")))?;
        check_status("point upsert", response).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), LexError> {
        let url = format!(
            "{}/collections/{}/points/delete?wait=true",
            self.base_url, self.collection
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "points": [id] }))
            .send()
            .await
            .map_err(|e| vector_err(format!("point delete failed: {e}")))?;
        check_status("point delete", response).await?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "vector": embedding,
                "limit": limit,
                "with_payload": true,
                "filter": {
                    "must": [{ "key": "group_id", "match": { "value": group_id } }]
                }
            }))
            .send()
            .await
            .map_err(|e| vector_err(format!("similarity search failed: {e}")))?;
        let body = check_status("similarity search", response).await?;

        let hits = body
            .get("result")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .filter_map(|point| {
                        let id = point.get("id")?;
                        let id = id
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| id.to_string());
                        let payload = point.get("payload").cloned().unwrap_or(Value::Null);
                        let updated_at = payload
                            .get("updated_at")
                            .and_then(Value::as_str)
                            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                            .map(|dt| dt.with_timezone(&Utc));
                        Some(SearchHit {
                            id,
                            store: StoreKind::Vector,
                            raw_score: point.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                            payload,
                            updated_at,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }

    async fn probe(&self) -> Result<(), LexError> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| vector_err(format!("probe failed: {e}")))?;
        if !response.status().is_success() {
            return Err(vector_err(format!("probe returned {}", response.status())));
        }
        Ok(())
    }
}
