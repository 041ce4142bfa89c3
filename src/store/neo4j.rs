//! Neo4j adapter: the temporal knowledge-graph projection.
//!
//! Each record projects to one `Episode` node carrying a rendered body;
//! traversal search runs a fulltext-index query over those bodies. Uses the
//! HTTP transactional endpoint, which keeps this adapter on the same
//! reqwest stack as the other remote backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::config::DatabaseConfig;
use crate::error::LexError;
use crate::record::{CanonicalRecord, SearchHit};
use crate::store::{GraphStore, StoreKind};

const FULLTEXT_INDEX: &str = "episode_body";

pub struct Neo4jStore {
    client: reqwest::Client,
    commit_url: String,
    user: String,
    password: SecretString,
}

impl Neo4jStore {
    pub fn new(client: reqwest::Client, config: &DatabaseConfig) -> Self {
        let base = config.neo4j_url.trim_end_matches('/');
        Self {
            client,
            commit_url: format!("{base}/db/{}/tx/commit", config.neo4j_database),
            user: config.neo4j_user.clone(),
            password: config.neo4j_password.clone(),
        }
    }

    /// Create the fulltext index backing traversal search. Idempotent.
    pub async fn ensure_index(&self) -> Result<(), LexError> {
        self.run(
            &format!(
                "CREATE FULLTEXT INDEX {FULLTEXT_INDEX} IF NOT EXISTS \
                 FOR (e:Episode) ON EACH [e.body]"
            ),
            json!({}),
        )
        .await?;
        Ok(())
    }

    /// Run one statement through the transactional commit endpoint.
    async fn run(&self, statement: &str, parameters: Value) -> Result<Value, LexError> {
        let response = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .json(&json!({
                "statements": [{ "statement": statement, "parameters": parameters }]
            }))
            .send()
            .await
            .map_err(|e| graph_err(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(graph_err(format!("endpoint returned {status}: {detail}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| graph_err(format!("response decode failed: {e}")))?;

        // The endpoint reports query failures in-band with HTTP 200.
        if let Some(errors) = body.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            return Err(graph_err(format!("query failed: {}", errors[0])));
        }
        Ok(body)
    }
}

fn graph_err(message: impl Into<String>) -> LexError {
    LexError::StoreUnavailable {
        store: StoreKind::Graph,
        message: message.into(),
    }
}

/// Rows come back as `{"results": [{"data": [{"row": [...]}]}]}`.
fn result_rows(body: &Value) -> Vec<&Vec<Value>> {
    body.pointer("/results/0/data")
        .and_then(Value::as_array)
        .map(|data| {
            data.iter()
                .filter_map(|entry| entry.get("row").and_then(Value::as_array))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), LexError> {
        self.run(
            "MERGE (e:Episode {id: $id}) \
             SET e.group_id = $group_id, \
                 e.body = $body, \
                 e.payload = $payload, \
                 e.updated_at = $updated_at",
            json!({
                "id": record.id,
                "group_id": record.group_id,
                "body": record.episode_body(),
                "payload": record.payload().to_string(),
                "updated_at": record.updated_at.to_rfc3339(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), LexError> {
        self.run(
            "MATCH (e:Episode {id: $id}) DETACH DELETE e",
            json!({ "id": id }),
        )
        .await?;
        Ok(())
    }

    async fn traversal_search(
        &self,
        query: &str,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError> {
        let body = self
            .run(
                &format!(
                    "CALL db.index.fulltext.queryNodes('{FULLTEXT_INDEX}', $query) \
                     YIELD node, score \
                     WHERE node.group_id = $group_id \
                     RETURN node.id, score, node.payload, node.updated_at \
                     ORDER BY score DESC \
                     LIMIT {limit}"
                ),
                json!({ "query": query, "group_id": group_id }),
            )
            .await?;

        let hits = result_rows(&body)
            .into_iter()
            .filter_map(|row| {
                let id = row.first()?.as_str()?.to_string();
                let raw_score = row.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                let payload = row
                    .get(2)
                    .and_then(Value::as_str)
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or(Value::Null);
                let updated_at = row
                    .get(3)
                    .and_then(Value::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                Some(SearchHit {
                    id,
                    store: StoreKind::Graph,
                    raw_score,
                    payload,
                    updated_at,
                })
            })
            .collect();
        Ok(hits)
    }

    async fn probe(&self) -> Result<(), LexError> {
        self.run("RETURN 1", json!({})).await.map(|_| ())
    }
}
