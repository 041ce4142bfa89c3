//! Unified search across the three stores.
//!
//! One query fans out concurrently to whichever backends the mode selects,
//! each leg bounded by its own timeout. A backend that errors or times out
//! contributes zero hits; the search degrades instead of failing. Hits are
//! then merged by id with reciprocal-rank fusion, so an id that ranks well
//! in several stores beats an id that tops only one.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::LexError;
use crate::lifecycle::Backends;
use crate::record::{RankedResult, SearchHit};
use crate::store::StoreKind;

/// Which backends a search touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Relational,
    Vector,
    Graph,
    All,
}

impl SearchMode {
    fn selects(self, kind: StoreKind) -> bool {
        match self {
            Self::All => true,
            Self::Relational => kind == StoreKind::Relational,
            Self::Vector => kind == StoreKind::Vector,
            Self::Graph => kind == StoreKind::Graph,
        }
    }
}

impl FromStr for SearchMode {
    type Err = LexError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "relational" => Ok(Self::Relational),
            "vector" => Ok(Self::Vector),
            "graph" => Ok(Self::Graph),
            "all" | "" => Ok(Self::All),
            other => Err(LexError::Validation(format!(
                "invalid search mode '{other}', expected relational, vector, graph, or all"
            ))),
        }
    }
}

/// Fans queries out and fuses the answers.
pub struct SearchEngine {
    backends: Arc<Backends>,
    fusion_k: f64,
    per_store_timeout: Duration,
}

impl SearchEngine {
    pub fn new(backends: Arc<Backends>, fusion_k: f64, per_store_timeout: Duration) -> Self {
        Self {
            backends,
            fusion_k,
            per_store_timeout,
        }
    }

    /// Run one query against the selected stores and return the fused
    /// ranking, truncated to `limit`.
    ///
    /// Group scoping happens inside each adapter query, before any ranking,
    /// so hits from other groups never influence the fusion. A group with no
    /// matching records is a valid empty result.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<RankedResult>, LexError> {
        self.backends.guard()?;
        let query = query.trim();
        if query.is_empty() {
            return Err(LexError::Validation("query must not be empty".to_string()));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Each leg fetches more than `limit` so fusion has cross-store
        // overlap to work with before the final truncation.
        let fetch = limit.saturating_mul(3).max(limit);

        let relational_leg = async {
            if !mode.selects(StoreKind::Relational) {
                return Vec::new();
            }
            self.leg(
                StoreKind::Relational,
                self.backends.relational.text_search(query, group_id, fetch),
            )
            .await
        };

        let vector_leg = async {
            if !mode.selects(StoreKind::Vector) {
                return Vec::new();
            }
            let embed_and_search = async {
                let embedding = self.backends.embedder.embed(query).await?;
                self.backends
                    .vector
                    .similarity_search(&embedding, group_id, fetch)
                    .await
            };
            self.leg(StoreKind::Vector, embed_and_search).await
        };

        let graph_leg = async {
            if !mode.selects(StoreKind::Graph) {
                return Vec::new();
            }
            self.leg(
                StoreKind::Graph,
                self.backends.graph.traversal_search(query, group_id, fetch),
            )
            .await
        };

        let (relational, vector, graph) = tokio::join!(relational_leg, vector_leg, graph_leg);

        let mut per_store = Vec::new();
        for hits in [relational, vector, graph] {
            if !hits.is_empty() {
                per_store.push(hits);
            }
        }
        Ok(fuse_hits(per_store, self.fusion_k, limit))
    }

    /// One bounded backend leg; failure and timeout both degrade to zero hits.
    async fn leg(
        &self,
        store: StoreKind,
        fut: impl Future<Output = Result<Vec<SearchHit>, LexError>>,
    ) -> Vec<SearchHit> {
        match timeout(self.per_store_timeout, fut).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                tracing::warn!(store = %store, error = %e, "search leg failed, contributing zero hits");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    store = %store,
                    timeout_ms = self.per_store_timeout.as_millis() as u64,
                    "search leg timed out, contributing zero hits"
                );
                Vec::new()
            }
        }
    }
}

/// Reciprocal-rank fusion over per-store rank lists.
///
/// Each store's list is assumed already ordered best-first; a hit at rank
/// `r` (1-based) contributes `1 / (k + r)` to its id's fused score. Ties
/// break on most recent `updated_at`, then ascending id, so the ordering is
/// deterministic for fixed inputs.
pub fn fuse_hits(per_store: Vec<Vec<SearchHit>>, k: f64, limit: usize) -> Vec<RankedResult> {
    struct Fused {
        score: f64,
        payload: serde_json::Value,
        updated_at: Option<chrono::DateTime<chrono::Utc>>,
        stores: Vec<StoreKind>,
    }

    let mut merged: HashMap<String, Fused> = HashMap::new();
    for hits in per_store {
        for (index, hit) in hits.into_iter().enumerate() {
            let contribution = 1.0 / (k + (index + 1) as f64);
            let entry = merged.entry(hit.id).or_insert(Fused {
                score: 0.0,
                payload: hit.payload,
                updated_at: hit.updated_at,
                stores: Vec::new(),
            });
            entry.score += contribution;
            if hit.updated_at > entry.updated_at {
                entry.updated_at = hit.updated_at;
            }
            if !entry.stores.contains(&hit.store) {
                entry.stores.push(hit.store);
            }
        }
    }

    let mut scored: Vec<(Fused, String)> = merged
        .into_iter()
        .map(|(id, fused)| (fused, id))
        .collect();
    scored.sort_by(|(a, a_id), (b, b_id)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a_id.cmp(b_id))
    });
    scored.truncate(limit);

    scored
        .into_iter()
        .map(|(fused, id)| RankedResult {
            id,
            fused_score: fused.score,
            payload: fused.payload,
            contributing_stores: fused.stores,
        })
        .collect()
}
