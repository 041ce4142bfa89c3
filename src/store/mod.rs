//! Backend store adapters.
//!
//! Each adapter is a thin per-backend seam: upsert-by-id, delete-by-id, a
//! backend-specific query, and a health probe. The coordinator and search
//! engine only ever see these traits, so tests run against the in-memory
//! implementations and production wires Postgres, Qdrant, and Neo4j.

pub mod memory;
pub mod neo4j;
pub mod postgres;
pub mod qdrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LexError;
use crate::record::{CanonicalRecord, RecordKind, SearchHit};

/// The three independently-failing backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Relational,
    Vector,
    Graph,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Vector => "vector",
            Self::Graph => "graph",
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authoritative store of record.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Idempotent write keyed by the record id.
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), LexError>;

    async fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, LexError>;

    /// Enumerate a group's records in chronological order (dateless rows
    /// last), optionally narrowed to one kind, with offset paging.
    async fn list(
        &self,
        group_id: &str,
        kind: Option<RecordKind>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalRecord>, LexError>;

    /// Returns whether a row existed. Deleting an absent id is a no-op.
    async fn delete(&self, id: &str) -> Result<bool, LexError>;

    /// Full-text search scoped to one group.
    async fn text_search(
        &self,
        query: &str,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError>;

    async fn probe(&self) -> Result<(), LexError>;

    /// Release pooled connections. Default is a no-op.
    async fn close(&self) {}
}

/// Derived similarity-index projection.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, record: &CanonicalRecord, embedding: &[f32]) -> Result<(), LexError>;

    async fn delete(&self, id: &str) -> Result<(), LexError>;

    async fn similarity_search(
        &self,
        embedding: &[f32],
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError>;

    async fn probe(&self) -> Result<(), LexError>;

    async fn close(&self) {}
}

/// Derived temporal knowledge-graph projection.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), LexError>;

    async fn delete(&self, id: &str) -> Result<(), LexError>;

    async fn traversal_search(
        &self,
        query: &str,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError>;

    async fn probe(&self) -> Result<(), LexError>;

    async fn close(&self) {}
}
