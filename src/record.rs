//! Canonical record model and per-operation result shapes.
//!
//! A record is a chronology event or a research snippet. The relational
//! store owns the authoritative row; the vector and graph stores hold
//! rebuildable projections keyed by the same immutable `id`. No store may
//! generate or transform an id.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoreKind;

/// Kind of canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Event,
    Snippet,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Snippet => "snippet",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "event" => Some(Self::Event),
            "snippet" => Some(Self::Snippet),
            _ => None,
        }
    }
}

/// The single logical record kept consistent across all three stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub group_id: String,
    pub kind: RecordKind,
    pub date: Option<NaiveDate>,
    /// Event description, or a snippet's key language.
    pub description: String,
    pub parties: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub document_source: Option<String>,
    pub excerpts: Option<String>,
    pub significance: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Text fed to the embedding provider for the vector projection.
    pub fn embedding_text(&self) -> String {
        let mut text = self.description.clone();
        if let Some(excerpts) = &self.excerpts {
            text.push(' ');
            text.push_str(excerpts);
        }
        if let Some(significance) = &self.significance {
            text.push(' ');
            text.push_str(significance);
        }
        text
    }

    /// Episode body stored in the knowledge graph projection.
    pub fn episode_body(&self) -> String {
        let mut body = match self.date {
            Some(date) => format!("On {date}: {}", self.description),
            None => self.description.clone(),
        };
        if let Some(excerpts) = &self.excerpts {
            body.push_str("\nExcerpts: ");
            body.push_str(excerpts);
        }
        body
    }

    /// Payload surfaced to search callers.
    pub fn payload(&self) -> Value {
        serde_json::json!({
            "kind": self.kind.as_str(),
            "date": self.date.map(|d| d.to_string()),
            "description": self.description,
            "parties": self.parties.clone().unwrap_or_default(),
            "tags": self.tags.clone().unwrap_or_default(),
            "group_id": self.group_id,
        })
    }
}

/// Inbound create request. List-valued fields arrive in whatever shape the
/// client chose; the parameter normalizer canonicalizes them before the
/// coordinator touches any store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRecord {
    pub group_id: Option<String>,
    #[serde(default)]
    pub kind: RecordKind,
    pub date: Option<String>,
    /// Required; absence is caught by coordinator validation, not by
    /// deserialization, so the caller gets the uniform error envelope.
    #[serde(default)]
    pub description: String,
    pub parties: Option<Value>,
    pub tags: Option<Value>,
    pub document_source: Option<String>,
    pub excerpts: Option<String>,
    pub significance: Option<String>,
}

impl Default for RecordKind {
    fn default() -> Self {
        Self::Event
    }
}

/// Partial update. `None` leaves a field untouched; for list fields an
/// explicit JSON `null` clears the value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordPatch {
    pub group_id: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub parties: Option<Value>,
    pub tags: Option<Value>,
    pub document_source: Option<String>,
    pub excerpts: Option<String>,
    pub significance: Option<String>,
}

/// Outcome of one write against one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreWriteState {
    Committed,
    Pending,
    Failed,
}

/// Per-store status map for one logical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStatus {
    pub relational: StoreWriteState,
    pub vector: StoreWriteState,
    pub graph: StoreWriteState,
}

impl WriteStatus {
    /// True when the primary committed but a projection did not.
    pub fn degraded(&self) -> bool {
        self.relational == StoreWriteState::Committed
            && (self.vector != StoreWriteState::Committed
                || self.graph != StoreWriteState::Committed)
    }
}

/// Per-operation outcome, returned to the caller even on partial failure.
#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    pub id: String,
    pub status: WriteStatus,
}

impl WriteResult {
    /// Human-readable consistency state for the response body.
    pub fn state(&self) -> &'static str {
        if self.status.degraded() {
            "degraded"
        } else {
            "consistent"
        }
    }
}

/// A single hit from one backend, before fusion.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub store: StoreKind,
    pub raw_score: f64,
    pub payload: Value,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A fused, deduplicated search result.
#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub id: String,
    pub fused_score: f64,
    pub payload: Value,
    pub contributing_stores: Vec<StoreKind>,
}
