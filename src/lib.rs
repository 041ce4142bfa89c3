//! lexgrid: multi-backend coordination core for legal research data.
//!
//! One logical record — a chronology event or research snippet — is kept
//! consistent across three independently-failing backends: PostgreSQL as
//! the authoritative store of record, Qdrant as a vector-similarity index,
//! and Neo4j as a temporal knowledge graph. The crate provides the write
//! coordinator that enforces "relational authoritative, secondaries
//! eventually consistent", the unified search engine that fans queries out
//! and fuses the rankings, and a resilient CourtListener client for
//! ingesting external opinions.

pub mod config;
pub mod coordinator;
pub mod courtlistener;
pub mod embedding;
pub mod error;
pub mod lifecycle;
pub mod params;
pub mod record;
pub mod retry;
pub mod search;
pub mod server;
pub mod store;

pub use coordinator::WriteCoordinator;
pub use error::{ConfigError, LexError};
pub use lifecycle::{Backends, ServiceState};
pub use record::{CanonicalRecord, NewRecord, RankedResult, RecordPatch, WriteResult};
pub use search::{SearchEngine, SearchMode};
