//! In-memory store adapters with fault injection.
//!
//! These back the unit and integration tests: they honor the same contracts
//! as the production adapters (idempotent deletes, group scoping inside the
//! query, rank-ordered hits) and can be flipped down or made to fail a fixed
//! number of calls to exercise partial-failure paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::error::LexError;
use crate::record::{CanonicalRecord, RecordKind, SearchHit};
use crate::store::{GraphStore, RelationalStore, StoreKind, VectorStore};

#[derive(Default)]
struct Faults {
    down: AtomicBool,
    fail_next: AtomicU32,
}

impl Faults {
    fn check(&self, store: StoreKind) -> Result<(), LexError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LexError::StoreUnavailable {
                store,
                message: "backend marked down".to_string(),
            });
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(LexError::StoreUnavailable {
                store,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Naive term-overlap score over a text body; good enough to rank fixtures.
fn overlap_score(query: &str, body: &str) -> f64 {
    let body_lower = body.to_lowercase();
    let mut matched = 0usize;
    let mut total = 0usize;
    for term in query.to_lowercase().split_whitespace() {
        total += 1;
        if body_lower.contains(term) {
            matched += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        matched as f64 / total as f64
    }
}

fn rank_and_truncate(mut hits: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    hits
}

/// In-memory relational store.
#[derive(Default)]
pub struct MemoryRelational {
    rows: Mutex<HashMap<String, CanonicalRecord>>,
    faults: Faults,
}

impl MemoryRelational {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.faults.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: u32) {
        self.faults.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RelationalStore for MemoryRelational {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), LexError> {
        self.faults.check(StoreKind::Relational)?;
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, LexError> {
        self.faults.check(StoreKind::Relational)?;
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn list(
        &self,
        group_id: &str,
        kind: Option<RecordKind>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalRecord>, LexError> {
        self.faults.check(StoreKind::Relational)?;
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<CanonicalRecord> = rows
            .values()
            .filter(|record| record.group_id == group_id)
            .filter(|record| kind.is_none_or(|kind| record.kind == kind))
            .cloned()
            .collect();
        // Chronological, dateless rows last, id as the stable tie-break.
        records.sort_by(|a, b| match (a.date, b.date) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete(&self, id: &str) -> Result<bool, LexError> {
        self.faults.check(StoreKind::Relational)?;
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some())
    }

    async fn text_search(
        &self,
        query: &str,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError> {
        self.faults.check(StoreKind::Relational)?;
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let hits = rows
            .values()
            .filter(|record| record.group_id == group_id)
            .filter_map(|record| {
                let haystack = format!(
                    "{} {} {}",
                    record.description,
                    record.excerpts.as_deref().unwrap_or(""),
                    record.significance.as_deref().unwrap_or("")
                );
                let score = overlap_score(query, &haystack);
                (score > 0.0).then(|| SearchHit {
                    id: record.id.clone(),
                    store: StoreKind::Relational,
                    raw_score: score,
                    payload: record.payload(),
                    updated_at: Some(record.updated_at),
                })
            })
            .collect();
        Ok(rank_and_truncate(hits, limit))
    }

    async fn probe(&self) -> Result<(), LexError> {
        self.faults.check(StoreKind::Relational)
    }
}

/// In-memory vector store keyed by record id.
#[derive(Default)]
pub struct MemoryVector {
    points: Mutex<HashMap<String, (Vec<f32>, CanonicalRecord)>>,
    faults: Faults,
}

impl MemoryVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.faults.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: u32) {
        self.faults.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.points.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        f64::from(dot / (norm_a * norm_b))
    }
}

#[async_trait]
impl VectorStore for MemoryVector {
    async fn upsert(&self, record: &CanonicalRecord, embedding: &[f32]) -> Result<(), LexError> {
        self.faults.check(StoreKind::Vector)?;
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), (embedding.to_vec(), record.clone()));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), LexError> {
        self.faults.check(StoreKind::Vector)?;
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError> {
        self.faults.check(StoreKind::Vector)?;
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let hits = points
            .values()
            .filter(|(_, record)| record.group_id == group_id)
            .filter_map(|(stored, record)| {
                let score = cosine(embedding, stored);
                (score > 0.0).then(|| SearchHit {
                    id: record.id.clone(),
                    store: StoreKind::Vector,
                    raw_score: score,
                    payload: record.payload(),
                    updated_at: Some(record.updated_at),
                })
            })
            .collect();
        Ok(rank_and_truncate(hits, limit))
    }

    async fn probe(&self) -> Result<(), LexError> {
        self.faults.check(StoreKind::Vector)
    }
}

/// In-memory graph store holding one episode per record id.
#[derive(Default)]
pub struct MemoryGraph {
    episodes: Mutex<HashMap<String, (String, CanonicalRecord)>>,
    faults: Faults,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.faults.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: u32) {
        self.faults.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.episodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.episodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), LexError> {
        self.faults.check(StoreKind::Graph)?;
        self.episodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), (record.episode_body(), record.clone()));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), LexError> {
        self.faults.check(StoreKind::Graph)?;
        self.episodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    async fn traversal_search(
        &self,
        query: &str,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError> {
        self.faults.check(StoreKind::Graph)?;
        let episodes = self.episodes.lock().unwrap_or_else(|e| e.into_inner());
        let hits = episodes
            .values()
            .filter(|(_, record)| record.group_id == group_id)
            .filter_map(|(body, record)| {
                let score = overlap_score(query, body);
                (score > 0.0).then(|| SearchHit {
                    id: record.id.clone(),
                    store: StoreKind::Graph,
                    raw_score: score,
                    payload: record.payload(),
                    updated_at: Some(record.updated_at),
                })
            })
            .collect();
        Ok(rank_and_truncate(hits, limit))
    }

    async fn probe(&self) -> Result<(), LexError> {
        self.faults.check(StoreKind::Graph)
    }
}
