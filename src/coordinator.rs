//! Write coordination across the three stores.
//!
//! The consistency model is deliberate and narrow: the relational store is
//! authoritative, the vector and graph stores are eventually-consistent
//! best-effort projections. A create/update/delete commits synchronously to
//! the relational store, then fans out to the secondaries concurrently under
//! bounded timeouts. Secondary failures never invalidate the primary commit;
//! they are reported in the `WriteResult` status and replayed through the
//! retry queue. There is no cross-store transaction and no attempt at one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::LexError;
use crate::lifecycle::Backends;
use crate::params::normalize_list;
use crate::record::{
    CanonicalRecord, NewRecord, RecordKind, RecordPatch, StoreWriteState, WriteResult, WriteStatus,
};
use crate::retry::{RetryOp, RetryQueue, RetryStats, RetryTask};
use crate::store::StoreKind;

/// Orchestrates create/update/delete across the relational, vector, and
/// graph adapters with the partial-failure policy described above.
pub struct WriteCoordinator {
    backends: Arc<Backends>,
    retry: Arc<RetryQueue>,
    secondary_timeout: Duration,
}

impl WriteCoordinator {
    pub fn new(backends: Arc<Backends>, retry: Arc<RetryQueue>, secondary_timeout: Duration) -> Self {
        Self {
            backends,
            retry,
            secondary_timeout,
        }
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }

    pub fn retry_pending_for(&self) -> Vec<StoreKind> {
        [StoreKind::Vector, StoreKind::Graph]
            .into_iter()
            .filter(|kind| self.retry.has_pending_for(*kind))
            .collect()
    }

    /// Create a record: assign the id, commit to the relational store, then
    /// fan out to the projections.
    ///
    /// A relational failure aborts the whole operation — there is nothing to
    /// index yet. Secondary outcomes are reported, never fatal.
    pub async fn create(&self, input: NewRecord) -> Result<WriteResult, LexError> {
        self.backends.guard()?;

        let description = input.description.trim().to_string();
        if description.is_empty() {
            return Err(LexError::Validation("description is required".to_string()));
        }
        let date = parse_date(input.date.as_deref())?;

        let now = Utc::now();
        let record = CanonicalRecord {
            id: Uuid::new_v4().to_string(),
            group_id: group_or_default(input.group_id),
            kind: input.kind,
            date,
            description,
            parties: normalize_list(input.parties.as_ref()),
            tags: normalize_list(input.tags.as_ref()),
            document_source: none_if_blank(input.document_source),
            excerpts: none_if_blank(input.excerpts),
            significance: none_if_blank(input.significance),
            created_at: now,
            updated_at: now,
        };

        // Synchronous primary commit; hard failure, no secondary dispatch.
        self.backends.relational.upsert(&record).await?;
        tracing::info!(id = %record.id, group_id = %record.group_id, "record committed to relational store");

        let (vector, graph) = self.dispatch_secondary(record.clone()).await;
        Ok(WriteResult {
            id: record.id,
            status: WriteStatus {
                relational: StoreWriteState::Committed,
                vector,
                graph,
            },
        })
    }

    /// Apply a partial update. Same synchronous-primary / async-secondary
    /// fan-out as create; upserts keep every store idempotent by id.
    pub async fn update(&self, id: &str, patch: RecordPatch) -> Result<WriteResult, LexError> {
        self.backends.guard()?;
        if id.trim().is_empty() {
            return Err(LexError::Validation("record id is required".to_string()));
        }

        let mut record = self
            .backends
            .relational
            .get(id)
            .await?
            .ok_or_else(|| LexError::NotFound(id.to_string()))?;

        if let Some(description) = patch.description {
            let description = description.trim().to_string();
            if description.is_empty() {
                return Err(LexError::Validation(
                    "description must not be empty".to_string(),
                ));
            }
            record.description = description;
        }
        if let Some(raw) = patch.date.as_deref() {
            record.date = parse_date(Some(raw))?;
        }
        if let Some(group_id) = patch.group_id {
            record.group_id = group_or_default(Some(group_id));
        }
        if let Some(parties) = patch.parties.as_ref() {
            record.parties = normalize_list(Some(parties));
        }
        if let Some(tags) = patch.tags.as_ref() {
            record.tags = normalize_list(Some(tags));
        }
        if let Some(source) = patch.document_source {
            record.document_source = none_if_blank(Some(source));
        }
        if let Some(excerpts) = patch.excerpts {
            record.excerpts = none_if_blank(Some(excerpts));
        }
        if let Some(significance) = patch.significance {
            record.significance = none_if_blank(Some(significance));
        }
        record.updated_at = Utc::now();

        self.backends.relational.upsert(&record).await?;
        let (vector, graph) = self.dispatch_secondary(record.clone()).await;
        Ok(WriteResult {
            id: record.id,
            status: WriteStatus {
                relational: StoreWriteState::Committed,
                vector,
                graph,
            },
        })
    }

    /// Delete a record. The relational delete is the authoritative
    /// tombstone; secondary deletes are best-effort with the same retry
    /// policy as writes. Deleting an already-absent id succeeds — repeating
    /// a delete has the same effect as performing it once.
    pub async fn delete(&self, id: &str, group_id: &str) -> Result<WriteResult, LexError> {
        self.backends.guard()?;
        if id.trim().is_empty() {
            return Err(LexError::Validation("record id is required".to_string()));
        }

        let existed = self.backends.relational.delete(id).await?;
        if !existed {
            tracing::debug!(id, "delete of absent record treated as no-op");
        }

        let (vector, graph) = self
            .dispatch_secondary_delete(id.to_string(), group_id.to_string())
            .await;
        Ok(WriteResult {
            id: id.to_string(),
            status: WriteStatus {
                relational: StoreWriteState::Committed,
                vector,
                graph,
            },
        })
    }

    /// Fetch the authoritative row.
    pub async fn get(&self, id: &str) -> Result<CanonicalRecord, LexError> {
        self.backends.guard()?;
        self.backends
            .relational
            .get(id)
            .await?
            .ok_or_else(|| LexError::NotFound(id.to_string()))
    }

    /// Enumerate a group's records chronologically from the authoritative
    /// store, optionally narrowed to one kind, with offset paging.
    pub async fn list(
        &self,
        group_id: &str,
        kind: Option<RecordKind>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalRecord>, LexError> {
        self.backends.guard()?;
        self.backends
            .relational
            .list(group_id, kind, limit, offset)
            .await
    }

    /// Run the secondary upsert fan-out on a detached task.
    ///
    /// The spawn is what survives caller cancellation: once the relational
    /// commit has returned durable, dropping the request future must not
    /// strand the projections, so the propagation runs to completion (or to
    /// its timeout and the retry queue) regardless.
    async fn dispatch_secondary(
        &self,
        record: CanonicalRecord,
    ) -> (StoreWriteState, StoreWriteState) {
        let backends = self.backends.clone();
        let retry = self.retry.clone();
        let bound = self.secondary_timeout;
        let handle =
            tokio::spawn(async move { secondary_upsert(&backends, &retry, &record, bound).await });
        match handle.await {
            Ok(states) => states,
            Err(e) => {
                tracing::error!(error = %e, "secondary dispatch task failed");
                (StoreWriteState::Failed, StoreWriteState::Failed)
            }
        }
    }

    async fn dispatch_secondary_delete(
        &self,
        id: String,
        group_id: String,
    ) -> (StoreWriteState, StoreWriteState) {
        let backends = self.backends.clone();
        let retry = self.retry.clone();
        let bound = self.secondary_timeout;
        let handle =
            tokio::spawn(
                async move { secondary_delete(&backends, &retry, &id, &group_id, bound).await },
            );
        match handle.await {
            Ok(states) => states,
            Err(e) => {
                tracing::error!(error = %e, "secondary delete task failed");
                (StoreWriteState::Failed, StoreWriteState::Failed)
            }
        }
    }

    /// Replay every due retry task once. Returns how many tasks were taken.
    ///
    /// Called periodically by the background worker; tests call it directly
    /// to drain the queue deterministically.
    pub async fn process_due_retries(&self) -> usize {
        let due = self.retry.take_due(Instant::now());
        let taken = due.len();
        for task in due {
            self.replay(task).await;
        }
        taken
    }

    async fn replay(&self, task: RetryTask) {
        let outcome = match task.op {
            RetryOp::Delete => match task.store {
                StoreKind::Vector => self.backends.vector.delete(&task.record_id).await,
                StoreKind::Graph => self.backends.graph.delete(&task.record_id).await,
                StoreKind::Relational => return,
            },
            RetryOp::Upsert => {
                let record = match self.backends.relational.get(&task.record_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        // Deleted while the retry was queued; nothing to project.
                        tracing::debug!(id = %task.record_id, "dropping retry for deleted record");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(id = %task.record_id, error = %e, "retry source read failed");
                        self.retry.reschedule(task);
                        return;
                    }
                };
                match task.store {
                    StoreKind::Vector => match self.backends.embedder.embed(&record.embedding_text()).await {
                        Ok(embedding) => self.backends.vector.upsert(&record, &embedding).await,
                        Err(e) => Err(e),
                    },
                    StoreKind::Graph => self.backends.graph.upsert(&record).await,
                    StoreKind::Relational => return,
                }
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    store = %task.store,
                    id = %task.record_id,
                    attempt = task.attempt,
                    "secondary-store retry succeeded"
                );
            }
            Err(e) => {
                tracing::warn!(
                    store = %task.store,
                    id = %task.record_id,
                    attempt = task.attempt,
                    error = %e,
                    "secondary-store retry failed"
                );
                self.retry.reschedule(task);
            }
        }
    }
}

/// Spawn the background worker that drains the retry queue forever.
pub fn spawn_retry_worker(
    coordinator: Arc<WriteCoordinator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            coordinator.process_due_retries().await;
        }
    })
}

async fn secondary_upsert(
    backends: &Backends,
    retry: &RetryQueue,
    record: &CanonicalRecord,
    bound: Duration,
) -> (StoreWriteState, StoreWriteState) {
    let vector_fut = async {
        let embedding = backends.embedder.embed(&record.embedding_text()).await?;
        backends.vector.upsert(record, &embedding).await
    };
    let graph_fut = backends.graph.upsert(record);

    let (vector, graph) = tokio::join!(timeout(bound, vector_fut), timeout(bound, graph_fut));
    (
        settle(
            retry,
            StoreKind::Vector,
            RetryOp::Upsert,
            record,
            bound,
            vector,
        ),
        settle(
            retry,
            StoreKind::Graph,
            RetryOp::Upsert,
            record,
            bound,
            graph,
        ),
    )
}

async fn secondary_delete(
    backends: &Backends,
    retry: &RetryQueue,
    id: &str,
    group_id: &str,
    bound: Duration,
) -> (StoreWriteState, StoreWriteState) {
    let (vector, graph) = tokio::join!(
        timeout(bound, backends.vector.delete(id)),
        timeout(bound, backends.graph.delete(id))
    );
    let settle_delete = |store: StoreKind, outcome: Result<Result<(), LexError>, _>| match outcome {
        Ok(Ok(())) => StoreWriteState::Committed,
        Ok(Err(e)) => {
            tracing::warn!(store = %store, id, error = %e, "secondary delete failed; queued for retry");
            retry.enqueue(store, RetryOp::Delete, id, group_id);
            StoreWriteState::Failed
        }
        Err(_) => {
            tracing::warn!(store = %store, id, timeout_ms = bound.as_millis() as u64, "secondary delete timed out; queued for retry");
            retry.enqueue(store, RetryOp::Delete, id, group_id);
            StoreWriteState::Failed
        }
    };
    (
        settle_delete(StoreKind::Vector, vector),
        settle_delete(StoreKind::Graph, graph),
    )
}

fn settle(
    retry: &RetryQueue,
    store: StoreKind,
    op: RetryOp,
    record: &CanonicalRecord,
    bound: Duration,
    outcome: Result<Result<(), LexError>, tokio::time::error::Elapsed>,
) -> StoreWriteState {
    match outcome {
        Ok(Ok(())) => StoreWriteState::Committed,
        Ok(Err(e)) => {
            tracing::warn!(
                store = %store,
                id = %record.id,
                error = %e,
                "secondary write failed; primary commit stands, queued for retry"
            );
            retry.enqueue(store, op, &record.id, &record.group_id);
            StoreWriteState::Failed
        }
        Err(_) => {
            tracing::warn!(
                store = %store,
                id = %record.id,
                timeout_ms = bound.as_millis() as u64,
                "secondary write timed out; primary commit stands, queued for retry"
            );
            retry.enqueue(store, op, &record.id, &record.group_id);
            StoreWriteState::Failed
        }
    }
}

fn parse_date(raw: Option<&str>) -> Result<Option<NaiveDate>, LexError> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| LexError::Validation(format!("invalid date '{raw}', expected YYYY-MM-DD")))
}

fn group_or_default(raw: Option<String>) -> String {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

fn none_if_blank(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
