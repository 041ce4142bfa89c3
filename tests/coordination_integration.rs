//! End-to-end integration tests for the coordination core.
//!
//! These run the real coordinator, lifecycle manager, retry queue, and
//! search engine against the fault-injecting in-memory store adapters:
//! - create → search round trip across all three stores
//! - partial failure: secondary outage degrades, retries, then converges
//! - idempotent deletes
//! - fused ranking across stores
//! - health surface reflecting outages and pending retries
//! - unconfigured external API classification

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use lexgrid::config::BackoffConfig;
use lexgrid::coordinator::WriteCoordinator;
use lexgrid::courtlistener::{CourtListenerClient, OpinionQuery};
use lexgrid::embedding::HashEmbeddingProvider;
use lexgrid::error::LexError;
use lexgrid::lifecycle::{BackendHealth, Backends, ServiceState};
use lexgrid::record::{NewRecord, StoreWriteState};
use lexgrid::retry::{BackoffPolicy, RetryQueue};
use lexgrid::search::{SearchEngine, SearchMode};
use lexgrid::store::StoreKind;
use lexgrid::store::memory::{MemoryGraph, MemoryRelational, MemoryVector};

struct Harness {
    relational: Arc<MemoryRelational>,
    vector: Arc<MemoryVector>,
    graph: Arc<MemoryGraph>,
    backends: Arc<Backends>,
    coordinator: Arc<WriteCoordinator>,
    search: SearchEngine,
}

async fn harness() -> Harness {
    let relational = Arc::new(MemoryRelational::new());
    let vector = Arc::new(MemoryVector::new());
    let graph = Arc::new(MemoryGraph::new());
    let backends = Arc::new(Backends::new(
        relational.clone(),
        vector.clone(),
        graph.clone(),
        Arc::new(HashEmbeddingProvider::default()),
        false,
    ));
    backends.init().await.expect("init");

    let retry = Arc::new(RetryQueue::new(BackoffPolicy::new(BackoffConfig {
        base_delay: Duration::from_millis(1),
        cap: Duration::from_millis(4),
        max_attempts: 4,
    })));
    let coordinator = Arc::new(WriteCoordinator::new(
        backends.clone(),
        retry,
        Duration::from_secs(1),
    ));
    let search = SearchEngine::new(backends.clone(), 60.0, Duration::from_secs(1));
    Harness {
        relational,
        vector,
        graph,
        backends,
        coordinator,
        search,
    }
}

fn event(group_id: &str, description: &str) -> NewRecord {
    NewRecord {
        group_id: Some(group_id.to_string()),
        date: Some("2024-01-01".to_string()),
        description: description.to_string(),
        parties: Some(serde_json::json!("A, B")),
        ..NewRecord::default()
    }
}

#[tokio::test]
async fn create_then_search_finds_the_record_in_its_group() {
    let h = harness().await;
    let created = h
        .coordinator
        .create(event("matter-1", "Lease signed"))
        .await
        .expect("create");
    assert_eq!(created.status.relational, StoreWriteState::Committed);
    assert_eq!(created.state(), "consistent");

    let results = h
        .search
        .search("Lease signed", SearchMode::All, "matter-1", 10)
        .await
        .expect("search");
    let hit = results
        .iter()
        .find(|r| r.id == created.id)
        .expect("created record is searchable");
    assert_eq!(hit.payload["group_id"], "matter-1");
    assert_eq!(
        hit.payload["parties"],
        serde_json::json!(["A", "B"]),
        "comma-string parties are canonicalized before storage"
    );
    assert_eq!(hit.contributing_stores.len(), 3);
}

#[tokio::test]
async fn secondary_outage_degrades_then_converges_after_recovery() {
    let h = harness().await;
    h.vector.set_down(true);

    let created = h
        .coordinator
        .create(event("matter-1", "Motion to dismiss filed"))
        .await
        .expect("create succeeds with vector down");
    assert_eq!(created.status.relational, StoreWriteState::Committed);
    assert_eq!(created.status.vector, StoreWriteState::Failed);
    assert_eq!(created.status.graph, StoreWriteState::Committed);
    assert_eq!(created.state(), "degraded");

    // The record is durable and searchable through the healthy stores.
    let results = h
        .search
        .search("motion dismiss", SearchMode::All, "matter-1", 10)
        .await
        .expect("degraded search");
    assert!(results.iter().any(|r| r.id == created.id));

    // Health shows the outage and the queued retry.
    let report = h
        .backends
        .health(
            h.coordinator.retry_stats(),
            &h.coordinator.retry_pending_for(),
        )
        .await;
    assert_eq!(report.vector, BackendHealth::Down);
    assert_eq!(report.retry.pending, 1);

    // Recovery: the retry worker path drains the queue and the vector
    // projection catches up without any caller involvement.
    h.vector.set_down(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.coordinator.process_due_retries().await;
    assert!(h.vector.contains(&created.id));
    assert_eq!(h.coordinator.retry_stats().pending, 0);

    let report = h
        .backends
        .health(
            h.coordinator.retry_stats(),
            &h.coordinator.retry_pending_for(),
        )
        .await;
    assert_eq!(report.vector, BackendHealth::Ready);
}

#[tokio::test]
async fn reachable_store_with_pending_retries_reports_degraded() {
    let h = harness().await;
    h.graph.fail_next(1);
    h.coordinator
        .create(event("matter-1", "Deposition scheduled"))
        .await
        .expect("create");

    // The graph store answers probes again but its projection lags.
    let report = h
        .backends
        .health(
            h.coordinator.retry_stats(),
            &h.coordinator.retry_pending_for(),
        )
        .await;
    assert_eq!(report.graph, BackendHealth::Degraded);
    assert_eq!(report.state, ServiceState::Ready);
}

#[tokio::test]
async fn delete_removes_all_projections_and_repeats_harmlessly() {
    let h = harness().await;
    let created = h
        .coordinator
        .create(event("matter-1", "Settlement conference"))
        .await
        .expect("create");
    assert!(h.vector.contains(&created.id));
    assert!(h.graph.contains(&created.id));

    let first = h
        .coordinator
        .delete(&created.id, "matter-1")
        .await
        .expect("delete");
    assert_eq!(first.status.relational, StoreWriteState::Committed);
    assert!(h.relational.is_empty());
    assert!(!h.vector.contains(&created.id));
    assert!(!h.graph.contains(&created.id));

    let second = h
        .coordinator
        .delete(&created.id, "matter-1")
        .await
        .expect("double delete succeeds");
    assert_eq!(second.status.relational, StoreWriteState::Committed);
}

#[tokio::test]
async fn fused_ranking_prefers_multi_store_agreement() {
    let h = harness().await;
    // Both records match "lease"; only the first also matches the richer
    // query text, so it ranks first across every store.
    let strong = h
        .coordinator
        .create(event("matter-1", "Lease agreement signed and notarized"))
        .await
        .expect("create");
    h.coordinator
        .create(event("matter-1", "Lease dispute letter"))
        .await
        .expect("create");

    let results = h
        .search
        .search(
            "lease agreement signed notarized",
            SearchMode::All,
            "matter-1",
            10,
        )
        .await
        .expect("search");
    assert!(results.len() >= 2);
    assert_eq!(results[0].id, strong.id);
    assert!(results[0].fused_score > results[1].fused_score);
}

#[tokio::test]
async fn search_modes_select_single_backends() {
    let h = harness().await;
    let created = h
        .coordinator
        .create(event("matter-1", "Expert witness retained"))
        .await
        .expect("create");

    let relational_only = h
        .search
        .search("expert witness", SearchMode::Relational, "matter-1", 10)
        .await
        .expect("search");
    let hit = relational_only
        .iter()
        .find(|r| r.id == created.id)
        .expect("hit");
    assert_eq!(hit.contributing_stores, vec![StoreKind::Relational]);
}

#[tokio::test]
async fn closed_service_fails_fast_everywhere() {
    let h = harness().await;
    h.backends.close().await;

    let err = h
        .coordinator
        .create(event("matter-1", "Late filing"))
        .await
        .expect_err("closed");
    assert!(matches!(err, LexError::Closed));

    let err = h
        .search
        .search("anything", SearchMode::All, "matter-1", 10)
        .await
        .expect_err("closed");
    assert!(matches!(err, LexError::Closed));
}

#[tokio::test]
async fn unconfigured_external_api_classifies_as_auth_error() {
    let h = harness().await;
    let client = CourtListenerClient::new(
        reqwest::Client::new(),
        "https://www.courtlistener.com/api/rest/v4",
        None,
        BackoffPolicy::new(BackoffConfig::default()),
        5,
        Duration::from_secs(30),
    );

    let err = client
        .search_opinions(&OpinionQuery {
            query: "zoning".to_string(),
            ..OpinionQuery::default()
        })
        .await
        .expect_err("auth classification");
    assert_eq!(err.error_type(), "external_api_auth_error");

    let report = h
        .backends
        .health(
            h.coordinator.retry_stats(),
            &h.coordinator.retry_pending_for(),
        )
        .await;
    assert_eq!(report.external_api, "unconfigured");
}
