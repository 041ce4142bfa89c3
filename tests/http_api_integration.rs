//! HTTP surface tests: a real Axum server on a random port, driven with a
//! plain HTTP client, backed by the in-memory store adapters.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use lexgrid::config::BackoffConfig;
use lexgrid::coordinator::WriteCoordinator;
use lexgrid::courtlistener::CourtListenerClient;
use lexgrid::embedding::HashEmbeddingProvider;
use lexgrid::lifecycle::Backends;
use lexgrid::retry::{BackoffPolicy, RetryQueue};
use lexgrid::search::SearchEngine;
use lexgrid::server::{AppState, router};
use lexgrid::store::memory::{MemoryGraph, MemoryRelational, MemoryVector};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    vector: Arc<MemoryVector>,
}

async fn start_server() -> TestServer {
    let relational = Arc::new(MemoryRelational::new());
    let vector = Arc::new(MemoryVector::new());
    let graph = Arc::new(MemoryGraph::new());
    let backends = Arc::new(Backends::new(
        relational,
        vector.clone(),
        graph,
        Arc::new(HashEmbeddingProvider::default()),
        false,
    ));
    backends.init().await.expect("init");

    let retry = Arc::new(RetryQueue::new(BackoffPolicy::new(BackoffConfig::default())));
    let coordinator = Arc::new(WriteCoordinator::new(
        backends.clone(),
        retry,
        Duration::from_secs(1),
    ));
    let search = Arc::new(SearchEngine::new(
        backends.clone(),
        60.0,
        Duration::from_secs(1),
    ));
    let courtlistener = Arc::new(CourtListenerClient::new(
        reqwest::Client::new(),
        "https://www.courtlistener.com/api/rest/v4",
        None,
        BackoffPolicy::new(BackoffConfig::default()),
        5,
        Duration::from_secs(30),
    ));

    let app = router(AppState {
        backends,
        coordinator,
        search,
        courtlistener,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        vector,
    }
}

#[tokio::test]
async fn record_lifecycle_over_http() {
    let server = start_server().await;

    let created: Value = server
        .client
        .post(format!("{}/records", server.base_url))
        .json(&serde_json::json!({
            "group_id": "matter-1",
            "date": "2024-01-01",
            "description": "Lease signed",
            "parties": "A, B"
        }))
        .send()
        .await
        .expect("create request")
        .json()
        .await
        .expect("create body");
    assert_eq!(created["status"], "success");
    assert_eq!(created["state"], "consistent");
    let id = created["id"].as_str().expect("id").to_string();

    let fetched: Value = server
        .client
        .get(format!("{}/records/{id}", server.base_url))
        .send()
        .await
        .expect("get request")
        .json()
        .await
        .expect("get body");
    assert_eq!(fetched["record"]["description"], "Lease signed");
    assert_eq!(fetched["record"]["parties"], serde_json::json!(["A", "B"]));

    let searched: Value = server
        .client
        .get(format!(
            "{}/search?query=lease+signed&group_id=matter-1",
            server.base_url
        ))
        .send()
        .await
        .expect("search request")
        .json()
        .await
        .expect("search body");
    assert!(searched["count"].as_u64().unwrap() >= 1);

    let deleted = server
        .client
        .delete(format!("{}/records/{id}?group_id=matter-1", server.base_url))
        .send()
        .await
        .expect("delete request");
    assert!(deleted.status().is_success());

    let missing = server
        .client
        .get(format!("{}/records/{id}", server.base_url))
        .send()
        .await
        .expect("get after delete");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let envelope: Value = missing.json().await.expect("error body");
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["error_type"], "not_found_error");
}

#[tokio::test]
async fn listing_is_group_scoped_filtered_and_paged() {
    let server = start_server().await;

    for (group, kind, date, description) in [
        ("matter-1", "event", "2024-02-01", "Notice served"),
        ("matter-1", "event", "2024-01-01", "Lease signed"),
        ("matter-1", "snippet", "2024-03-01", "Holding on habitability"),
        ("matter-2", "event", "2024-01-15", "Unrelated filing"),
    ] {
        let response = server
            .client
            .post(format!("{}/records", server.base_url))
            .json(&serde_json::json!({
                "group_id": group,
                "kind": kind,
                "date": date,
                "description": description,
            }))
            .send()
            .await
            .expect("create request");
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    }

    let listed: Value = server
        .client
        .get(format!("{}/records?group_id=matter-1", server.base_url))
        .send()
        .await
        .expect("list request")
        .json()
        .await
        .expect("list body");
    assert_eq!(listed["status"], "success");
    assert_eq!(listed["count"], 3);
    let records = listed["records"].as_array().expect("records array");
    assert_eq!(records[0]["description"], "Lease signed");
    assert_eq!(records[1]["description"], "Notice served");
    assert_eq!(records[2]["description"], "Holding on habitability");

    let events: Value = server
        .client
        .get(format!(
            "{}/records?group_id=matter-1&kind=event",
            server.base_url
        ))
        .send()
        .await
        .expect("filtered list request")
        .json()
        .await
        .expect("filtered list body");
    assert_eq!(events["count"], 2);

    let page: Value = server
        .client
        .get(format!(
            "{}/records?group_id=matter-1&limit=1&offset=1",
            server.base_url
        ))
        .send()
        .await
        .expect("paged list request")
        .json()
        .await
        .expect("paged list body");
    assert_eq!(page["count"], 1);
    assert_eq!(page["records"][0]["description"], "Notice served");

    let bad_kind = server
        .client
        .get(format!("{}/records?kind=memo", server.base_url))
        .send()
        .await
        .expect("bad kind request");
    assert_eq!(bad_kind.status(), reqwest::StatusCode::BAD_REQUEST);
    let envelope: Value = bad_kind.json().await.expect("error body");
    assert_eq!(envelope["error_type"], "validation_error");
}

#[tokio::test]
async fn degraded_write_is_visible_in_the_response_and_health() {
    let server = start_server().await;
    server.vector.set_down(true);

    let created: Value = server
        .client
        .post(format!("{}/records", server.base_url))
        .json(&serde_json::json!({ "description": "Motion filed" }))
        .send()
        .await
        .expect("create request")
        .json()
        .await
        .expect("create body");
    assert_eq!(created["status"], "success");
    assert_eq!(created["state"], "degraded");
    assert_eq!(created["stores"]["vector"], "failed");
    assert_eq!(created["stores"]["relational"], "committed");

    let health: Value = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body");
    assert_eq!(health["vector"], "down");
    assert_eq!(health["external_api"], "unconfigured");
    assert!(health["retry"]["pending"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn invalid_inputs_map_to_the_error_envelope() {
    let server = start_server().await;

    let response = server
        .client
        .post(format!("{}/records", server.base_url))
        .json(&serde_json::json!({ "description": "  " }))
        .send()
        .await
        .expect("create request");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let envelope: Value = response.json().await.expect("body");
    assert_eq!(envelope["error_type"], "validation_error");

    let response = server
        .client
        .get(format!(
            "{}/search?query=lease&mode=keyword",
            server.base_url
        ))
        .send()
        .await
        .expect("search request");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = server
        .client
        .get(format!("{}/opinions/search?query=zoning", server.base_url))
        .send()
        .await
        .expect("opinion search request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let envelope: Value = response.json().await.expect("body");
    assert_eq!(envelope["error_type"], "external_api_auth_error");
}
