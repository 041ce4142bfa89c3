//! HTTP surface over the coordination core.
//!
//! Thin handlers: deserialize, call the coordinator or search engine, wrap
//! the outcome. Every error leaves through one envelope shape so callers
//! can dispatch on `error_type` without parsing prose.

use std::str::FromStr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::coordinator::WriteCoordinator;
use crate::courtlistener::{CourtListenerClient, DocketQuery, OpinionQuery};
use crate::error::LexError;
use crate::lifecycle::Backends;
use crate::record::{NewRecord, RecordKind, RecordPatch, WriteResult};
use crate::search::{SearchEngine, SearchMode};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub backends: Arc<Backends>,
    pub coordinator: Arc<WriteCoordinator>,
    pub search: Arc<SearchEngine>,
    pub courtlistener: Arc<CourtListenerClient>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/records",
            post(create_record_handler).get(list_records_handler),
        )
        .route(
            "/records/{id}",
            get(get_record_handler)
                .patch(update_record_handler)
                .delete(delete_record_handler),
        )
        .route("/search", get(search_handler))
        .route("/opinions/search", get(opinion_search_handler))
        .route("/opinions/citing", get(citing_opinions_handler))
        .route("/opinions/{id}/import", post(opinion_import_handler))
        .route("/dockets/search", get(docket_search_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Uniform error envelope. `detail` is present only when there is one.
impl IntoResponse for LexError {
    fn into_response(self) -> Response {
        let status = match &self {
            LexError::Validation(_) | LexError::Serialization(_) => StatusCode::BAD_REQUEST,
            LexError::NotFound(_) => StatusCode::NOT_FOUND,
            LexError::ExternalApiAuth(_) => StatusCode::UNAUTHORIZED,
            LexError::ExternalApiRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            LexError::ExternalApiBadRequest(_) => StatusCode::BAD_REQUEST,
            LexError::ExternalApiServerError(_) => StatusCode::BAD_GATEWAY,
            LexError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            LexError::StoreUnavailable { .. }
            | LexError::PartialWrite { .. }
            | LexError::Closed
            | LexError::NotReady
            | LexError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "status": "error",
            "error_type": self.error_type(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

fn write_response(result: WriteResult) -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "success",
        "state": result.state(),
        "id": result.id,
        "stores": result.status,
    }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state
        .backends
        .health(
            state.coordinator.retry_stats(),
            &state.coordinator.retry_pending_for(),
        )
        .await;
    axum::Json(report)
}

async fn create_record_handler(
    State(state): State<AppState>,
    axum::Json(input): axum::Json<NewRecord>,
) -> Result<impl IntoResponse, LexError> {
    let result = state.coordinator.create(input).await?;
    Ok((StatusCode::CREATED, write_response(result)))
}

#[derive(Deserialize)]
struct ListParams {
    group_id: Option<String>,
    kind: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_records_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, LexError> {
    let group_id = params.group_id.as_deref().unwrap_or("default");
    let kind = params
        .kind
        .as_deref()
        .map(|raw| {
            RecordKind::from_db_value(raw)
                .ok_or_else(|| LexError::Validation(format!("unknown record kind '{raw}'")))
        })
        .transpose()?;
    let limit = params.limit.unwrap_or(50).min(500);
    let offset = params.offset.unwrap_or(0);
    let records = state.coordinator.list(group_id, kind, limit, offset).await?;
    Ok(axum::Json(json!({
        "status": "success",
        "count": records.len(),
        "records": records,
    })))
}

async fn get_record_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, LexError> {
    let record = state.coordinator.get(&id).await?;
    Ok(axum::Json(json!({ "status": "success", "record": record })))
}

async fn update_record_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Json(patch): axum::Json<RecordPatch>,
) -> Result<impl IntoResponse, LexError> {
    let result = state.coordinator.update(&id, patch).await?;
    Ok(write_response(result))
}

#[derive(Deserialize)]
struct DeleteParams {
    group_id: Option<String>,
}

async fn delete_record_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, LexError> {
    let group_id = params.group_id.as_deref().unwrap_or("default");
    let result = state.coordinator.delete(&id, group_id).await?;
    Ok(write_response(result))
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    mode: Option<String>,
    group_id: Option<String>,
    limit: Option<usize>,
}

async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, LexError> {
    let mode = SearchMode::from_str(params.mode.as_deref().unwrap_or("all"))?;
    let group_id = params.group_id.as_deref().unwrap_or("default");
    let limit = params.limit.unwrap_or(10).min(100);
    let results = state
        .search
        .search(&params.query, mode, group_id, limit)
        .await?;
    Ok(axum::Json(json!({
        "status": "success",
        "count": results.len(),
        "results": results,
    })))
}

#[derive(Deserialize)]
struct OpinionSearchParams {
    query: String,
    court: Option<String>,
    filed_after: Option<String>,
    filed_before: Option<String>,
    cited_gt: Option<u32>,
    limit: Option<usize>,
}

async fn opinion_search_handler(
    State(state): State<AppState>,
    Query(params): Query<OpinionSearchParams>,
) -> Result<impl IntoResponse, LexError> {
    let opinions = state
        .courtlistener
        .search_opinions(&OpinionQuery {
            query: params.query,
            court: params.court,
            filed_after: params.filed_after,
            filed_before: params.filed_before,
            cited_gt: params.cited_gt,
            limit: params.limit,
        })
        .await?;
    Ok(axum::Json(json!({
        "status": "success",
        "count": opinions.len(),
        "results": opinions,
    })))
}

#[derive(Deserialize)]
struct CitingParams {
    citation: String,
    limit: Option<usize>,
}

async fn citing_opinions_handler(
    State(state): State<AppState>,
    Query(params): Query<CitingParams>,
) -> Result<impl IntoResponse, LexError> {
    let opinions = state
        .courtlistener
        .citing_opinions(&params.citation, params.limit.unwrap_or(20))
        .await?;
    Ok(axum::Json(json!({
        "status": "success",
        "count": opinions.len(),
        "results": opinions,
    })))
}

#[derive(Deserialize)]
struct OpinionImportParams {
    group_id: Option<String>,
    #[serde(default)]
    tags: Option<serde_json::Value>,
}

/// Fetch one opinion upstream and write it through the coordinator as a
/// research snippet, so imported material gets the same three-store
/// propagation and status reporting as locally-authored records.
async fn opinion_import_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    axum::Json(params): axum::Json<OpinionImportParams>,
) -> Result<impl IntoResponse, LexError> {
    let opinion = state.courtlistener.get_opinion(id).await?;

    let case_name = opinion
        .get("case_name")
        .or_else(|| opinion.get("caseName"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("Unknown Case");
    let excerpt = opinion
        .get("plain_text")
        .and_then(serde_json::Value::as_str)
        .map(|text| text.chars().take(2000).collect::<String>());
    let url = opinion
        .get("absolute_url")
        .and_then(serde_json::Value::as_str)
        .map(|path| format!("https://www.courtlistener.com{path}"));

    let result = state
        .coordinator
        .create(NewRecord {
            group_id: params.group_id,
            kind: RecordKind::Snippet,
            description: format!("Imported opinion: {case_name}"),
            tags: params.tags,
            document_source: url,
            excerpts: excerpt,
            ..NewRecord::default()
        })
        .await?;
    Ok((StatusCode::CREATED, write_response(result)))
}

#[derive(Deserialize)]
struct DocketSearchParams {
    case_name: Option<String>,
    docket_number: Option<String>,
    court: Option<String>,
    filed_after: Option<String>,
    filed_before: Option<String>,
    limit: Option<usize>,
}

async fn docket_search_handler(
    State(state): State<AppState>,
    Query(params): Query<DocketSearchParams>,
) -> Result<impl IntoResponse, LexError> {
    let dockets = state
        .courtlistener
        .search_dockets(&DocketQuery {
            case_name: params.case_name,
            docket_number: params.docket_number,
            court: params.court,
            filed_after: params.filed_after,
            filed_before: params.filed_before,
            limit: params.limit,
        })
        .await?;
    Ok(axum::Json(json!({
        "status": "success",
        "count": dockets.len(),
        "results": dockets,
    })))
}
