//! Resilient CourtListener API client.
//!
//! Opinion and docket search against the v4 REST API. The resilience
//! contract lives here, not at call sites: parameters are validated before
//! any request is built, HTTP outcomes are classified into the crate's
//! error taxonomy instead of leaking status codes, rate-limit and
//! server-error responses are retried on the shared backoff schedule, and a
//! circuit breaker short-circuits calls after a run of consecutive failures
//! so an unavailable upstream is not hammered.

use std::sync::Mutex;
use std::time::Instant;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;

use crate::error::LexError;
use crate::retry::BackoffPolicy;

/// Opinion search parameters. `query` is required; the rest narrow it.
#[derive(Debug, Clone, Default)]
pub struct OpinionQuery {
    pub query: String,
    pub court: Option<String>,
    pub filed_after: Option<String>,
    pub filed_before: Option<String>,
    pub cited_gt: Option<u32>,
    pub limit: Option<usize>,
}

/// Docket search parameters; at least one of `case_name` or `docket_number`
/// must be present.
#[derive(Debug, Clone, Default)]
pub struct DocketQuery {
    pub case_name: Option<String>,
    pub docket_number: Option<String>,
    pub court: Option<String>,
    pub filed_after: Option<String>,
    pub filed_before: Option<String>,
    pub limit: Option<usize>,
}

/// One normalized opinion search result.
#[derive(Debug, Clone, Serialize)]
pub struct Opinion {
    pub id: Value,
    pub case_name: Option<String>,
    pub court: Option<String>,
    pub date_filed: Option<String>,
    pub citation_count: Option<u64>,
    pub snippet: Option<String>,
    pub absolute_url: Option<String>,
}

/// One normalized docket search result.
#[derive(Debug, Clone, Serialize)]
pub struct Docket {
    pub id: Value,
    pub case_name: Option<String>,
    pub docket_number: Option<String>,
    pub court: Option<String>,
    pub date_filed: Option<String>,
    pub absolute_url: Option<String>,
}

enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
}

/// Consecutive-failure circuit breaker with a fixed cooldown.
struct CircuitBreaker {
    state: Mutex<CircuitState>,
    failure_threshold: u32,
    cooldown: std::time::Duration,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, cooldown: std::time::Duration) -> Self {
        Self {
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Err while the cooldown window is still running.
    fn check(&self) -> Result<(), LexError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let CircuitState::Open { until } = *state {
            if Instant::now() < until {
                return Err(LexError::ExternalApiServerError(
                    "circuit open: upstream marked unavailable, retry after cooldown".to_string(),
                ));
            }
            // Cooldown elapsed; allow one probe through.
            *state = CircuitState::Closed {
                consecutive_failures: self.failure_threshold - 1,
            };
        }
        Ok(())
    }

    fn record_success(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let failures = match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => consecutive_failures + 1,
            CircuitState::Open { .. } => return,
        };
        if failures >= self.failure_threshold {
            tracing::warn!(
                failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "external API circuit opened"
            );
            *state = CircuitState::Open {
                until: Instant::now() + self.cooldown,
            };
        } else {
            *state = CircuitState::Closed {
                consecutive_failures: failures,
            };
        }
    }
}

/// CourtListener v4 client. Construct once and share.
pub struct CourtListenerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    backoff: BackoffPolicy,
    circuit: CircuitBreaker,
}

impl CourtListenerClient {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<SecretString>,
        backoff: BackoffPolicy,
        circuit_failure_threshold: u32,
        circuit_cooldown: std::time::Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            backoff,
            circuit: CircuitBreaker::new(circuit_failure_threshold, circuit_cooldown),
        }
    }

    pub fn configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Search opinions. Requires a credential and a non-empty query; both
    /// fail locally, before any request leaves the process.
    pub async fn search_opinions(&self, params: &OpinionQuery) -> Result<Vec<Opinion>, LexError> {
        self.require_credential("search_opinions")?;
        let query = params.query.trim();
        if query.is_empty() {
            return Err(LexError::Validation(
                "opinion search requires a query".to_string(),
            ));
        }

        let mut pairs: Vec<(&str, String)> = vec![("q", query.to_string()), ("type", "o".into())];
        if let Some(court) = params.court.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            pairs.push(("court", court.to_string()));
        }
        if let Some(after) = &params.filed_after {
            pairs.push(("filed_after", after.clone()));
        }
        if let Some(before) = &params.filed_before {
            pairs.push(("filed_before", before.clone()));
        }
        if let Some(cited_gt) = params.cited_gt {
            pairs.push(("cited_gt", cited_gt.to_string()));
        }

        let body = self.get_json("/search/", &pairs).await?;
        let limit = params.limit.unwrap_or(20);
        Ok(results_array(&body)
            .iter()
            .take(limit)
            .map(normalize_opinion)
            .collect())
    }

    /// Fetch a single opinion by id, for import into the record stores.
    pub async fn get_opinion(&self, opinion_id: u64) -> Result<Value, LexError> {
        self.require_credential("get_opinion")?;
        self.get_json(&format!("/opinions/{opinion_id}/"), &[]).await
    }

    /// Search dockets. At least one identifying parameter is required.
    pub async fn search_dockets(&self, params: &DocketQuery) -> Result<Vec<Docket>, LexError> {
        self.require_credential("search_dockets")?;
        let case_name = params.case_name.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let docket_number = params
            .docket_number
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if case_name.is_none() && docket_number.is_none() {
            return Err(LexError::Validation(
                "docket search requires case_name or docket_number".to_string(),
            ));
        }

        let mut query_parts = Vec::new();
        if let Some(name) = case_name {
            query_parts.push(format!("case_name:\"{name}\""));
        }
        if let Some(number) = docket_number {
            query_parts.push(format!("docket_number:\"{number}\""));
        }

        let mut pairs: Vec<(&str, String)> =
            vec![("q", query_parts.join(" AND ")), ("type", "r".into())];
        if let Some(court) = params.court.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            pairs.push(("court", court.to_string()));
        }
        if let Some(after) = &params.filed_after {
            pairs.push(("date_filed__gte", after.clone()));
        }
        if let Some(before) = &params.filed_before {
            pairs.push(("date_filed__lte", before.clone()));
        }

        let body = self.get_json("/search/", &pairs).await?;
        let limit = params.limit.unwrap_or(20);
        Ok(results_array(&body)
            .iter()
            .take(limit)
            .map(normalize_docket)
            .collect())
    }

    /// Opinions that cite the given citation string.
    pub async fn citing_opinions(
        &self,
        citation: &str,
        limit: usize,
    ) -> Result<Vec<Opinion>, LexError> {
        self.require_credential("citing_opinions")?;
        let citation = citation.trim();
        if citation.is_empty() {
            return Err(LexError::Validation(
                "citing search requires a citation".to_string(),
            ));
        }

        let pairs: Vec<(&str, String)> = vec![
            ("q", format!("cites:(\"{citation}\")")),
            ("type", "o".into()),
        ];
        let body = self.get_json("/search/", &pairs).await?;
        Ok(results_array(&body)
            .iter()
            .take(limit.max(1))
            .map(normalize_opinion)
            .collect())
    }

    /// One cheap authenticated round-trip, used by startup diagnostics.
    pub async fn test_connection(&self) -> Result<(), LexError> {
        self.require_credential("test_connection")?;
        self.get_json("/courts/", &[("page_size", "1".to_string())])
            .await
            .map(|_| ())
    }

    fn require_credential(&self, operation: &str) -> Result<(), LexError> {
        if self.api_key.is_none() {
            return Err(LexError::ExternalApiAuth(format!(
                "{operation} requires a CourtListener API key; none is configured"
            )));
        }
        Ok(())
    }

    /// GET with classification, bounded retries, and the circuit breaker.
    ///
    /// Only rate-limit and server-error outcomes are retried; auth and
    /// bad-request classifications are returned immediately since repeating
    /// the identical request cannot change them.
    async fn get_json(&self, path: &str, pairs: &[(&str, String)]) -> Result<Value, LexError> {
        self.circuit.check()?;

        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 1u32;
        loop {
            match self.send_once(&url, pairs).await {
                Ok(body) => {
                    self.circuit.record_success();
                    return Ok(body);
                }
                Err(e) if e.is_retryable() => {
                    self.circuit.record_failure();
                    match self.backoff.jittered_delay_for(attempt) {
                        Some(delay) => {
                            tracing::warn!(
                                url = %url,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "external API call failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => {
                    // Terminal classification: not the upstream's health.
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(&self, url: &str, pairs: &[(&str, String)]) -> Result<Value, LexError> {
        let mut request = self.client.get(url).query(pairs);
        if let Some(key) = &self.api_key {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", key.expose_secret()),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| LexError::ExternalApiServerError(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                LexError::ExternalApiServerError(format!("response decode failed: {e}"))
            });
        }

        let detail = response.text().await.unwrap_or_default();
        let detail = if detail.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {}", truncate(&detail, 300))
        };
        Err(classify_status(status, detail))
    }
}

fn classify_status(status: reqwest::StatusCode, detail: String) -> LexError {
    use reqwest::StatusCode;
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LexError::ExternalApiAuth(detail),
        StatusCode::TOO_MANY_REQUESTS => LexError::ExternalApiRateLimited(detail),
        s if s.is_client_error() => LexError::ExternalApiBadRequest(detail),
        _ => LexError::ExternalApiServerError(detail),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn results_array(body: &Value) -> Vec<Value> {
    body.get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn normalize_opinion(result: &Value) -> Opinion {
    Opinion {
        id: result.get("id").cloned().unwrap_or(Value::Null),
        // v4 search results use camelCase; detail endpoints use snake_case.
        case_name: string_field(result, &["caseName", "case_name"]),
        court: string_field(result, &["court", "court_id"]),
        date_filed: string_field(result, &["dateFiled", "date_filed"]),
        citation_count: result
            .get("citeCount")
            .or_else(|| result.get("citation_count"))
            .and_then(Value::as_u64),
        snippet: string_field(result, &["snippet"]),
        absolute_url: string_field(result, &["absolute_url"])
            .map(|path| format!("https://www.courtlistener.com{path}")),
    }
}

fn normalize_docket(result: &Value) -> Docket {
    Docket {
        id: result.get("id").cloned().unwrap_or(Value::Null),
        case_name: string_field(result, &["caseName", "case_name"]),
        docket_number: string_field(result, &["docketNumber", "docket_number"]),
        court: string_field(result, &["court", "court_id"]),
        date_filed: string_field(result, &["dateFiled", "date_filed"]),
        absolute_url: string_field(result, &["absolute_url"])
            .map(|path| format!("https://www.courtlistener.com{path}")),
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use std::time::Duration;

    fn unconfigured_client() -> CourtListenerClient {
        CourtListenerClient::new(
            reqwest::Client::new(),
            "https://www.courtlistener.com/api/rest/v4",
            None,
            BackoffPolicy::new(BackoffConfig::default()),
            5,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn missing_credential_is_an_auth_error_without_network_io() {
        let client = unconfigured_client();
        assert!(!client.configured());
        let err = client
            .search_opinions(&OpinionQuery {
                query: "zoning".to_string(),
                ..OpinionQuery::default()
            })
            .await
            .expect_err("auth error");
        assert!(matches!(err, LexError::ExternalApiAuth(_)));
        assert_eq!(err.error_type(), "external_api_auth_error");
    }

    #[tokio::test]
    async fn empty_query_fails_locally() {
        let client = CourtListenerClient::new(
            reqwest::Client::new(),
            "https://www.courtlistener.com/api/rest/v4",
            Some(SecretString::from("test-key")),
            BackoffPolicy::new(BackoffConfig::default()),
            5,
            Duration::from_secs(30),
        );
        let err = client
            .search_opinions(&OpinionQuery::default())
            .await
            .expect_err("validation");
        assert!(matches!(err, LexError::Validation(_)));
    }

    #[tokio::test]
    async fn docket_search_requires_an_identifying_parameter() {
        let client = CourtListenerClient::new(
            reqwest::Client::new(),
            "https://www.courtlistener.com/api/rest/v4",
            Some(SecretString::from("test-key")),
            BackoffPolicy::new(BackoffConfig::default()),
            5,
            Duration::from_secs(30),
        );
        let err = client
            .search_dockets(&DocketQuery::default())
            .await
            .expect_err("validation");
        assert!(matches!(err, LexError::Validation(_)));
    }

    #[tokio::test]
    async fn citing_search_requires_a_citation() {
        let client = CourtListenerClient::new(
            reqwest::Client::new(),
            "https://www.courtlistener.com/api/rest/v4",
            Some(SecretString::from("test-key")),
            BackoffPolicy::new(BackoffConfig::default()),
            5,
            Duration::from_secs(30),
        );
        let err = client
            .citing_opinions("  ", 10)
            .await
            .expect_err("validation");
        assert!(matches!(err, LexError::Validation(_)));
    }

    #[test]
    fn status_classification_matches_the_taxonomy() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "x".into()),
            LexError::ExternalApiAuth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "x".into()),
            LexError::ExternalApiAuth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "x".into()),
            LexError::ExternalApiRateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "x".into()),
            LexError::ExternalApiBadRequest(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "x".into()),
            LexError::ExternalApiServerError(_)
        ));
    }

    #[test]
    fn only_rate_limit_and_server_errors_retry() {
        use reqwest::StatusCode;
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "x".into()).is_retryable());
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "x".into()).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "x".into()).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "x".into()).is_retryable());
    }

    #[test]
    fn circuit_opens_after_threshold_and_reprobes_after_cooldown() {
        let circuit = CircuitBreaker::new(3, Duration::from_millis(5));
        for _ in 0..3 {
            circuit.check().expect("closed");
            circuit.record_failure();
        }
        assert!(circuit.check().is_err());

        std::thread::sleep(Duration::from_millis(10));
        // One probe is allowed through after the cooldown.
        circuit.check().expect("half-open probe");
        circuit.record_success();
        circuit.check().expect("closed again");
    }

    #[test]
    fn opinion_normalization_handles_both_field_spellings() {
        let camel = serde_json::json!({
            "id": 1,
            "caseName": "Smith v. Jones",
            "dateFiled": "2023-05-01",
            "citeCount": 12,
            "absolute_url": "/opinion/1/smith-v-jones/"
        });
        let opinion = normalize_opinion(&camel);
        assert_eq!(opinion.case_name.as_deref(), Some("Smith v. Jones"));
        assert_eq!(opinion.citation_count, Some(12));
        assert_eq!(
            opinion.absolute_url.as_deref(),
            Some("https://www.courtlistener.com/opinion/1/smith-v-jones/")
        );

        let snake = serde_json::json!({"id": 2, "case_name": "Doe v. Roe"});
        assert_eq!(
            normalize_opinion(&snake).case_name.as_deref(),
            Some("Doe v. Roe")
        );
    }
}
