//! Error taxonomy shared across the coordination core.
//!
//! Every operation surfaces one of these kinds; the service layer maps them
//! to the uniform `{status:"error", error_type, message, detail?}` envelope.
//! Partial writes are deliberately *not* an error: the primary commit stands
//! and the degraded projections are reported as status metadata on the
//! [`WriteResult`](crate::record::WriteResult).

use thiserror::Error;

use crate::store::StoreKind;

/// Top-level error for record coordination, search, and external lookups.
#[derive(Debug, Error)]
pub enum LexError {
    /// Bad or missing input. Raised before any store is contacted.
    #[error("validation error: {0}")]
    Validation(String),

    /// A backend is unreachable or rejected the operation outright.
    #[error("{store} store unavailable: {message}")]
    StoreUnavailable { store: StoreKind, message: String },

    /// Primary committed but one or more secondary projections failed.
    ///
    /// The coordinator never returns this from its own operations (partial
    /// writes come back as `WriteResult` status detail); it exists for
    /// callers that choose to escalate a degraded result themselves.
    #[error("partial write for record {id}: {detail}")]
    PartialWrite { id: String, detail: String },

    /// The id is absent from the authoritative relational store.
    #[error("record {0} not found")]
    NotFound(String),

    /// External legal-data API credential missing or rejected.
    #[error("external API auth error: {0}")]
    ExternalApiAuth(String),

    /// External legal-data API asked us to back off.
    #[error("external API rate limited: {0}")]
    ExternalApiRateLimited(String),

    /// External legal-data API rejected the request; retrying cannot help.
    #[error("external API bad request: {0}")]
    ExternalApiBadRequest(String),

    /// External legal-data API failed server-side (or the circuit is open).
    #[error("external API server error: {0}")]
    ExternalApiServerError(String),

    /// A fan-out or secondary dispatch exceeded its bound.
    #[error("{store} operation timed out after {timeout_ms}ms")]
    Timeout { store: StoreKind, timeout_ms: u64 },

    /// The lifecycle manager has shut down; fail fast.
    #[error("service is closed")]
    Closed,

    /// Request arrived before eager initialization completed.
    #[error("service is not initialized")]
    NotReady,

    /// Connection pool acquisition or construction failed.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Row or payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LexError {
    /// Stable machine-readable kind for the error envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::StoreUnavailable { .. } => "store_unavailable_error",
            Self::PartialWrite { .. } => "partial_write_error",
            Self::NotFound(_) => "not_found_error",
            Self::ExternalApiAuth(_) => "external_api_auth_error",
            Self::ExternalApiRateLimited(_) => "external_api_rate_limited",
            Self::ExternalApiBadRequest(_) => "external_api_bad_request",
            Self::ExternalApiServerError(_) => "external_api_server_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Closed => "service_closed",
            Self::NotReady => "service_not_ready",
            Self::Pool(_) => "pool_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::Timeout { .. }
                | Self::Pool(_)
                | Self::ExternalApiRateLimited(_)
                | Self::ExternalApiServerError(_)
        )
    }
}

/// Configuration loading errors, kept separate from runtime errors so that
/// startup failures read as startup failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingKey(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreKind;

    #[test]
    fn error_types_are_stable_strings() {
        assert_eq!(
            LexError::Validation("x".into()).error_type(),
            "validation_error"
        );
        assert_eq!(
            LexError::NotFound("abc".into()).error_type(),
            "not_found_error"
        );
        assert_eq!(
            LexError::Timeout {
                store: StoreKind::Vector,
                timeout_ms: 250
            }
            .error_type(),
            "timeout_error"
        );
        assert_eq!(LexError::Closed.error_type(), "service_closed");
    }

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(
            LexError::StoreUnavailable {
                store: StoreKind::Graph,
                message: "down".into()
            }
            .is_retryable()
        );
        assert!(LexError::ExternalApiRateLimited("429".into()).is_retryable());
        assert!(!LexError::Validation("bad".into()).is_retryable());
        assert!(!LexError::ExternalApiBadRequest("400".into()).is_retryable());
    }
}
