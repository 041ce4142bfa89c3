//! Connection lifecycle management.
//!
//! One [`Backends`] object owns the handles to all three stores plus the
//! embedding seam, and walks an explicit state machine:
//!
//! ```text
//! Uninitialized -> Initializing -> Ready | Degraded -> Closed
//! ```
//!
//! Initialization is eager and exactly-once, performed before the service
//! accepts any request — never lazily on first use, so concurrent early
//! requests cannot observe a half-initialized handle. A failed health probe
//! during init is not fatal: the service comes up `Degraded` with that
//! backend marked unavailable, and the coordinator can still commit durably
//! to the relational store.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::LexError;
use crate::retry::RetryStats;
use crate::store::{GraphStore, RelationalStore, StoreKind, VectorStore};

/// Lifecycle state of the service as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
    Closed,
}

/// Health of a single backend as reported by `health()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    Ready,
    Degraded,
    Down,
}

/// Shape returned by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: ServiceState,
    pub relational: BackendHealth,
    pub vector: BackendHealth,
    pub graph: BackendHealth,
    /// `configured` or `unconfigured`.
    pub external_api: &'static str,
    pub retry: RetryStats,
}

/// Owns pooled backend handles and enforces the init/close state machine.
///
/// Constructed once at process start and passed by `Arc` to every component;
/// nothing in the crate self-initializes on first use.
pub struct Backends {
    pub relational: Arc<dyn RelationalStore>,
    pub vector: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    external_api_configured: bool,
    state: RwLock<ServiceState>,
}

impl Backends {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        external_api_configured: bool,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            embedder,
            external_api_configured,
            state: RwLock::new(ServiceState::Uninitialized),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn external_api_configured(&self) -> bool {
        self.external_api_configured
    }

    /// Probe every backend and transition to `Ready` or `Degraded`.
    ///
    /// May be called exactly once; a second call is a validation error.
    pub async fn init(&self) -> Result<ServiceState, LexError> {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if *state != ServiceState::Uninitialized {
                return Err(LexError::Validation(
                    "lifecycle already initialized".to_string(),
                ));
            }
            *state = ServiceState::Initializing;
        }

        let (relational, vector, graph) = tokio::join!(
            self.relational.probe(),
            self.vector.probe(),
            self.graph.probe()
        );

        let mut failed = HashSet::new();
        for (kind, outcome) in [
            (StoreKind::Relational, relational),
            (StoreKind::Vector, vector),
            (StoreKind::Graph, graph),
        ] {
            if let Err(e) = outcome {
                tracing::warn!(store = %kind, error = %e, "backend failed its init probe");
                failed.insert(kind);
            }
        }

        let next = if failed.is_empty() {
            ServiceState::Ready
        } else {
            ServiceState::Degraded
        };
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
        tracing::info!(state = ?next, "backend lifecycle initialized");
        Ok(next)
    }

    /// Fail fast on requests outside the serving states.
    pub fn guard(&self) -> Result<(), LexError> {
        match self.state() {
            ServiceState::Ready | ServiceState::Degraded => Ok(()),
            ServiceState::Closed => Err(LexError::Closed),
            ServiceState::Uninitialized | ServiceState::Initializing => Err(LexError::NotReady),
        }
    }

    /// Drain and release pooled connections; subsequent requests fail fast.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if *state == ServiceState::Closed {
                return;
            }
            *state = ServiceState::Closed;
        }
        // In-flight operations already hold their connections; closing the
        // pools lets them drain while refusing new acquisitions.
        self.graph.close().await;
        self.vector.close().await;
        self.relational.close().await;
        tracing::info!("backend lifecycle closed");
    }

    /// Live per-backend probes folded into one health report.
    ///
    /// A backend that answers its probe but has retries pending against it
    /// reports `degraded`: reachable, projection catching up.
    pub async fn health(&self, retry: RetryStats, retry_pending_for: &[StoreKind]) -> HealthReport {
        let state = self.state();
        if state == ServiceState::Closed {
            return HealthReport {
                state,
                relational: BackendHealth::Down,
                vector: BackendHealth::Down,
                graph: BackendHealth::Down,
                external_api: self.external_api_label(),
                retry,
            };
        }

        let (relational, vector, graph) = tokio::join!(
            self.relational.probe(),
            self.vector.probe(),
            self.graph.probe()
        );

        let classify = |kind: StoreKind, outcome: Result<(), LexError>| match outcome {
            Err(_) => BackendHealth::Down,
            Ok(()) if retry_pending_for.contains(&kind) => BackendHealth::Degraded,
            Ok(()) => BackendHealth::Ready,
        };

        HealthReport {
            state,
            relational: classify(StoreKind::Relational, relational),
            vector: classify(StoreKind::Vector, vector),
            graph: classify(StoreKind::Graph, graph),
            external_api: self.external_api_label(),
            retry,
        }
    }

    fn external_api_label(&self) -> &'static str {
        if self.external_api_configured {
            "configured"
        } else {
            "unconfigured"
        }
    }
}
