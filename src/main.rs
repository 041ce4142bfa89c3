use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lexgrid::config::Config;
use lexgrid::coordinator::{WriteCoordinator, spawn_retry_worker};
use lexgrid::courtlistener::CourtListenerClient;
use lexgrid::embedding::{EmbeddingProvider, HttpEmbeddingProvider};
use lexgrid::lifecycle::Backends;
use lexgrid::retry::{BackoffPolicy, RetryQueue};
use lexgrid::search::SearchEngine;
use lexgrid::server::{AppState, router};
use lexgrid::store::neo4j::Neo4jStore;
use lexgrid::store::postgres::PostgresStore;
use lexgrid::store::qdrant::QdrantStore;

#[derive(Parser)]
#[command(name = "lexgrid", about = "Legal research data coordination service")]
struct Cli {
    /// Bind host, overriding BIND_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overriding BIND_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. `info` or `lexgrid=debug,tower_http=info`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;

    let relational = Arc::new(PostgresStore::new(&config.database)?);
    let vector = Arc::new(QdrantStore::new(http.clone(), &config.database));
    let graph = Arc::new(Neo4jStore::new(http.clone(), &config.database));
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(
        http.clone(),
        &config.api.embedding_url,
        &config.api.embedding_model,
        config.api.embedding_api_key.clone(),
    ));

    // Schema and index setup is idempotent and runs on every start.
    relational
        .ensure_schema()
        .await
        .context("applying relational schema")?;
    let dimensions = embedder
        .embed("dimension probe")
        .await
        .map(|v| v.len())
        .unwrap_or(1536);
    if let Err(e) = vector.ensure_collection(dimensions).await {
        tracing::warn!(error = %e, "vector collection setup failed; continuing degraded");
    }
    if let Err(e) = graph.ensure_index().await {
        tracing::warn!(error = %e, "graph fulltext index setup failed; continuing degraded");
    }

    let courtlistener = Arc::new(CourtListenerClient::new(
        http,
        &config.api.courtlistener_base_url,
        config.api.courtlistener_api_key.clone(),
        BackoffPolicy::new(config.tuning.backoff),
        config.tuning.circuit_failure_threshold,
        config.tuning.circuit_cooldown,
    ));

    let backends = Arc::new(Backends::new(
        relational,
        vector,
        graph,
        embedder,
        courtlistener.configured(),
    ));
    // Eager, exactly-once init before the listener opens.
    let state = backends.init().await?;
    tracing::info!(state = ?state, "backends initialized");

    let retry = Arc::new(RetryQueue::new(BackoffPolicy::new(config.tuning.backoff)));
    let coordinator = Arc::new(WriteCoordinator::new(
        backends.clone(),
        retry,
        config.tuning.secondary_timeout,
    ));
    let search = Arc::new(SearchEngine::new(
        backends.clone(),
        config.tuning.fusion_k,
        config.tuning.search_timeout,
    ));
    let retry_worker = spawn_retry_worker(coordinator.clone(), config.tuning.retry_interval);

    let app = router(AppState {
        backends: backends.clone(),
        coordinator,
        search,
        courtlistener,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "lexgrid listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    retry_worker.abort();
    backends.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
