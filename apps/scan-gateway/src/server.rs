use std::{
    future::Future,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    agent_cache::AgentCache,
    config::ServerConfig,
    ingest::{ArchiveIngestor, STAGING_PREFIX},
    metrics,
    scan::ScanInvoker,
    session::{run_session, SessionServices, WORKSPACE_PREFIX},
    transport::WebSocketConnection,
};

pub struct AppState {
    services: SessionServices,
    metrics: Option<PrometheusHandle>,
    active_sessions: AtomicUsize,
}

impl AppState {
    pub fn new(services: SessionServices, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            services,
            metrics,
            active_sessions: AtomicUsize::new(0),
        }
    }

    /// Prepares the agent and scratch directories and wires the session
    /// services from `config`.
    pub fn from_config(config: &ServerConfig, metrics: Option<PrometheusHandle>) -> Result<Self> {
        std::fs::create_dir_all(&config.agent.dir).with_context(|| {
            format!("failed to create agent dir {}", config.agent.dir.display())
        })?;
        std::fs::create_dir_all(&config.scratch_dir).with_context(|| {
            format!("failed to create scratch dir {}", config.scratch_dir.display())
        })?;
        warn_on_split_filesystems(&config.agent.dir, &config.scratch_dir);
        sweep_scratch(&config.scratch_dir);

        let agent_cache =
            AgentCache::new(config.agent.clone()).context("failed to build agent cache")?;
        let services = SessionServices {
            agent_cache,
            invoker: ScanInvoker::new(config.runtime.clone()).with_timeout(config.scan_timeout),
            ingestor: ArchiveIngestor::new(&config.scratch_dir, config.stage_policy),
            scratch_root: config.scratch_dir.clone(),
        };
        Ok(Self::new(services, metrics))
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/component", get(component_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = Arc::new(AppState::from_config(&config, Some(metrics))?);
    let services = state.services();
    services.agent_cache.spawn_warmup();

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(
        runtime = services.invoker.runtime(),
        enforce_chunk_size = services.ingestor.policy().enforce_chunk_size,
        "scan-gateway listening on {}",
        config.listen_addr
    );

    serve(listener, state.clone(), shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        active_sessions = state.active_sessions(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn component_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    let active = state.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::record_session_started(active);

    let mut conn = WebSocketConnection::new(socket);
    let outcome = run_session(&mut conn, &state.services, session_id).await;

    let active = state.active_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::record_session_finished(active);
    debug!(%session_id, ?outcome, active, "connection finished");
}

/// Removes workspaces and staged payloads left behind by a previous process.
fn sweep_scratch(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "cannot list scratch dir");
            return;
        }
    };
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let path = entry.path();
        let result = if name.starts_with(WORKSPACE_PREFIX) && path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if name.starts_with(STAGING_PREFIX) && path.is_file() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove leftover"),
        }
    }
    if removed > 0 {
        info!(removed, dir = %dir.display(), "removed leftovers from previous run");
    }
}

#[cfg(unix)]
fn warn_on_split_filesystems(agent_dir: &Path, scratch_dir: &Path) {
    use std::os::unix::fs::MetadataExt;

    if let (Ok(agent), Ok(scratch)) = (std::fs::metadata(agent_dir), std::fs::metadata(scratch_dir)) {
        if agent.dev() != scratch.dev() {
            warn!(
                agent_dir = %agent_dir.display(),
                scratch_dir = %scratch_dir.display(),
                "agent and scratch dirs are on different filesystems; agent references will fail"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_on_split_filesystems(_agent_dir: &Path, _scratch_dir: &Path) {}
