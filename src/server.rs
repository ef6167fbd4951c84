//! Read-only status endpoints for operational monitoring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::job::JobStore;
use crate::orchestrator::{WorkerSnapshot, WorkerStats};

const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct StatusState {
    pub snapshot: watch::Receiver<WorkerSnapshot>,
    pub store: Arc<dyn JobStore>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub worker_id: String,
    pub uptime_secs: i64,
    pub active_jobs: usize,
    pub store_reachable: bool,
    pub last_error: Option<String>,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub worker_id: String,
    pub uptime_secs: i64,
    #[serde(flatten)]
    pub stats: WorkerStats,
}

/// GET /health
///
/// 200 when the worker is running and the store answers, 503 otherwise.
pub async fn health(State(state): State<StatusState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.snapshot.borrow().clone();
    let ping = tokio::time::timeout(PING_TIMEOUT, state.store.ping()).await;
    let (store_reachable, ping_error) = match ping {
        Ok(Ok(())) => (true, None),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some("job store ping timed out".to_string())),
    };

    let healthy = snapshot.is_healthy() && store_reachable;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        uptime_secs: snapshot.uptime_secs(),
        active_jobs: snapshot.stats.in_flight,
        store_reachable,
        last_error: snapshot.last_error.or(ping_error),
        worker_id: snapshot.worker_id,
        version: env!("CARGO_PKG_VERSION"),
    };
    (code, Json(body))
}

/// GET /stats
pub async fn stats(State(state): State<StatusState>) -> Json<StatsResponse> {
    let snapshot = state.snapshot.borrow().clone();
    Json(StatsResponse {
        uptime_secs: snapshot.uptime_secs(),
        worker_id: snapshot.worker_id,
        stats: snapshot.stats,
    })
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve the status routes until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: StatusState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "status server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
