//! HTTP status server for the ingester worker.
//!
//! Provides endpoints for:
//! - `GET /health` - Health check
//! - `GET /status` - Queue depth and recent batch summaries
//! - `GET /dead-letters` - Messages that will not be retried
//! - `GET /metrics` - Prometheus metrics

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use ingestion::BatchSummary;
use storage::{DeadLetter, QueueDepth, WorkQueue};

// ============================================================================
// Batch Tracking
// ============================================================================

/// Running totals plus the most recent batch summaries.
pub struct BatchTracker {
    inner: Mutex<TrackerState>,
    capacity: usize,
}

#[derive(Default)]
struct TrackerState {
    totals: BatchTotals,
    recent: VecDeque<BatchSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchTotals {
    pub batches: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub retry_pending: u64,
}

impl BatchTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, summary: &BatchSummary) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let totals = &mut state.totals;
        totals.batches += 1;
        totals.succeeded += summary.succeeded as u64;
        totals.failed += summary.failed as u64;
        totals.dead_lettered += summary.dead_lettered as u64;
        totals.retry_pending += summary.retry_pending as u64;

        state.recent.push_front(summary.clone());
        while state.recent.len() > self.capacity {
            state.recent.pop_back();
        }
    }

    /// Totals and the newest summaries first.
    pub fn snapshot(&self) -> (BatchTotals, Vec<BatchSummary>) {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (state.totals.clone(), state.recent.iter().cloned().collect())
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub started_at: DateTime<Utc>,
    pub queue: Option<QueueDepth>,
    pub totals: BatchTotals,
    pub recent_batches: Vec<BatchSummary>,
}

#[derive(Debug, Serialize)]
pub struct DeadLettersResponse {
    pub total: usize,
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLettersQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Shared State
// ============================================================================

pub struct ServerState {
    pub queue: Arc<dyn WorkQueue>,
    pub tracker: Arc<BatchTracker>,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(Extension(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "ingester".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status
async fn status_handler(Extension(state): Extension<Arc<ServerState>>) -> impl IntoResponse {
    // Queue trouble should not hide the batch history.
    let queue = state.queue.depth().await.ok();
    let (totals, recent_batches) = state.tracker.snapshot();

    Json(StatusResponse {
        service: "ingester".to_string(),
        started_at: state.started_at,
        queue,
        totals,
        recent_batches,
    })
}

/// GET /dead-letters?limit=N
async fn dead_letters_handler(
    Extension(state): Extension<Arc<ServerState>>,
    Query(params): Query<DeadLettersQuery>,
) -> Response {
    match state.queue.dead_letters().await {
        Ok(dead_letters) => {
            let total = dead_letters.len();
            let dead_letters = dead_letters
                .into_iter()
                .take(params.limit.unwrap_or(100))
                .collect();
            Json(DeadLettersResponse { total, dead_letters }).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /metrics
async fn metrics_handler(Extension(state): Extension<Arc<ServerState>>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

pub async fn run_server(state: Arc<ServerState>, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port = port, "Starting status server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
