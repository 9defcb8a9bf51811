//! Health check and admin handlers for the MQ server.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Server monitoring (`/mq/status`, `/mq/stats`, `/mq/stats/description`)
//! - Prometheus metrics (`/metrics`)
//! - Lifecycle and DLQ admin endpoints (`/admin/mq/*`)
//!
//! Server lifecycle calls block (thread joins), so admin handlers run them on
//! the blocking pool.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::dlq::DlqManager;
use crate::error::MqError;
use crate::metrics;
use crate::server::MqServer;
use crate::stats::HandlerStatsSnapshot;
use crate::status::WorkerStatus;

type ApiError = (StatusCode, Json<Value>);

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub server: MqServer,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        server: MqServer,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            server,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }

    pub fn dlq_manager(&self) -> DlqManager {
        DlqManager::new(self.server.broker(), self.server.config())
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: WorkerStatus,
    pub subscribed: bool,
    pub times_started: u64,
    pub no_of_errors: u64,
    pub no_of_continuous_errors: u32,
    pub last_error: Option<String>,
    pub workers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: HandlerStatsSnapshot,
    pub workers: Vec<HandlerStatsSnapshot>,
}

fn error_response(err: &MqError) -> ApiError {
    let status = if err.is_disposed() {
        StatusCode::CONFLICT
    } else if err.is_transport() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": err.to_string() })))
}

async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, MqError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_response(&e)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("blocking task failed: {}", e) })),
        )),
    }
}

/// Liveness probe handler.
///
/// Always returns OK if the process is serving HTTP.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready only while the server is `Started`.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let status = state.server.status();
    let body = json!({
        "status": if status == WorkerStatus::Started { "ready" } else { "not_ready" },
        "checks": {
            "mq_server": status.as_ref(),
            "subscribed": state.server.is_subscribed(),
        }
    });

    if status == WorkerStatus::Started {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

pub async fn status_handler(State(state): State<HealthState>) -> Json<StatusResponse> {
    let server = &state.server;
    Json(StatusResponse {
        status: server.status(),
        subscribed: server.is_subscribed(),
        times_started: server.times_started(),
        no_of_errors: server.no_of_errors(),
        no_of_continuous_errors: server.no_of_continuous_errors(),
        last_error: server.last_error(),
        workers: server.worker_statuses(),
    })
}

pub async fn stats_handler(State(state): State<HealthState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        total: state.server.stats(),
        workers: state.server.worker_stats(),
    })
}

pub async fn stats_description_handler(State(state): State<HealthState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.server.stats_description(),
    )
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

// ============================================================================
// Admin Handlers
// ============================================================================

/// `POST /admin/mq/start`
pub async fn start_handler(State(state): State<HealthState>) -> Result<Json<Value>, ApiError> {
    let server = state.server.clone();
    run_blocking(move || server.start()).await?;
    Ok(Json(json!({ "success": true, "status": state.server.status() })))
}

/// `POST /admin/mq/stop`
pub async fn stop_handler(State(state): State<HealthState>) -> Result<Json<Value>, ApiError> {
    let server = state.server.clone();
    run_blocking(move || server.stop()).await?;
    Ok(Json(json!({ "success": true, "status": state.server.status() })))
}

/// `POST /admin/mq/restart`
pub async fn restart_handler(State(state): State<HealthState>) -> Result<Json<Value>, ApiError> {
    let server = state.server.clone();
    run_blocking(move || server.restart()).await?;
    Ok(Json(json!({ "success": true, "status": state.server.status() })))
}

/// Query parameters for the DLQ reprocess endpoint.
#[derive(Debug, Deserialize)]
pub struct DlqReprocessParams {
    /// Number of messages to reprocess (default: 10, max: 100)
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    10
}

/// `GET /admin/mq/dlq/{type}`
pub async fn dlq_stats_handler(
    State(state): State<HealthState>,
    Path(type_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.dlq_manager();
    let stats = run_blocking(move || manager.stats(&type_name)).await?;
    Ok(Json(stats))
}

/// Move dead letters back to the inbox, oldest first.
///
/// `POST /admin/mq/dlq/{type}/reprocess?count=10`
pub async fn dlq_reprocess_handler(
    State(state): State<HealthState>,
    Path(type_name): Path<String>,
    Query(params): Query<DlqReprocessParams>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.dlq_manager();
    let count = params.count.min(100);
    let result = run_blocking(move || manager.reprocess(&type_name, count)).await?;
    Ok(Json(result))
}

/// Create a standard health router.
///
/// - `/health`, `/healthz` - Liveness probe
/// - `/ready`, `/readyz` - Readiness probe
/// - `/mq/status`, `/mq/stats`, `/mq/stats/description` - Server monitoring
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/mq/status", get(status_handler))
        .route("/mq/stats", get(stats_handler))
        .route("/mq/stats/description", get(stats_description_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Create a router with lifecycle and DLQ admin endpoints.
pub fn admin_router(state: HealthState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/admin/mq/start", post(start_handler))
        .route("/admin/mq/stop", post(stop_handler))
        .route("/admin/mq/restart", post(restart_handler))
        .route("/admin/mq/dlq/{type}", get(dlq_stats_handler))
        .route("/admin/mq/dlq/{type}/reprocess", post(dlq_reprocess_handler))
        .with_state(state)
}

/// Health and admin endpoints with request tracing.
pub fn full_admin_router(state: HealthState) -> axum::Router {
    health_router(state.clone())
        .merge(admin_router(state))
        .layer(TraceLayer::new_for_http())
}
