//! HTTP API for status, desired state, health checks and Prometheus metrics

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use farm_lib::{
    controller::{DesiredPatch, FarmController},
    health::ComponentStatus,
    FarmError, FarmMetrics,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Default number of decisions returned by `/api/v1/decisions`
const DEFAULT_DECISION_LIMIT: usize = 20;
const MAX_DECISION_LIMIT: usize = 1_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<FarmController>,
    pub metrics: FarmMetrics,
}

impl AppState {
    pub fn new(controller: Arc<FarmController>, metrics: FarmMetrics) -> Self {
        Self {
            controller,
            metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    pub limit: Option<usize>,
}

/// Activity signal body; all fields optional
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ActivityRequest {
    /// When the activity happened; defaults to now
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    /// Free-form origin, e.g. "build-queue"
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub recorded_at: DateTime<Utc>,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.controller.health_registry().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.controller.health_registry().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

async fn decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DecisionsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DECISION_LIMIT)
        .min(MAX_DECISION_LIMIT);
    Json(state.controller.decisions(limit).await)
}

async fn get_desired(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.desired().await)
}

async fn put_desired(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<DesiredPatch>,
) -> Response {
    if patch.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "patch contains no fields");
    }

    match state.controller.apply_desired(&patch).await {
        Ok(desired) => (StatusCode::OK, Json(desired)).into_response(),
        Err(e @ FarmError::InvalidConfig(_)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn activity(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ActivityRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let at = request.at.unwrap_or_else(Utc::now);
    state.controller.record_activity(at).await;
    info!(
        at = %at,
        source = request.source.as_deref().unwrap_or("api"),
        "Activity signal received"
    );

    (StatusCode::ACCEPTED, Json(ActivityResponse { recorded_at: at }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/desired", get(get_desired).put(put_desired))
        .route("/api/v1/activity", post(activity))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
