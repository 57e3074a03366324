//! Control API hosted by the worker
//!
//! The master drives the worker through this small surface: task assignment,
//! cancellation, a registration nudge used by the reconnection monitor, and
//! a live log stream per task. The same API-key check as the master's own
//! surface guards every endpoint except the health probe.

use crate::executor::ExecutionEngine;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::api::{endpoints, headers, AssignTaskRequest, CancelTaskRequest, MasterInfo, TaskAck};
use shared::config::WorkerConfig;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Application state shared across the worker's API handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WorkerConfig>,
    pub engine: Arc<ExecutionEngine>,
    /// Poked by MasterRegister; the main loop re-runs the registration
    /// handshake when notified.
    pub reregister: Arc<Notify>,
}

/// Creates the worker's control API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(health_check))
        .route(endpoints::MASTER_REGISTER, post(handle_master_register))
        .route(endpoints::TASK_ASSIGN, post(handle_assign_task))
        .route(endpoints::TASK_CANCEL, post(handle_cancel_task))
        .route("/api/v1/tasks/{task_id}/logs", get(handle_stream_logs))
        .with_state(state)
}

/// Constant-time API key check, same discipline as the master's surface.
fn validate_api_key(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let provided_key = headers
        .get(headers::API_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided_key.is_empty() {
        warn!("Missing or empty API key");
        return Err(ApiError::Unauthorized);
    }

    let provided_bytes = provided_key.as_bytes();
    let expected_bytes = expected_key.as_bytes();
    let keys_match = provided_bytes.len() == expected_bytes.len()
        && bool::from(provided_bytes.ct_eq(expected_bytes));
    if !keys_match {
        warn!("Invalid API key provided");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// The handler for the `/health` endpoint; also answers the master's
/// reconnect probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "taskworker",
        "worker_id": state.config.worker_id,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// The master asks the worker to (re-)initiate the registration handshake.
async fn handle_master_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(info): Json<MasterInfo>,
) -> Result<Json<TaskAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    info!(
        master_id = %info.master_id,
        address = %info.address,
        "Master requested registration"
    );
    if !info.address.is_empty() && info.address != state.config.master_url {
        // Single-master deployments keep the configured URL authoritative.
        warn!(
            configured = %state.config.master_url,
            announced = %info.address,
            "Master announced a different address; keeping configured URL"
        );
    }

    state.reregister.notify_one();
    Ok(Json(TaskAck::ok()))
}

/// Task assignment from the master. The ack means accepted; execution is
/// asynchronous.
async fn handle_assign_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AssignTaskRequest>,
) -> Result<Json<TaskAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    match state.engine.submit(request.task).await {
        Ok(()) => Ok(Json(TaskAck::ok())),
        Err(e) => {
            warn!(error = %e, "Assignment declined");
            Ok(Json(TaskAck::rejected(e.to_string())))
        }
    }
}

/// Cancellation from the master. Unknown tasks are an error to the caller;
/// the master treats its own store as authoritative either way.
async fn handle_cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CancelTaskRequest>,
) -> Result<Json<TaskAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    state
        .engine
        .cancel(&request.task_id)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(TaskAck::ok()))
}

/// Live log stream for a running task as newline-delimited JSON.
async fn handle_stream_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let receiver = state
        .engine
        .subscribe_logs(&task_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Task '{}' is not running", task_id)))?;

    let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
        let line = receiver.recv().await?;
        let mut body = serde_json::to_string(&line).unwrap_or_default();
        body.push('\n');
        Some((Ok::<_, std::convert::Infallible>(body), receiver))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "application/x-ndjson")
        .body(axum::body::Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("Failed to build response: {}", e)))
}

/// Error types for the worker's control API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}
