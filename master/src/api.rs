//! REST API implementation for the master coordinator
//!
//! This module provides the HTTP endpoints workers report into (register,
//! heartbeat, result, file upload) and the client boundary for submitters and
//! administrators (submit, cancel, status, results, artifacts, parameters,
//! worker administration). Each public function corresponds to an endpoint
//! and is responsible for validating the request, driving the owning
//! subsystem, and shaping the response.

use crate::artifacts::ArtifactStore;
use crate::database::{
    db_assignments, db_files, db_results, db_tasks, db_users, MasterDatabase,
};
use crate::database::db_files::ArtifactFileRecord;
use crate::dispatch::AssignmentEngine;
use crate::ingest::ResultIngestor;
use crate::queue::TaskQueue;
use crate::reconcile::reconcile_worker;
use crate::registry::WorkerRegistry;
use crate::scheduler::rts::RtsScheduler;
use crate::telemetry::TelemetryHub;
use crate::worker_client::WorkerClient;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use shared::api::{
    endpoints, headers, FileChunk, HeartbeatAck, HeartbeatRequest, RegisterAck,
    RegisterWorkerAdminRequest, RegisterWorkerRequest, ResultAck, SubmitTaskRequest,
    SubmitTaskResponse, TaskResultReport, TaskStatusResponse, UploadAck, WorkerSummary,
};
use shared::params::ParameterBundle;
use shared::task::{Task, TaskStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    /// Master configuration
    pub config: Arc<shared::config::MasterConfig>,
    /// Database handle for durable collections
    pub database: Arc<Mutex<MasterDatabase>>,
    /// In-memory worker registry
    pub registry: Arc<WorkerRegistry>,
    /// Pending task queue
    pub queue: Arc<TaskQueue>,
    /// Heartbeat ingestion hub
    pub telemetry: Arc<TelemetryHub>,
    /// Result ingestor
    pub ingestor: Arc<ResultIngestor>,
    /// Assignment engine (for direct dispatch)
    pub engine: Arc<AssignmentEngine>,
    /// Artifact store for received output files
    pub artifacts: Arc<ArtifactStore>,
    /// Outbound worker control client
    pub worker_client: WorkerClient,
    /// Risk scheduler handle when that strategy is active
    pub rts: Option<Arc<RtsScheduler>>,
    /// Parameter file path for bundle reads in round-robin mode
    pub param_path: PathBuf,
    /// Wakes the assignment engine
    pub kick: Arc<Notify>,
}

/// Creates the main API router and defines all the application's routes.
/// This function is called once at master startup to build the routing tree.
pub fn create_router(state: AppState) -> Router {
    // Maximum request body size: file chunks are 1 MiB before compression,
    // so 10 MB leaves generous headroom while bounding memory per request.
    const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

    Router::new()
        // Unauthenticated health check for probes and load balancers.
        .route(endpoints::HEALTH, get(health_check))
        // Worker-facing endpoints.
        .route(endpoints::WORKER_REGISTER, post(handle_worker_register))
        .route(endpoints::WORKER_HEARTBEAT, post(handle_heartbeat))
        .route(endpoints::TASK_REPORT, post(handle_task_report))
        .route(endpoints::FILE_UPLOAD, post(handle_file_upload))
        // Client boundary.
        .route(endpoints::TASK_SUBMIT, post(handle_submit_task))
        .route("/api/v1/tasks/{task_id}", get(handle_task_status))
        .route("/api/v1/tasks/{task_id}/cancel", post(handle_cancel_task))
        .route(
            "/api/v1/tasks/{task_id}/dispatch/{worker_id}",
            post(handle_dispatch_direct),
        )
        .route("/api/v1/tasks/{task_id}/result", get(handle_task_result))
        .route("/api/v1/tasks/{task_id}/files", get(handle_task_files))
        .route(
            "/api/v1/tasks/{task_id}/files/{*path}",
            get(handle_file_download),
        )
        .route(endpoints::PARAMS, get(handle_params))
        .route(endpoints::WORKER_LIST, get(handle_worker_list))
        // Admin surface.
        .route(endpoints::ADMIN_WORKERS, post(handle_admin_register_worker))
        .route(
            "/api/v1/admin/workers/{worker_id}",
            delete(handle_admin_unregister_worker),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// Helper function to validate the API key from request headers
///
/// Uses constant-time comparison to prevent timing attacks that could
/// allow an attacker to deduce the API key character-by-character.
fn validate_api_key(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let provided_key = match headers.get(headers::API_KEY) {
        Some(key) => match key.to_str() {
            Ok(key_str) => key_str,
            Err(_) => {
                warn!("Invalid API key format in header");
                return Err(ApiError::Unauthorized);
            }
        },
        None => {
            warn!("Missing API key header");
            return Err(ApiError::Unauthorized);
        }
    };

    if provided_key.is_empty() {
        warn!("Empty API key provided");
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

/// Requesting user from the X-User-Id header
fn requesting_user(headers: &HeaderMap) -> Result<String, ApiError> {
    let user = headers
        .get(headers::USER_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if user.is_empty() {
        return Err(ApiError::BadRequest(
            "Missing X-User-Id header".to_string(),
        ));
    }
    Ok(user.to_string())
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let user = requesting_user(headers)?;
    if !state.config.is_admin(&user) {
        warn!(user_id = %user, "Non-admin attempted an admin operation");
        return Err(ApiError::Forbidden(format!(
            "User '{}' is not an administrator",
            user
        )));
    }
    Ok(user)
}

/// The handler for the `/health` endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "taskmaster",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Worker registration / re-attach. The declared running set drives the
/// stale-allocation reconciler, so a worker returning from a crash
/// immediately trues up the master's accounting.
async fn handle_worker_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<Json<RegisterAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    request
        .worker
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    info!(
        worker_id = %request.worker.worker_id,
        address = %request.worker.address,
        declared_running = request.running_task_ids.len(),
        "Worker registration received"
    );

    state
        .registry
        .attach(&request.worker)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let synthesized = reconcile_worker(
        &state.registry,
        &state.ingestor,
        &request.worker.worker_id,
        &request.running_task_ids,
    )
    .await;
    if synthesized > 0 {
        info!(
            worker_id = %request.worker.worker_id,
            synthesized = synthesized,
            "Reconciled orphaned tasks on worker attach"
        );
    }

    // Fresh capacity may satisfy queued tasks
    state.kick.notify_one();

    Ok(Json(RegisterAck {
        success: true,
        message: "registered".to_string(),
        heartbeat_interval_seconds: state.config.heartbeat_interval_seconds,
    }))
}

/// Heartbeat ingestion. Unknown workers are asked to re-register instead of
/// being silently dropped.
async fn handle_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    shared::utils::validate_worker_id(&request.worker_id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if state.registry.get(&request.worker_id).await.is_none() {
        debug!(worker_id = %request.worker_id, "Heartbeat from unknown worker, requesting registration");
        return Ok(Json(HeartbeatAck::reregister()));
    }

    state.telemetry.ingest(request).await;
    Ok(Json(HeartbeatAck::accepted()))
}

/// Terminal task report from a worker.
async fn handle_task_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<TaskResultReport>,
) -> Result<Json<ResultAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let ack = state
        .ingestor
        .ingest(&report)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(ack))
}

/// One chunk of a task's output artifact stream.
async fn handle_file_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(chunk): Json<FileChunk>,
) -> Result<Json<UploadAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let task = load_task(&state, &chunk.task_id).await?;
    if task.user_id != chunk.user_id {
        warn!(
            task_id = %chunk.task_id,
            chunk_user = %chunk.user_id,
            task_user = %task.user_id,
            "Upload chunk user mismatch"
        );
        return Err(ApiError::Forbidden(
            "Chunk user does not own the task".to_string(),
        ));
    }

    let data = match shared::utils::decode_payload(&chunk.data) {
        Ok(data) => data,
        Err(e) => {
            // A malformed chunk aborts the stream; a retry starts fresh.
            state.artifacts.abort(&chunk.task_id).await;
            return Err(ApiError::BadRequest(format!(
                "Undecodable chunk payload: {}",
                e
            )));
        }
    };

    let committed = state
        .artifacts
        .ingest_chunk(&task, &chunk.relative_path, &data, chunk.is_last)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match committed {
        None => Ok(Json(UploadAck {
            status: "success".to_string(),
            committed: false,
        })),
        Some(files) => {
            // Record metadata; losing a row is not worth failing the upload.
            let mut db = state.database.lock().await;
            match db.get_connection() {
                Ok(conn) => {
                    for file in &files {
                        let record = ArtifactFileRecord {
                            task_id: task.task_id.clone(),
                            user_id: task.user_id.clone(),
                            relative_path: file.relative_path.clone(),
                            size_bytes: file.size_bytes,
                            checksum: file.checksum.clone(),
                        };
                        if let Err(e) = db_files::upsert_file(conn, &record) {
                            warn!(task_id = %task.task_id, error = %e, "Failed to index artifact file");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Store unavailable while indexing artifacts"),
            }
            info!(
                task_id = %task.task_id,
                files = files.len(),
                "Artifact upload committed"
            );
            Ok(Json(UploadAck {
                status: "success".to_string(),
                committed: true,
            }))
        }
    }
}

/// Task submission from a client.
async fn handle_submit_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    if request.user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id cannot be empty".to_string()));
    }
    if request.image.is_empty() {
        return Err(ApiError::BadRequest("image cannot be empty".to_string()));
    }

    let task_id = match &request.task_id {
        Some(task_id) => {
            shared::utils::validate_task_id(task_id)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            task_id.clone()
        }
        None => uuid::Uuid::new_v4().to_string(),
    };

    // Derive the name from the image when the submitter gave none.
    let task_name = request.task_name.clone().unwrap_or_else(|| {
        request
            .image
            .rsplit('/')
            .next()
            .unwrap_or(&request.image)
            .split(':')
            .next()
            .unwrap_or(&request.image)
            .to_string()
    });

    let task = Task {
        task_id: task_id.clone(),
        user_id: request.user_id.clone(),
        task_name,
        image: request.image.clone(),
        command: request.command.clone(),
        request: request.request,
        task_type: request.task_type,
        tau_seconds: request.tau_seconds,
        sla_multiplier: Task::clamp_sla_multiplier(
            request.sla_multiplier.unwrap_or_else(shared::defaults::default_sla_multiplier),
        ),
        submitted_at: shared::utils::current_timestamp(),
        status: TaskStatus::Queued,
        started_at: None,
        completed_at: None,
    };
    task.validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Database(e.to_string()))?;
        db_tasks::insert_task(conn, &task).map_err(|e| {
            // A duplicate task_id lands here via the primary key
            ApiError::BadRequest(format!("Failed to admit task: {}", e))
        })?;
        let is_admin = state.config.is_admin(&task.user_id);
        if let Err(e) = db_users::record_submission(conn, &task.user_id, is_admin) {
            warn!(user_id = %task.user_id, error = %e, "Failed to record user submission");
        }
    }

    let queue_position = state.queue.enqueue(task.clone()).await;
    state.kick.notify_one();

    info!(
        task_id = %task.task_id,
        user_id = %task.user_id,
        task_type = %task.task_type.as_str(),
        queue_position = queue_position,
        "Task admitted"
    );

    Ok(Json(SubmitTaskResponse {
        task_id,
        status: TaskStatus::Queued,
        queue_position,
    }))
}

/// Task status for polling clients.
async fn handle_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let task = load_task(&state, &task_id).await?;
    let assigned_worker = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Database(e.to_string()))?;
        db_assignments::get_assignment(conn, &task_id)
            .map_err(|e| ApiError::Database(e.to_string()))?
            .map(|a| a.worker_id)
    };

    Ok(Json(TaskStatusResponse {
        task,
        assigned_worker,
    }))
}

/// Master-side cancellation: optimistic status write, resource release, then
/// a best-effort worker notification. The cancellation appears immediate to
/// the caller even when the worker is unreachable; the preservation and
/// single-result invariants absorb whatever the worker later reports.
async fn handle_cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ResultAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let task = load_task(&state, &task_id).await?;
    match task.status {
        TaskStatus::Cancelled => {
            // Idempotent: repeated cancellation changes nothing
            return Ok(Json(ResultAck::suppressed()));
        }
        TaskStatus::Completed | TaskStatus::Failed => {
            return Err(ApiError::BadRequest(format!(
                "Task '{}' already finished as {}",
                task_id,
                task.status.as_str()
            )));
        }
        TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running => {}
    }

    // (i) The store is updated first; every later reader sees cancelled.
    let now = shared::utils::current_timestamp();
    {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Database(e.to_string()))?;
        if let Err(first) =
            db_tasks::update_status(conn, &task_id, TaskStatus::Cancelled, None, Some(now))
        {
            warn!(task_id = %task_id, error = %first, "Cancellation status write failed, retrying once");
            db_tasks::update_status(conn, &task_id, TaskStatus::Cancelled, None, Some(now))
                .map_err(|e| ApiError::Database(e.to_string()))?;
        }
    }

    // Queued tasks just leave the queue.
    state.queue.remove(&task_id).await;

    // (ii) Release resources held by a running task.
    let assignment = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Database(e.to_string()))?;
        db_assignments::get_assignment(conn, &task_id)
            .map_err(|e| ApiError::Database(e.to_string()))?
    };
    if let Some(assignment) = &assignment {
        state.registry.release(&assignment.worker_id, &task_id).await;
        state.kick.notify_one();
    }

    info!(task_id = %task_id, "Task cancelled");

    // (iii) Notify the worker asynchronously. A timeout here still counts as
    // success; the late result is suppressed on arrival.
    if task.status == TaskStatus::Running {
        if let Some(assignment) = assignment {
            if let Some(entry) = state.registry.get(&assignment.worker_id).await {
                let address = entry.read().await.address.clone();
                let client = state.worker_client.clone();
                let timeout = Duration::from_secs(state.config.cancel_timeout_seconds);
                let task_id = task_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.cancel_task(&address, &task_id, timeout).await {
                        warn!(
                            task_id = %task_id,
                            error = %e,
                            "Worker cancellation notification failed; relying on result suppression"
                        );
                    }
                });
            }
        }
    }

    Ok(Json(ResultAck::recorded()))
}

/// Operator-driven direct dispatch to a specific worker.
async fn handle_dispatch_direct(
    State(state): State<AppState>,
    Path((task_id, worker_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ResultAck>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    require_admin(&state, &headers)?;

    state
        .engine
        .dispatch_direct(&task_id, &worker_id)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(ResultAck::recorded()))
}

/// Stored result for a task.
async fn handle_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<db_results::StoredResult>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let mut db = state.database.lock().await;
    let conn = db
        .get_connection()
        .map_err(|e| ApiError::Database(e.to_string()))?;
    let result = db_results::get_result(conn, &task_id)
        .map_err(|e| ApiError::Database(e.to_string()))?
        .ok_or_else(|| ApiError::BadRequest(format!("No result for task '{}'", task_id)))?;
    Ok(Json(result))
}

/// Committed artifact files of a task.
async fn handle_task_files(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<ArtifactFileRecord>>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let requester = requesting_user(&headers)?;

    let task = load_task(&state, &task_id).await?;
    if !state.artifacts.access_allowed(&requester, &task.user_id) {
        return Err(ApiError::Forbidden(format!(
            "User '{}' may not access artifacts of '{}'",
            requester, task.user_id
        )));
    }

    let mut db = state.database.lock().await;
    let conn = db
        .get_connection()
        .map_err(|e| ApiError::Database(e.to_string()))?;
    let files = db_files::list_by_task(conn, &task_id)
        .map_err(|e| ApiError::Database(e.to_string()))?;
    Ok(Json(files))
}

/// Artifact file download, access-checked.
async fn handle_file_download(
    State(state): State<AppState>,
    Path((task_id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let requester = requesting_user(&headers)?;

    let task = load_task(&state, &task_id).await?;
    let file_path = state
        .artifacts
        .open_file(&requester, &task, &path)
        .map_err(|e| ApiError::Forbidden(e.to_string()))?;

    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read artifact: {}", e)))?;
    let total_size = bytes.len();

    // Stream in fixed chunks instead of one monolithic body so large
    // artifacts don't pin the whole response buffer per connection.
    use futures_util::stream;
    const CHUNK_SIZE: usize = 64 * 1024;
    let byte_stream = stream::iter(
        bytes
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok::<_, std::io::Error>(axum::body::Bytes::copy_from_slice(chunk)))
            .collect::<Vec<_>>(),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/octet-stream",
        )
        .header(axum::http::header::CONTENT_LENGTH, total_size)
        .body(axum::body::Body::from_stream(byte_stream))
        .map_err(|e| ApiError::Internal(format!("Failed to build response: {}", e)))
}

/// Current scheduler parameter bundle.
async fn handle_params(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ParameterBundle>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let bundle = match &state.rts {
        Some(rts) => rts.current_params(),
        None => ParameterBundle::load(&state.param_path).unwrap_or_default(),
    };
    Ok(Json(bundle))
}

/// Fleet listing with capacity, allocation, and liveness.
async fn handle_worker_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<WorkerSummary>>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let mut summaries = Vec::new();
    for entry in state.registry.list().await {
        let worker = entry.read().await;
        summaries.push(WorkerSummary {
            worker_id: worker.worker_id.clone(),
            address: worker.address.clone(),
            is_active: worker.is_active,
            total: worker.total,
            allocated: worker.allocated,
            available: worker.available(),
            running_tasks: worker.running_task_ids(),
            usage: worker.usage,
            last_heartbeat: worker.last_heartbeat_unix,
        });
    }
    Ok(Json(summaries))
}

/// Admin pre-registration of a worker (id plus address with explicit port).
async fn handle_admin_register_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterWorkerAdminRequest>,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let admin = require_admin(&state, &headers)?;

    state
        .registry
        .register(&request.worker_id, &request.address)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    info!(
        worker_id = %request.worker_id,
        admin = %admin,
        "Worker pre-registered by administrator"
    );
    Ok(StatusCode::CREATED)
}

/// Admin removal of a worker.
async fn handle_admin_unregister_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    require_admin(&state, &headers)?;

    state
        .registry
        .unregister(&worker_id)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_task(state: &AppState, task_id: &str) -> Result<Task, ApiError> {
    let mut db = state.database.lock().await;
    let conn = db
        .get_connection()
        .map_err(|e| ApiError::Database(e.to_string()))?;
    match db_tasks::get_task(conn, task_id) {
        Ok(Some(task)) => Ok(task),
        Ok(None) => Err(ApiError::NotFound(format!("Unknown task '{}'", task_id))),
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to load task");
            Err(ApiError::Database(e.to_string()))
        }
    }
}

/// Custom error types for the API.
/// Using a dedicated enum for API errors allows for consistent error handling
/// and response formatting.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Database error: {0}")]
    Database(String),
}

/// This implementation allows `ApiError` to be converted into an HTTP
/// response. If a handler returns `Result<_, ApiError>`, axum calls
/// `into_response` on the `Err` variant.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}
