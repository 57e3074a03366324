//! API types and structures for master-worker and client communication
//!
//! This module defines the request and response types used by the REST API
//! endpoints: the master-hosted surface workers report into, the worker-hosted
//! control surface the master drives, and the client boundary for submitters
//! and administrators.

use crate::task::{ResourceRequest, Task, TaskStatus, TaskType};
use crate::worker::{RunningTaskInfo, WorkerInfo, WorkerUsage};
use serde::{Deserialize, Serialize};

/// Generic API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful API response
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    /// Create an error API response
    pub fn error(error_message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(error_message),
        }
    }
}

// Master-hosted surface (workers report in)

/// Request body for POST /api/v1/workers/register
///
/// Sent by a worker on startup and again whenever the master asks it to
/// re-register. The declared running task IDs let the master reconcile
/// allocations that died with a previous worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker: WorkerInfo,
    #[serde(default)]
    pub running_task_ids: Vec<String>,
}

/// Response body for POST /api/v1/workers/register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub success: bool,
    pub message: String,
    /// Interval the worker should heartbeat at, in seconds
    pub heartbeat_interval_seconds: u64,
}

/// Request body for POST /api/v1/workers/heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub usage: WorkerUsage,
    #[serde(default)]
    pub running_tasks: Vec<RunningTaskInfo>,
    pub timestamp: u64,
}

/// Response body for POST /api/v1/workers/heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub status: String,
    /// True when the master has no attached record for this worker and wants
    /// a fresh registration handshake
    #[serde(default)]
    pub reregister: bool,
}

impl HeartbeatAck {
    pub fn accepted() -> Self {
        Self {
            status: "success".to_string(),
            reregister: false,
        }
    }

    pub fn reregister() -> Self {
        Self {
            status: "success".to_string(),
            reregister: true,
        }
    }
}

/// Terminal report for a task, POST /api/v1/tasks/report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultReport {
    pub task_id: String,
    pub worker_id: String,
    /// One of completed, failed, cancelled
    pub status: TaskStatus,
    /// Bounded log tail; failures carry the error text here
    #[serde(default)]
    pub logs: String,
    /// Relative paths of output files collected under /output
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Worker-side SLA verdict; absent means the master derives it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_success: Option<bool>,
    pub completed_at: u64,
}

/// Response body for POST /api/v1/tasks/report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultAck {
    pub status: String,
    pub recorded: bool,
}

impl ResultAck {
    pub fn recorded() -> Self {
        Self {
            status: "success".to_string(),
            recorded: true,
        }
    }

    /// Report was accepted but intentionally not persisted (duplicate or
    /// suppressed by cancellation)
    pub fn suppressed() -> Self {
        Self {
            status: "success".to_string(),
            recorded: false,
        }
    }
}

/// One chunk of a task's output artifact stream, POST /api/v1/files/upload
///
/// Chunks of one file arrive in order; `is_last` on the final chunk of the
/// final file closes the whole task stream and commits the file set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub task_id: String,
    pub user_id: String,
    pub relative_path: String,
    /// Gzip-compressed, base64-encoded payload
    pub data: String,
    pub is_last: bool,
}

/// Response body for POST /api/v1/files/upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAck {
    pub status: String,
    /// Set on the ack of a terminal chunk once the file set is committed
    #[serde(default)]
    pub committed: bool,
}

// Worker-hosted surface (master drives)

/// Request body for POST /api/v1/master/register on the worker
///
/// Tells the worker which master to initiate the registration handshake with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterInfo {
    pub master_id: String,
    /// Base URL of the master API
    pub address: String,
}

/// Request body for POST /api/v1/tasks/assign on the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTaskRequest {
    pub task: Task,
}

/// Request body for POST /api/v1/tasks/cancel on the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    pub task_id: String,
}

/// Generic acknowledgment from the worker control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAck {
    pub success: bool,
    pub message: String,
}

impl TaskAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn rejected(message: String) -> Self {
        Self {
            success: false,
            message,
        }
    }
}

/// One line of a streamed task log, GET /api/v1/tasks/{id}/logs
///
/// The stream body is newline-delimited JSON, one `LogLine` per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub content: String,
    pub timestamp: u64,
}

// Client boundary (submitters and admins)

/// Request body for POST /api/v1/tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    /// Optional client-supplied ID; the master mints one when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub user_id: String,
    /// Optional name; derived from the image when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub request: ResourceRequest,
    pub task_type: TaskType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tau_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_multiplier: Option<f64>,
}

/// Response body for POST /api/v1/tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    /// Position in the pending queue at admission time (zero-based)
    pub queue_position: usize,
}

/// Response body for GET /api/v1/tasks/{id}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task: Task,
    /// Worker currently or last holding the assignment, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
}

/// Request body for POST /api/v1/admin/workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerAdminRequest {
    pub worker_id: String,
    /// host:port with an explicit port
    pub address: String,
}

/// Worker summary in GET /api/v1/workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub address: String,
    pub is_active: bool,
    pub total: ResourceRequest,
    pub allocated: ResourceRequest,
    pub available: ResourceRequest,
    pub running_tasks: Vec<String>,
    pub usage: WorkerUsage,
    pub last_heartbeat: u64,
}

/// HTTP headers used for authentication and metadata
pub mod headers {
    pub const API_KEY: &str = "X-API-Key";
    pub const WORKER_ID: &str = "X-Worker-Id";
    pub const USER_ID: &str = "X-User-Id";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// API endpoint paths
pub mod endpoints {
    // Master-hosted
    pub const WORKER_REGISTER: &str = "/api/v1/workers/register";
    pub const WORKER_HEARTBEAT: &str = "/api/v1/workers/heartbeat";
    pub const TASK_REPORT: &str = "/api/v1/tasks/report";
    pub const FILE_UPLOAD: &str = "/api/v1/files/upload";
    pub const TASK_SUBMIT: &str = "/api/v1/tasks";
    pub const WORKER_LIST: &str = "/api/v1/workers";
    pub const PARAMS: &str = "/api/v1/params";
    pub const ADMIN_WORKERS: &str = "/api/v1/admin/workers";

    // Worker-hosted
    pub const MASTER_REGISTER: &str = "/api/v1/master/register";
    pub const TASK_ASSIGN: &str = "/api/v1/tasks/assign";
    pub const TASK_CANCEL: &str = "/api/v1/tasks/cancel";

    pub const HEALTH: &str = "/health";
}
