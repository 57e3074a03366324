//! Configuration types and validation for the orchestration system
//!
//! This module defines the configuration structures used by the master and
//! worker binaries, including validation logic and serialization support.

use crate::defaults::*;
use serde::{Deserialize, Serialize};

/// Main master configuration loaded from master.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterConfig {
    /// Address the master API listens on (ip:port)
    pub listen_address: String,
    /// Pre-shared secret key authenticating workers and clients
    pub api_key: String,
    /// Users allowed to access any user's artifacts and admin endpoints
    #[serde(default)]
    pub admin_users: Vec<String>,
    /// Root directory for received task artifacts; empty selects the
    /// platform default with a home-directory fallback
    #[serde(default)]
    pub artifact_root: String,
    /// Path of the scheduler parameter bundle file
    #[serde(default = "default_param_file")]
    pub param_file: String,
    /// Scheduling strategy: "rts" or "round-robin"
    #[serde(default = "default_scheduler")]
    pub scheduler: String,

    // Liveness and loop cadence
    /// Seconds without a heartbeat before a worker is marked inactive
    /// (default: 30, must be at least 5x the heartbeat interval)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_seconds: u64,
    /// Heartbeat interval advertised to workers (default: 5)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Assignment loop tick (default: 5)
    #[serde(default = "default_queue_tick")]
    pub queue_tick_seconds: u64,
    /// Reconnection monitor period (default: 30)
    #[serde(default = "default_reconnect_tick")]
    pub reconnect_tick_seconds: u64,
    /// Timeout for one reconnect probe (default: 3)
    #[serde(default = "default_reconnect_probe_timeout")]
    pub reconnect_probe_timeout_seconds: u64,
    /// Scheduler parameter reload interval (default: 30)
    #[serde(default = "default_param_reload_interval")]
    pub param_reload_interval_seconds: u64,

    // Outbound RPC timeouts
    /// Task assignment send timeout (default: 10)
    #[serde(default = "default_assign_timeout")]
    pub assign_timeout_seconds: u64,
    /// Cancellation send timeout (default: 30, covers graceful container stop)
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_seconds: u64,

    // Trainer
    /// Trainer epoch period (default: 60)
    #[serde(default = "default_trainer_epoch")]
    pub trainer_epoch_seconds: u64,
    /// History window consumed per epoch (default: 86400)
    #[serde(default = "default_trainer_window_seconds")]
    pub trainer_window_seconds: u64,
    /// Minimum history records before training (default: 10)
    #[serde(default = "default_min_history")]
    pub trainer_min_history: usize,

    // Telemetry
    /// Per-worker heartbeat buffer capacity (default: 10)
    #[serde(default = "default_heartbeat_buffer")]
    pub heartbeat_buffer_capacity: usize,

    // Data management
    /// SQLite busy timeout in seconds (default: 5)
    #[serde(default = "default_database_busy_timeout")]
    pub database_busy_timeout_seconds: u64,
    /// Days of task history and results retained (default: 30)
    #[serde(default = "default_data_retention_days")]
    pub data_retention_days: u32,
    /// Cleanup pass interval in seconds (default: 86400)
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Delay before the first cleanup pass (default: 3600)
    #[serde(default = "default_initial_cleanup_delay")]
    pub initial_cleanup_delay_seconds: u64,

    // Shutdown behavior
    /// Wait time for background loops during shutdown (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
}

fn default_param_file() -> String {
    "./data/scheduler_params.json".to_string()
}

fn default_scheduler() -> String {
    "rts".to_string()
}

impl MasterConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(crate::OrchestratorError::Config(format!(
                "Invalid listen address '{}'",
                self.listen_address
            ))
            .into());
        }

        if self.api_key.is_empty() {
            return Err(
                crate::OrchestratorError::Config("api_key cannot be empty".to_string()).into(),
            );
        }

        if self.scheduler != "rts" && self.scheduler != "round-robin" {
            return Err(crate::OrchestratorError::Config(format!(
                "Unknown scheduler '{}': expected 'rts' or 'round-robin'",
                self.scheduler
            ))
            .into());
        }

        if self.liveness_timeout_seconds < 5 * self.heartbeat_interval_seconds {
            return Err(crate::OrchestratorError::Config(format!(
                "liveness_timeout_seconds ({}) must be at least 5x heartbeat_interval_seconds ({})",
                self.liveness_timeout_seconds, self.heartbeat_interval_seconds
            ))
            .into());
        }

        Ok(())
    }

    /// Whether the given user may act as an administrator
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_users.iter().any(|admin| admin == user_id)
    }
}

/// Main worker configuration loaded from worker.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique identifier for this worker
    pub worker_id: String,
    /// Base URL of the master API
    pub master_url: String,
    /// Pre-shared secret key for authentication
    pub api_key: String,
    /// Address this worker's control API listens on (ip:port)
    pub listen_address: String,
    /// Address advertised to the master; defaults to listen_address when empty
    #[serde(default)]
    pub advertise_address: String,

    // Capacity overrides; zero means "probe the host"
    /// Override the probed CPU core count
    #[serde(default)]
    pub total_cpu: f64,
    /// Override the probed memory size in MB
    #[serde(default)]
    pub total_mem_mb: f64,
    /// Declared scratch storage in MB (not probed)
    #[serde(default = "default_storage_mb")]
    pub total_storage_mb: f64,
    /// Declared GPU device count (not probed; GPU telemetry is external)
    #[serde(default)]
    pub total_gpu: f64,

    /// Host directory holding per-task output bind mounts
    #[serde(default = "default_output_root")]
    pub output_root: String,

    // Cadence and timeouts
    /// Heartbeat interval in seconds (default: 5)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Container SIGTERM grace window before SIGKILL (default: 10)
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop_seconds: u64,
    /// HTTP client timeout for master calls (default: 30)
    #[serde(default = "default_http_client_timeout")]
    pub http_client_timeout_seconds: u64,
    /// Upload chunk size in bytes (default: 1 MiB)
    #[serde(default = "default_file_chunk_bytes")]
    pub file_chunk_bytes: usize,
    /// Log tail retained for task results, in bytes (default: 64 KiB)
    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: usize,
    /// Per-subscriber log stream buffer (default: 256 lines)
    #[serde(default = "default_log_subscriber_buffer")]
    pub log_subscriber_buffer: usize,
    /// Retries for the final result report (default: 3)
    #[serde(default = "default_report_max_retries")]
    pub report_max_retries: u32,
    /// Wait time for in-flight work during shutdown (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
}

fn default_storage_mb() -> f64 {
    100_000.0
}

impl WorkerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validate_worker_id(&self.worker_id)?;
        crate::utils::validate_master_url(&self.master_url)?;

        if self.api_key.is_empty() {
            return Err(
                crate::OrchestratorError::Config("api_key cannot be empty".to_string()).into(),
            );
        }

        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(crate::OrchestratorError::Config(format!(
                "Invalid listen address '{}'",
                self.listen_address
            ))
            .into());
        }

        if !self.advertise_address.is_empty() {
            crate::utils::validate_worker_address(&self.advertise_address)?;
        }

        if self.file_chunk_bytes == 0 {
            return Err(crate::OrchestratorError::Config(
                "file_chunk_bytes must be positive".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Address the worker should advertise to the master
    pub fn effective_address(&self) -> &str {
        if self.advertise_address.is_empty() {
            &self.listen_address
        } else {
            &self.advertise_address
        }
    }
}
