//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the configuration
//! structures. These functions are used by serde when deserializing configuration
//! files that don't specify certain optional fields.

// Timing defaults shared by master and worker

/// Default worker heartbeat interval (5 seconds)
pub fn default_heartbeat_interval() -> u64 {
    5
}

/// Default liveness timeout before a silent worker is marked inactive
/// (30 seconds, must stay above 5x the heartbeat interval)
pub fn default_liveness_timeout() -> u64 {
    30
}

/// Default assignment loop tick (5 seconds)
pub fn default_queue_tick() -> u64 {
    5
}

/// Default reconnection monitor period (30 seconds)
pub fn default_reconnect_tick() -> u64 {
    30
}

/// Default timeout for a single reconnect probe attempt (3 seconds)
pub fn default_reconnect_probe_timeout() -> u64 {
    3
}

/// Default master-to-worker cancellation timeout (30 seconds, covers the
/// graceful-then-forceful container stop plus network round trip)
pub fn default_cancel_timeout() -> u64 {
    30
}

/// Default container SIGTERM grace window before SIGKILL (10 seconds)
pub fn default_graceful_stop() -> u64 {
    10
}

/// Default master-to-worker task assignment timeout (10 seconds)
pub fn default_assign_timeout() -> u64 {
    10
}

/// Default scheduler parameter file reload interval (30 seconds)
pub fn default_param_reload_interval() -> u64 {
    30
}

// Trainer defaults

/// Default trainer epoch period (60 seconds)
pub fn default_trainer_epoch() -> u64 {
    60
}

/// Default history window consumed by the trainer (24 hours)
pub fn default_trainer_window_seconds() -> u64 {
    86400
}

/// Default minimum number of history records required before training
pub fn default_min_history() -> usize {
    10
}

// Channel and transfer defaults

/// Default per-worker heartbeat buffer capacity
pub fn default_heartbeat_buffer() -> usize {
    10
}

/// Default file upload chunk size (1 MiB)
pub fn default_file_chunk_bytes() -> usize {
    1024 * 1024
}

/// Default maximum log tail retained for a task result (64 KiB)
pub fn default_log_tail_bytes() -> usize {
    64 * 1024
}

/// Default per-subscriber log stream buffer capacity
pub fn default_log_subscriber_buffer() -> usize {
    256
}

// SLA defaults

/// Default SLA deadline multiplier
pub fn default_sla_multiplier() -> f64 {
    2.0
}

/// Lowest accepted SLA multiplier
pub fn min_sla_multiplier() -> f64 {
    1.5
}

/// Highest accepted SLA multiplier
pub fn max_sla_multiplier() -> f64 {
    2.5
}

// Master configuration defaults

/// Default SQLite busy timeout (5 seconds)
pub fn default_database_busy_timeout() -> u64 {
    5
}

/// Default graceful shutdown timeout for either binary (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

/// Default retention for task history and results (30 days)
pub fn default_data_retention_days() -> u32 {
    30
}

/// Default data cleanup interval (24 hours, in seconds)
pub fn default_cleanup_interval_seconds() -> u64 {
    86400
}

/// Default initial cleanup delay on master startup (1 hour)
pub fn default_initial_cleanup_delay() -> u64 {
    3600
}

/// Default maximum retries for the worker result report
pub fn default_report_max_retries() -> u32 {
    3
}

// Worker configuration defaults

/// Default HTTP client timeout for worker-to-master calls (30 seconds)
pub fn default_http_client_timeout() -> u64 {
    30
}

/// Default host directory holding per-task output bind mounts
pub fn default_output_root() -> String {
    "/var/lib/taskworker/output".to_string()
}
