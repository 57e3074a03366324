//! Worker wire types shared between master and worker
//!
//! These structures describe a worker as it presents itself over the wire:
//! declared capacity at registration and instantaneous usage in heartbeats.
//! The master's authoritative worker record lives in the master crate; the
//! worker's own view is advisory.

use crate::task::{ResourceRequest, TaskStatus};
use serde::{Deserialize, Serialize};

/// Capacity declaration sent by a worker when it registers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    /// Unique worker identifier
    pub worker_id: String,
    /// Reachable address as host:port; the port is always explicit
    pub address: String,
    /// Total CPU cores
    pub total_cpu: f64,
    /// Total memory in megabytes
    pub total_mem_mb: f64,
    /// Total scratch storage in megabytes
    pub total_storage_mb: f64,
    /// Total GPU devices
    pub total_gpu: f64,
}

impl WorkerInfo {
    /// Declared capacity as a resource vector
    pub fn capacity(&self) -> ResourceRequest {
        ResourceRequest::new(
            self.total_cpu,
            self.total_mem_mb,
            self.total_storage_mb,
            self.total_gpu,
        )
    }

    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validate_worker_id(&self.worker_id)?;
        crate::utils::validate_worker_address(&self.address)?;
        if !self.capacity().is_valid() {
            return Err(crate::OrchestratorError::Validation(format!(
                "Worker '{}' declared an invalid capacity",
                self.worker_id
            ))
            .into());
        }
        Ok(())
    }
}

/// Instantaneous usage percentages carried by heartbeats, range 0 to 100
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerUsage {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub gpu_percent: f64,
}

impl WorkerUsage {
    /// Clamp each component into the 0 to 100 range, mapping non-finite
    /// readings to zero
    pub fn clamped(&self) -> WorkerUsage {
        let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 };
        WorkerUsage {
            cpu_percent: clamp(self.cpu_percent),
            mem_percent: clamp(self.mem_percent),
            gpu_percent: clamp(self.gpu_percent),
        }
    }
}

/// Per-task entry in a heartbeat's running-set snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningTaskInfo {
    pub task_id: String,
    /// Resources the worker believes the task holds
    pub allocated: ResourceRequest,
    pub status: TaskStatus,
}
