//! Task data model for the orchestration system
//!
//! This module defines the task submission record, its status lattice, the
//! resource request vector, and the SLA deadline arithmetic shared by the
//! master scheduler and the worker executor.

use crate::defaults::{default_sla_multiplier, max_sla_multiplier, min_sla_multiplier};
use serde::{Deserialize, Serialize};

/// Workload classification used for scheduling affinity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CpuLight,
    CpuHeavy,
    MemoryHeavy,
    GpuHeavy,
    GpuTraining,
    Mixed,
}

impl TaskType {
    /// Stable string form used as the affinity matrix key
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CpuLight => "cpu-light",
            TaskType::CpuHeavy => "cpu-heavy",
            TaskType::MemoryHeavy => "memory-heavy",
            TaskType::GpuHeavy => "gpu-heavy",
            TaskType::GpuTraining => "gpu-training",
            TaskType::Mixed => "mixed",
        }
    }
}

/// Lifecycle states of a task
///
/// Transitions follow `pending -> queued -> running -> {completed | failed |
/// cancelled}`. Terminal states are absorbing; once `cancelled` is recorded
/// no later write may move the task away from it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the lattice admits a transition from `self` to `next`
    ///
    /// Any state may move to `cancelled` except the other terminal states.
    /// A dispatch rollback is the one sanctioned backward edge
    /// (`running -> queued`).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            TaskStatus::Pending => matches!(next, TaskStatus::Queued | TaskStatus::Cancelled),
            TaskStatus::Queued => matches!(next, TaskStatus::Running | TaskStatus::Cancelled),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Cancelled
                    | TaskStatus::Queued
            ),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => false,
        }
    }

    /// Stable string form used in the store and in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the store string form back into a status
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// Requested resource vector for a task
///
/// CPU and GPU are counted in cores/devices (fractional CPU allowed), memory
/// and storage in megabytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceRequest {
    pub cpu: f64,
    pub mem_mb: f64,
    pub storage_mb: f64,
    pub gpu: f64,
}

impl ResourceRequest {
    pub fn new(cpu: f64, mem_mb: f64, storage_mb: f64, gpu: f64) -> Self {
        Self {
            cpu,
            mem_mb,
            storage_mb,
            gpu,
        }
    }

    /// Whether `available` covers this request on every resource.
    /// Equality admits: a worker with exactly the requested amount is feasible.
    pub fn fits_within(&self, available: &ResourceRequest) -> bool {
        available.cpu >= self.cpu
            && available.mem_mb >= self.mem_mb
            && available.storage_mb >= self.storage_mb
            && available.gpu >= self.gpu
    }

    /// Component-wise addition
    pub fn plus(&self, other: &ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            cpu: self.cpu + other.cpu,
            mem_mb: self.mem_mb + other.mem_mb,
            storage_mb: self.storage_mb + other.storage_mb,
            gpu: self.gpu + other.gpu,
        }
    }

    /// Component-wise subtraction clamped to zero.
    /// The clamp is a defense; reserve/release pairs are exact.
    pub fn minus_clamped(&self, other: &ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            cpu: (self.cpu - other.cpu).max(0.0),
            mem_mb: (self.mem_mb - other.mem_mb).max(0.0),
            storage_mb: (self.storage_mb - other.storage_mb).max(0.0),
            gpu: (self.gpu - other.gpu).max(0.0),
        }
    }

    /// All components non-negative and finite
    pub fn is_valid(&self) -> bool {
        [self.cpu, self.mem_mb, self.storage_mb, self.gpu]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.mem_mb == 0.0 && self.storage_mb == 0.0 && self.gpu == 0.0
    }
}

/// A unit of work: an immutable submission plus mutable lifecycle fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task identifier
    pub task_id: String,
    /// Submitting user
    pub user_id: String,
    /// Human-readable name (user-supplied or derived from the image)
    pub task_name: String,
    /// Container image reference
    pub image: String,
    /// Container command; empty means the image default entrypoint
    #[serde(default)]
    pub command: Vec<String>,
    /// Requested resources
    pub request: ResourceRequest,
    /// Workload classification
    pub task_type: TaskType,
    /// Expected runtime in seconds, when the submitter knows it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tau_seconds: Option<f64>,
    /// SLA deadline multiplier k, valid range 1.5 to 2.5
    #[serde(default = "default_sla_multiplier")]
    pub sla_multiplier: f64,
    /// Submission wall-clock time (Unix seconds)
    pub submitted_at: u64,

    // Mutable lifecycle fields
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl Task {
    /// Clamp the SLA multiplier into its valid range
    pub fn clamp_sla_multiplier(k: f64) -> f64 {
        if !k.is_finite() {
            return default_sla_multiplier();
        }
        k.clamp(min_sla_multiplier(), max_sla_multiplier())
    }

    /// SLA deadline `submitted_at + k * tau`, when tau is known
    pub fn deadline(&self) -> Option<u64> {
        self.tau_seconds
            .map(|tau| self.submitted_at + (self.sla_multiplier * tau).round() as u64)
    }

    /// Whether a completion at `completed_at` meets the SLA.
    /// Completion exactly at the deadline is a success. Tasks without a
    /// deadline always succeed.
    pub fn meets_sla(&self, completed_at: u64) -> bool {
        match self.deadline() {
            Some(deadline) => completed_at <= deadline,
            None => true,
        }
    }

    /// Validate the immutable submission fields
    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validate_task_id(&self.task_id)?;

        if self.user_id.is_empty() {
            return Err(crate::OrchestratorError::Validation(
                "Task user_id cannot be empty".to_string(),
            )
            .into());
        }

        if self.image.is_empty() {
            return Err(crate::OrchestratorError::Validation(
                "Task image cannot be empty".to_string(),
            )
            .into());
        }

        if !self.request.is_valid() {
            return Err(crate::OrchestratorError::Validation(format!(
                "Task '{}' has an invalid resource request",
                self.task_id
            ))
            .into());
        }

        if let Some(tau) = self.tau_seconds {
            if !tau.is_finite() || tau <= 0.0 {
                return Err(crate::OrchestratorError::Validation(format!(
                    "Task '{}' has an invalid expected runtime",
                    self.task_id
                ))
                .into());
            }
        }

        if self.sla_multiplier < min_sla_multiplier() || self.sla_multiplier > max_sla_multiplier()
        {
            return Err(crate::OrchestratorError::Validation(format!(
                "Task '{}' has SLA multiplier {} outside [{}, {}]",
                self.task_id,
                self.sla_multiplier,
                min_sla_multiplier(),
                max_sla_multiplier()
            ))
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            task_id: "task-1".to_string(),
            user_id: "alice".to_string(),
            task_name: "hello".to_string(),
            image: "hello-world:latest".to_string(),
            command: vec![],
            request: ResourceRequest::new(1.0, 512.0, 1024.0, 0.0),
            task_type: TaskType::CpuLight,
            tau_seconds: Some(60.0),
            sla_multiplier: 2.0,
            submitted_at: 1_000,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_status_lattice_forward_edges() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        // Dispatch rollback is the one backward edge
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} -> {:?} must be rejected",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("exploded"), None);
    }

    #[test]
    fn test_feasibility_boundary() {
        let req = ResourceRequest::new(2.0, 1024.0, 0.0, 1.0);
        let exact = ResourceRequest::new(2.0, 1024.0, 0.0, 1.0);
        let short = ResourceRequest::new(2.0, 1023.9, 0.0, 1.0);
        // Equality admits, any shortfall rejects
        assert!(req.fits_within(&exact));
        assert!(!req.fits_within(&short));
    }

    #[test]
    fn test_resource_arithmetic_round_trip() {
        let total = ResourceRequest::new(8.0, 16_384.0, 500_000.0, 2.0);
        let req = ResourceRequest::new(1.0, 512.0, 1024.0, 0.0);
        let after = total.minus_clamped(&req).plus(&req);
        assert_eq!(after, total);
    }

    #[test]
    fn test_minus_clamps_to_zero() {
        let small = ResourceRequest::new(1.0, 100.0, 0.0, 0.0);
        let big = ResourceRequest::new(4.0, 1000.0, 10.0, 1.0);
        let out = small.minus_clamped(&big);
        assert!(out.is_zero());
    }

    #[test]
    fn test_deadline_and_sla() {
        let task = sample_task();
        // deadline = 1000 + 2.0 * 60 = 1120
        assert_eq!(task.deadline(), Some(1_120));
        assert!(task.meets_sla(1_120));
        assert!(!task.meets_sla(1_121));

        let mut no_tau = sample_task();
        no_tau.tau_seconds = None;
        assert_eq!(no_tau.deadline(), None);
        assert!(no_tau.meets_sla(u64::MAX));
    }

    #[test]
    fn test_clamp_sla_multiplier() {
        assert_eq!(Task::clamp_sla_multiplier(2.0), 2.0);
        assert_eq!(Task::clamp_sla_multiplier(1.0), 1.5);
        assert_eq!(Task::clamp_sla_multiplier(9.0), 2.5);
        assert_eq!(Task::clamp_sla_multiplier(f64::NAN), 2.0);
    }

    #[test]
    fn test_validate_rejects_bad_submissions() {
        let mut task = sample_task();
        task.image = String::new();
        assert!(task.validate().is_err());

        let mut task = sample_task();
        task.request.cpu = -1.0;
        assert!(task.validate().is_err());

        let mut task = sample_task();
        task.tau_seconds = Some(0.0);
        assert!(task.validate().is_err());

        let mut task = sample_task();
        task.sla_multiplier = 3.0;
        assert!(task.validate().is_err());

        assert!(sample_task().validate().is_ok());
    }

    #[test]
    fn test_task_type_serde_form() {
        let json = serde_json::to_string(&TaskType::GpuHeavy).unwrap();
        assert_eq!(json, "\"gpu-heavy\"");
        let parsed: TaskType = serde_json::from_str("\"memory-heavy\"").unwrap();
        assert_eq!(parsed, TaskType::MemoryHeavy);
    }
}
