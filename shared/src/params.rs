//! Scheduler parameter bundle
//!
//! The trainer periodically publishes a bundle of scheduling parameters to a
//! JSON file; the risk-aware scheduler polls and hot-reloads it. Readers
//! validate every field range before swapping a bundle in, so a malformed or
//! partially written file can never replace a good one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Number of execution-time coefficients (cpu, mem, gpu contention + load)
pub const THETA_LEN: usize = 4;

/// Affinity scores are clipped into this range
pub const AFFINITY_MIN: f64 = -5.0;
pub const AFFINITY_MAX: f64 = 5.0;

/// Upper bound accepted for theta coefficients
pub const THETA_MAX: f64 = 2.0;

/// Upper bound accepted for the alpha and beta risk weights
pub const RISK_WEIGHT_MAX: f64 = 100.0;

/// Hot-reloadable parameter set consumed by the risk-aware scheduler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterBundle {
    /// Execution-time coefficients: cpu, mem, gpu contention and load terms
    pub theta: [f64; THETA_LEN],
    /// Deadline-violation weight in the base risk score
    pub alpha: f64,
    /// Load weight in the base risk score
    pub beta: f64,
    /// task-type -> worker_id -> preference score in [-5, 5]
    #[serde(default)]
    pub affinity: HashMap<String, HashMap<String, f64>>,
    /// worker_id -> avoidance score >= 0
    #[serde(default)]
    pub penalty: HashMap<String, f64>,
    /// Fitness weights: SLA, utilization, energy, overload
    pub fitness_weights: [f64; 4],
    /// Epoch timestamp of the publishing trainer run (Unix seconds)
    pub generated_at: u64,
}

impl Default for ParameterBundle {
    fn default() -> Self {
        Self {
            theta: [0.1; THETA_LEN],
            alpha: 10.0,
            beta: 1.0,
            affinity: HashMap::new(),
            penalty: HashMap::new(),
            fitness_weights: [3.0, 1.0, 0.5, 1.5],
            generated_at: 0,
        }
    }
}

impl ParameterBundle {
    /// Affinity for a (task type, worker) pair; missing entries score zero
    pub fn affinity_for(&self, task_type: &str, worker_id: &str) -> f64 {
        self.affinity
            .get(task_type)
            .and_then(|row| row.get(worker_id))
            .copied()
            .unwrap_or(0.0)
    }

    /// Penalty for a worker; missing entries score zero
    pub fn penalty_for(&self, worker_id: &str) -> f64 {
        self.penalty.get(worker_id).copied().unwrap_or(0.0)
    }

    /// Validate every field range
    ///
    /// Rejects: theta outside [0, 2], alpha/beta outside [0, 100], affinity
    /// outside [-5, 5], negative penalties, and any non-finite value.
    pub fn validate(&self) -> crate::Result<()> {
        for (i, theta) in self.theta.iter().enumerate() {
            if !theta.is_finite() || *theta < 0.0 || *theta > THETA_MAX {
                return Err(crate::OrchestratorError::Validation(format!(
                    "theta[{}] = {} outside [0, {}]",
                    i, theta, THETA_MAX
                ))
                .into());
            }
        }

        for (name, value) in [("alpha", self.alpha), ("beta", self.beta)] {
            if !value.is_finite() || value < 0.0 || value > RISK_WEIGHT_MAX {
                return Err(crate::OrchestratorError::Validation(format!(
                    "{} = {} outside [0, {}]",
                    name, value, RISK_WEIGHT_MAX
                ))
                .into());
            }
        }

        for (task_type, row) in &self.affinity {
            for (worker_id, score) in row {
                if !score.is_finite() || *score < AFFINITY_MIN || *score > AFFINITY_MAX {
                    return Err(crate::OrchestratorError::Validation(format!(
                        "affinity[{}][{}] = {} outside [{}, {}]",
                        task_type, worker_id, score, AFFINITY_MIN, AFFINITY_MAX
                    ))
                    .into());
                }
            }
        }

        for (worker_id, penalty) in &self.penalty {
            if !penalty.is_finite() || *penalty < 0.0 {
                return Err(crate::OrchestratorError::Validation(format!(
                    "penalty[{}] = {} must be a finite non-negative value",
                    worker_id, penalty
                ))
                .into());
            }
        }

        for (i, weight) in self.fitness_weights.iter().enumerate() {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(crate::OrchestratorError::Validation(format!(
                    "fitness_weights[{}] = {} must be a finite non-negative value",
                    i, weight
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Load and validate a bundle from a JSON file
    ///
    /// Any parse or validation failure surfaces as an error; callers keep
    /// their previous bundle in that case.
    pub fn load(path: &Path) -> crate::Result<ParameterBundle> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::OrchestratorError::Config(format!(
                "Failed to read parameter file {}: {}",
                path.display(),
                e
            ))
        })?;

        let bundle: ParameterBundle = serde_json::from_str(&content).map_err(|e| {
            crate::OrchestratorError::Config(format!(
                "Malformed parameter file {}: {}",
                path.display(),
                e
            ))
        })?;

        bundle.validate()?;
        Ok(bundle)
    }

    /// Publish a bundle atomically: write to a temp file in the same
    /// directory, then rename over the target. The previous bundle, when
    /// present, is preserved as `<path>.prev` for rollback.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::OrchestratorError::Config(format!(
                        "Failed to create parameter directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        // Keep one epoch of history for rollback
        if path.exists() {
            let prev = path.with_extension("json.prev");
            if let Err(e) = std::fs::copy(path, &prev) {
                warn!(
                    "Failed to preserve previous parameter bundle at {}: {}",
                    prev.display(),
                    e
                );
            }
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| {
            crate::OrchestratorError::Config(format!("Failed to serialize parameter bundle: {}", e))
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| {
            crate::OrchestratorError::Config(format!(
                "Failed to write parameter file {}: {}",
                tmp.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp, path).map_err(|e| {
            crate::OrchestratorError::Config(format!(
                "Failed to move parameter file into place at {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(
            path = %path.display(),
            generated_at = self.generated_at,
            "Published parameter bundle"
        );
        Ok(())
    }
}
