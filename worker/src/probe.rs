//! Host capacity and usage probing
//!
//! The worker declares its capacity at registration from its own system
//! probe; configuration can override any component. Storage and GPUs are
//! declared rather than probed, since their telemetry lives outside this
//! binary. Heartbeats carry instantaneous usage sampled here.

use shared::config::WorkerConfig;
use shared::worker::{WorkerInfo, WorkerUsage};
use sysinfo::System;
use tracing::info;

/// Declared capacity from the host probe plus configuration overrides.
pub fn probe_capacity(config: &WorkerConfig) -> WorkerInfo {
    let mut system = System::new_all();
    system.refresh_all();

    let probed_cpu = system.cpus().len() as f64;
    let probed_mem_mb = system.total_memory() as f64 / (1024.0 * 1024.0);

    let total_cpu = if config.total_cpu > 0.0 {
        config.total_cpu
    } else {
        probed_cpu
    };
    let total_mem_mb = if config.total_mem_mb > 0.0 {
        config.total_mem_mb
    } else {
        probed_mem_mb
    };

    let info = WorkerInfo {
        worker_id: config.worker_id.clone(),
        address: config.effective_address().to_string(),
        total_cpu,
        total_mem_mb,
        total_storage_mb: config.total_storage_mb,
        total_gpu: config.total_gpu,
    };
    info!(
        cpu = info.total_cpu,
        mem_mb = info.total_mem_mb,
        storage_mb = info.total_storage_mb,
        gpu = info.total_gpu,
        "Probed worker capacity"
    );
    info
}

/// Reusable usage sampler for heartbeats
pub struct UsageProbe {
    system: System,
}

impl UsageProbe {
    pub fn new() -> Self {
        let mut system = System::new_all();
        // First CPU reading needs a baseline refresh
        system.refresh_cpu();
        Self { system }
    }

    /// Sample instantaneous usage percentages. GPU usage stays zero; its
    /// telemetry comes from an external backend when one is wired in.
    pub fn sample(&mut self) -> WorkerUsage {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_info().cpu_usage() as f64;
        let total = self.system.total_memory() as f64;
        let mem_percent = if total > 0.0 {
            self.system.used_memory() as f64 / total * 100.0
        } else {
            0.0
        };

        WorkerUsage {
            cpu_percent,
            mem_percent,
            gpu_percent: 0.0,
        }
        .clamped()
    }
}

impl Default for UsageProbe {
    fn default() -> Self {
        Self::new()
    }
}
