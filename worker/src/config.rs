//! Configuration management for the worker node
//!
//! This module handles loading and validation of worker configuration from a
//! `worker.toml` file.

use anyhow::{Context, Result};
use shared::config::WorkerConfig;
use std::path::PathBuf;
use tracing::{debug, info};

/// The expected name of the configuration file.
const WORKER_CONFIG_FILE: &str = "worker.toml";

/// Manages the worker's configuration.
pub struct ConfigManager {
    /// The full path to the configuration file.
    pub config_path: PathBuf,
    /// The loaded and validated worker configuration.
    pub worker_config: Option<WorkerConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the configuration.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join(WORKER_CONFIG_FILE)
        } else {
            config_path
        };

        if !config_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                config_path.display()
            ));
        }

        let mut manager = Self {
            config_path,
            worker_config: None,
        };
        manager.load_config()?;
        Ok(manager)
    }

    /// Loads the configuration file from disk, parses, and validates it.
    pub fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading worker configuration from {}",
            self.config_path.display()
        );

        let config_content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let worker_config: WorkerConfig = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        worker_config.validate().with_context(|| {
            format!(
                "Invalid worker configuration in {}",
                self.config_path.display()
            )
        })?;

        debug!("Worker configuration parameters (including defaults):");
        debug!("  worker_id: {}", worker_config.worker_id);
        debug!("  master_url: {}", worker_config.master_url);
        debug!("  listen_address: {}", worker_config.listen_address);
        debug!("  output_root: {}", worker_config.output_root);
        debug!(
            "  heartbeat_interval_seconds: {}",
            worker_config.heartbeat_interval_seconds
        );
        debug!(
            "  graceful_stop_seconds: {}",
            worker_config.graceful_stop_seconds
        );
        debug!("  file_chunk_bytes: {}", worker_config.file_chunk_bytes);

        self.worker_config = Some(worker_config);
        Ok(())
    }

    /// Applies in-memory command-line overrides.
    pub fn apply_overrides(
        &mut self,
        worker_id: Option<String>,
        master_url: Option<String>,
        api_key: Option<String>,
        listen_address: Option<String>,
    ) -> Result<()> {
        let config = self
            .worker_config
            .as_mut()
            .expect("Worker configuration not loaded. Call load_config() first.");

        if let Some(worker_id) = worker_id {
            config.worker_id = worker_id;
        }
        if let Some(master_url) = master_url {
            config.master_url = master_url;
        }
        if let Some(api_key) = api_key {
            config.api_key = api_key;
        }
        if let Some(listen_address) = listen_address {
            config.listen_address = listen_address;
        }

        config
            .validate()
            .context("Configuration invalid after applying overrides")
    }
}
