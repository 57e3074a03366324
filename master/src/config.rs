//! Configuration management for the master coordinator
//!
//! This module handles loading, validation, and management of master
//! configuration from a `master.toml` file.

use anyhow::{Context, Result};
use shared::config::MasterConfig;
use std::path::PathBuf;
use tracing::{debug, info};

/// The expected name of the configuration file.
const MASTER_CONFIG_FILE: &str = "master.toml";

/// Manages the master's configuration.
/// This struct is responsible for the lifecycle of the master configuration:
/// initial loading, validation, and persisting command-line overrides.
pub struct ConfigManager {
    /// The full path to the configuration file.
    pub config_path: PathBuf,
    /// The loaded and validated master configuration, wrapped in an `Option`
    /// to represent the unloaded state, although the constructor ensures it's
    /// always `Some` on success.
    pub master_config: Option<MasterConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the configuration.
    /// This design ensures that a `ConfigManager` instance is always in a
    /// valid, loaded state if successfully created.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        // Accept either a directory containing master.toml or a direct path.
        let config_path = if config_path.is_dir() {
            config_path.join(MASTER_CONFIG_FILE)
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
            master_config: None,
        };
        manager.load_config()?;
        Ok(manager)
    }

    /// Loads the configuration file from disk, parses, and validates it.
    pub fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading master configuration from {}",
            self.config_path.display()
        );

        let config_content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let master_config: MasterConfig = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        master_config.validate().with_context(|| {
            format!(
                "Invalid master configuration in {}",
                self.config_path.display()
            )
        })?;

        debug!("Master configuration parameters (including defaults):");
        debug!("  listen_address: {}", master_config.listen_address);
        debug!(
            "  api_key: {}",
            if master_config.api_key.is_empty() {
                "<empty>"
            } else {
                "<redacted>"
            }
        );
        debug!("  scheduler: {}", master_config.scheduler);
        debug!("  param_file: {}", master_config.param_file);
        debug!(
            "  liveness_timeout_seconds: {}",
            master_config.liveness_timeout_seconds
        );
        debug!("  queue_tick_seconds: {}", master_config.queue_tick_seconds);
        debug!(
            "  reconnect_tick_seconds: {}",
            master_config.reconnect_tick_seconds
        );
        debug!(
            "  trainer_epoch_seconds: {}",
            master_config.trainer_epoch_seconds
        );
        debug!(
            "  trainer_window_seconds: {}",
            master_config.trainer_window_seconds
        );
        debug!("  admin_users: {:?}", master_config.admin_users);

        self.master_config = Some(master_config);
        Ok(())
    }

    /// Applies command-line overrides and persists the merged configuration
    /// back to disk when anything changed. Returns whether a change was made.
    pub fn override_and_persist_config(
        &mut self,
        listen_address: Option<String>,
        api_key: Option<String>,
        scheduler: Option<String>,
        param_file: Option<String>,
    ) -> Result<bool> {
        let config = self
            .master_config
            .as_mut()
            .expect("Master configuration not loaded. This should not happen as config is loaded in new().");

        let mut changed = false;
        if let Some(listen_address) = listen_address {
            if config.listen_address != listen_address {
                config.listen_address = listen_address;
                changed = true;
            }
        }
        if let Some(api_key) = api_key {
            if config.api_key != api_key {
                config.api_key = api_key;
                changed = true;
            }
        }
        if let Some(scheduler) = scheduler {
            if config.scheduler != scheduler {
                config.scheduler = scheduler;
                changed = true;
            }
        }
        if let Some(param_file) = param_file {
            if config.param_file != param_file {
                config.param_file = param_file;
                changed = true;
            }
        }

        if !changed {
            return Ok(false);
        }

        config
            .validate()
            .context("Configuration invalid after applying overrides")?;

        let serialized =
            toml::to_string_pretty(config).context("Failed to serialize configuration")?;
        std::fs::write(&self.config_path, serialized)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;

        info!(
            "Persisted configuration overrides to {}",
            self.config_path.display()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_config() {
        let file = write_config(
            r#"
listen_address = "127.0.0.1:8080"
api_key = "secret"
"#,
        );
        let manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let config = manager.master_config.unwrap();
        assert_eq!(config.scheduler, "rts");
        assert_eq!(config.queue_tick_seconds, 5);
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(ConfigManager::new(PathBuf::from("/nonexistent/master.toml")).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let file = write_config(
            r#"
listen_address = "not-an-address"
api_key = "secret"
"#,
        );
        assert!(ConfigManager::new(file.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_override_and_persist() {
        let file = write_config(
            r#"
listen_address = "127.0.0.1:8080"
api_key = "secret"
"#,
        );
        let mut manager = ConfigManager::new(file.path().to_path_buf()).unwrap();

        let changed = manager
            .override_and_persist_config(
                Some("127.0.0.1:9090".to_string()),
                None,
                Some("round-robin".to_string()),
                None,
            )
            .unwrap();
        assert!(changed);

        // A fresh manager sees the persisted overrides
        let reloaded = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let config = reloaded.master_config.unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9090");
        assert_eq!(config.scheduler, "round-robin");

        // Re-applying identical values reports no change
        let mut manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let changed = manager
            .override_and_persist_config(Some("127.0.0.1:9090".to_string()), None, None, None)
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let file = write_config(
            r#"
listen_address = "127.0.0.1:8080"
api_key = "secret"
"#,
        );
        let mut manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        assert!(manager
            .override_and_persist_config(None, None, Some("random".to_string()), None)
            .is_err());
    }
}
