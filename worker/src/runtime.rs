//! Container runtime abstraction and its Docker implementation
//!
//! The executor drives containers through this trait so tests can run
//! against an in-memory fake. The production implementation talks to the
//! local Docker daemon via bollard: pull, create with resource limits and the
//! `/output` bind mount, start, follow logs, wait, stop with a grace window
//! (SIGTERM then SIGKILL), and remove.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors surfaced by a container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to pull image '{image}': {message}")]
    Pull { image: String, message: String },
    #[error("Container '{0}' not found")]
    NotFound(String),
    #[error("Container runtime error: {0}")]
    Api(String),
}

/// Everything needed to create one task container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name; the task id keeps containers identifiable
    pub name: String,
    pub image: String,
    /// Empty means the image's default entrypoint
    pub command: Vec<String>,
    /// CPU cores (fractional allowed)
    pub cpu: f64,
    /// Memory limit in megabytes
    pub mem_mb: f64,
    /// Host directory bind-mounted at /output inside the container
    pub output_host_dir: PathBuf,
}

/// Raw log chunks as emitted by the container
pub type RuntimeLogStream = BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

/// Seam between the executor and the container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;
    /// Follow stdout and stderr until the container exits
    async fn log_stream(&self, container_id: &str) -> Result<RuntimeLogStream, RuntimeError>;
    /// Block until the container exits, returning its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64, RuntimeError>;
    /// Graceful stop: SIGTERM, then SIGKILL after the grace window
    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError>;
    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError>;
}

/// Docker-backed runtime
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using its default socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Api(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        debug!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                return Err(RuntimeError::Pull {
                    image: image.to_string(),
                    message: e.to_string(),
                });
            }
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            // Docker counts CPU in nanocpus and memory in bytes
            nano_cpus: Some((spec.cpu * 1e9) as i64),
            memory: Some((spec.mem_mb * 1024.0 * 1024.0) as i64),
            binds: Some(vec![format!(
                "{}:/output",
                spec.output_host_dir.display()
            )]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::Api(format!("create failed: {}", e)))?;

        for warning in &response.warnings {
            warn!(container = %response.id, warning = %warning, "Container create warning");
        }
        debug!(container = %response.id, image = %spec.image, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Api(format!("start failed: {}", e)))
    }

    async fn log_stream(&self, container_id: &str) -> Result<RuntimeLogStream, RuntimeError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(container_id, Some(options))
            .map(|item| match item {
                Ok(output) => Ok(output.into_bytes().to_vec()),
                Err(e) => Err(RuntimeError::Api(format!("log read failed: {}", e))),
            });
        Ok(stream.boxed())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(RuntimeError::Api(format!("wait failed: {}", e))),
            None => Err(RuntimeError::Api(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn stop_container(
        &self,
        container_id: &str,
        grace: Duration,
    ) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker
            .stop_container(container_id, Some(options))
            .await
            .map_err(|e| RuntimeError::Api(format!("stop failed: {}", e)))
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| RuntimeError::Api(format!("remove failed: {}", e)))
    }
}
