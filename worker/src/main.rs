//! Container Task Worker
//!
//! The worker registers its capacity with the master, hosts a small control
//! API the master drives (assign, cancel, logs, registration nudges), runs
//! assigned tasks as containers, and heartbeats its usage and running set.
// This is the main entry point for the worker application. It is responsible for:
// - Initializing logging and configuration.
// - Probing capacity and registering with the master.
// - Running the heartbeat loop and the control API server.
// - Managing graceful shutdown, including terminated-task reports.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

mod api;
mod client;
mod config;
mod executor;
mod logs;
mod probe;
mod runtime;
mod uploader;

use client::MasterClient;
use config::ConfigManager;
use executor::ExecutionEngine;
use probe::UsageProbe;
use runtime::DockerRuntime;
use shared::api::HeartbeatRequest;
use shared::config::WorkerConfig;
use shared::worker::WorkerInfo;

/// Command-line arguments for the worker
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Worker node that executes containerized tasks for the master", long_about = None)]
struct CliArgs {
    /// Path to the worker configuration file (worker.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the worker ID from config file
    #[arg(long = "worker-id", value_name = "ID")]
    worker_id: Option<String>,

    /// Override the master URL from config file
    #[arg(long = "master-url", value_name = "URL")]
    master_url: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,
}

/// The main application structure for the worker.
pub struct Worker {
    config: Arc<WorkerConfig>,
    capacity: WorkerInfo,
    client: Arc<MasterClient>,
    engine: Arc<ExecutionEngine>,
    /// Poked when the master asks for a fresh registration handshake
    reregister: Arc<Notify>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Worker {
    /// Creates and fully initializes a new worker instance: loads config,
    /// connects the container runtime, and probes capacity.
    pub fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = Arc::new(
            config_manager
                .worker_config
                .expect("Worker configuration not loaded. Call load_config() first."),
        );

        info!(
            worker_id = %config.worker_id,
            master_url = %config.master_url,
            listen_address = %config.listen_address,
            "Worker configuration loaded"
        );

        let capacity = probe::probe_capacity(&config);

        let client = Arc::new(MasterClient::new(
            config.master_url.clone(),
            config.api_key.clone(),
            config.worker_id.clone(),
            config.http_client_timeout_seconds,
            config.report_max_retries,
        )?);

        let docker = DockerRuntime::connect().context("Failed to connect to Docker daemon")?;
        let engine = ExecutionEngine::new(Arc::new(docker), client.clone(), config.clone());

        Ok(Self {
            config,
            capacity,
            client,
            engine,
            reregister: Arc::new(Notify::new()),
            shutdown_tx: None,
        })
    }

    /// Registers with the master, retrying with backoff until it answers.
    /// The declared running set lets a master that lost us reconcile.
    async fn register_until_accepted(&self) {
        let mut attempt: u32 = 0;
        loop {
            let running = self.engine.running_task_ids().await;
            match self.client.register(&self.capacity, running).await {
                Ok(ack) => {
                    info!(
                        heartbeat_interval = ack.heartbeat_interval_seconds,
                        "Registration accepted"
                    );
                    return;
                }
                Err(e) => {
                    let delay = shared::utils::calculate_backoff_delay(attempt, 1_000, 30_000);
                    warn!(
                        attempt = attempt + 1,
                        retry_in_ms = delay,
                        error = %e,
                        "Registration failed, will retry"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Starts the worker and runs until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Container Task Worker");

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Control API server
        let app_state = api::AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
            reregister: self.reregister.clone(),
        };
        let app = api::create_router(app_state);
        let listen_address: std::net::SocketAddr = self
            .config
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.config.listen_address))?;
        let listener = tokio::net::TcpListener::bind(listen_address)
            .await
            .with_context(|| format!("Failed to bind control API to {}", listen_address))?;
        info!("Control API listening on {}", listen_address);

        let server_shutdown = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("Control API received shutdown signal");
            }
        };
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown)
                .await
            {
                error!("Control API server error: {}", e);
            }
        });

        // Initial registration handshake
        self.register_until_accepted().await;

        // Heartbeat loop: usage sample plus the running-task snapshot. A
        // master that lost this worker answers with a re-register flag; the
        // MasterRegister endpoint pokes the same notifier.
        let mut usage_probe = UsageProbe::new();
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.heartbeat_interval_seconds.max(1),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let reregister = self.reregister.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let heartbeat = HeartbeatRequest {
                        worker_id: self.config.worker_id.clone(),
                        usage: usage_probe.sample(),
                        running_tasks: self.engine.running_task_infos().await,
                        timestamp: shared::utils::current_timestamp(),
                    };
                    match self.client.heartbeat(&heartbeat).await {
                        Ok(ack) if ack.reregister => {
                            info!("Master requested re-registration via heartbeat ack");
                            self.register_until_accepted().await;
                        }
                        Ok(_) => debug!("Heartbeat acknowledged"),
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    }
                }
                _ = reregister.notified() => {
                    info!("Re-running registration handshake");
                    self.register_until_accepted().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat loop received shutdown signal");
                    break;
                }
            }
        }

        // Stop the API server alongside the heartbeat loop
        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
        Ok(())
    }

    /// Performs a graceful shutdown: stops containers and sends one
    /// failed/"terminated" report per running task so the master releases
    /// resources immediately instead of waiting for the liveness timeout.
    pub async fn shutdown(&mut self) {
        info!("Shutting down worker gracefully");

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        let timeout = Duration::from_secs(self.config.graceful_shutdown_timeout_seconds);
        if tokio::time::timeout(timeout, self.engine.shutdown())
            .await
            .is_err()
        {
            warn!("Task termination reports did not finish before the shutdown timeout");
        }

        info!("Worker shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
///
/// On Unix systems, handles SIGTERM and SIGINT signals.
/// On non-Unix systems, handles Ctrl+C.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                error!("Falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Worker entry point
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("Container Task Worker starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut config_manager = match ConfigManager::new(cli_args.config_file) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config_manager.apply_overrides(
        cli_args.worker_id,
        cli_args.master_url,
        cli_args.api_key,
        cli_args.listen_address,
    ) {
        error!("Failed to apply configuration overrides: {}", e);
        std::process::exit(1);
    }

    let mut worker = match Worker::new(config_manager) {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize worker: {}", e);
            std::process::exit(1);
        }
    };

    // Run the worker and the shutdown signal handler concurrently.
    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                error!("Worker error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    worker.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}
