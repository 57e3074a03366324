//! Container Task Orchestration Master
//!
//! The master accepts containerized tasks, schedules them onto a fleet of
//! worker nodes, tracks their lifecycle, enforces SLA deadlines through a
//! risk-aware scheduler, and periodically retrains the scheduler's parameters
//! from historical data.
// This is the main entry point for the master application. It's responsible for:
// - Initializing logging and configuration.
// - Recovering durable state into the in-memory registry and queue.
// - Wiring the subsystems together and spawning the background loops.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod artifacts;
mod config;
mod database;
mod dispatch;
mod ingest;
mod queue;
mod reconcile;
mod registry;
mod scheduler;
mod telemetry;
mod trainer;
mod worker_client;

use artifacts::ArtifactStore;
use config::ConfigManager;
use database::{db_assignments, db_tasks, MasterDatabase};
use dispatch::AssignmentEngine;
use ingest::ResultIngestor;
use queue::TaskQueue;
use reconcile::ReconnectionMonitor;
use registry::WorkerRegistry;
use scheduler::round_robin::RoundRobinScheduler;
use scheduler::rts::RtsScheduler;
use scheduler::Scheduler;
use shared::api::MasterInfo;
use shared::task::TaskStatus;
use telemetry::TelemetryHub;
use trainer::AodTrainer;
use worker_client::WorkerClient;

/// Command-line arguments for the master
#[derive(Parser, Debug)]
#[command(name = "master")]
#[command(about = "Master coordinator that schedules containerized tasks across workers", long_about = None)]
struct CliArgs {
    /// Path to the master configuration file (master.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the scheduling strategy from config file (rts or round-robin)
    #[arg(long = "scheduler", value_name = "STRATEGY")]
    scheduler: Option<String>,

    /// Override the parameter file path from config file
    #[arg(long = "param-file", value_name = "FILE")]
    param_file: Option<String>,
}

/// The main application structure for the master.
/// It owns the subsystem handles and the background task handles needed for
/// a graceful shutdown.
pub struct Master {
    /// The configuration manager, responsible for loading and accessing settings.
    pub config_manager: ConfigManager,
    /// The `SocketAddr` (IP address and port) the API server will listen on.
    listen_address: SocketAddr,
    /// Handles to the background loops, joined during shutdown.
    background_handles: Vec<(&'static str, JoinHandle<()>)>,
    /// Telemetry hub, shut down explicitly to stop per-worker consumers.
    telemetry: Option<Arc<TelemetryHub>>,
    /// Database handle for closing the connection at shutdown.
    database: Option<Arc<Mutex<MasterDatabase>>>,
    /// Shutdown signal sender for notifying background tasks.
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Master {
    /// Creates a new master instance from a configuration file.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let master_config = config_manager.master_config.as_ref().expect(
            "Master configuration not loaded. This should not happen as config is loaded in new().",
        );

        let listen_address: SocketAddr = master_config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid listen address '{}': {}",
                master_config.listen_address,
                e
            )
        })?;

        Ok(Self {
            config_manager,
            listen_address,
            background_handles: Vec::new(),
            telemetry: None,
            database: None,
            shutdown_tx: None,
        })
    }

    /// Starts the master and runs until the HTTP server stops.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Container Task Orchestration Master");

        let config = Arc::new(
            self.config_manager
                .master_config
                .as_ref()
                .expect("Master configuration not loaded. This should not happen as config is loaded in new().")
                .clone(),
        );
        info!(
            listen_address = %self.listen_address,
            scheduler = %config.scheduler,
            liveness_timeout = config.liveness_timeout_seconds,
            "Master configuration loaded"
        );

        // Initialize the database
        info!("Initializing database");
        let data_dir = PathBuf::from("./data");
        let mut database = MasterDatabase::new(&data_dir, config.database_busy_timeout_seconds)
            .context("Failed to create database manager")?;
        database
            .initialize()
            .await
            .context("Failed to initialize database")?;
        let database = Arc::new(Mutex::new(database));
        self.database = Some(Arc::clone(&database));
        info!("Database initialized successfully");

        // Shared wakeup for the assignment engine
        let kick = Arc::new(Notify::new());

        // Registry, queue, and state recovery: persisted workers load
        // inactive until they heartbeat; queued tasks re-enter the queue;
        // running tasks keep their reservations until reconciliation.
        let registry = Arc::new(WorkerRegistry::new(
            Arc::clone(&database),
            Duration::from_secs(config.liveness_timeout_seconds),
        ));
        let queue = Arc::new(TaskQueue::new());
        self.recover_state(&registry, &queue, &database).await?;

        // Scheduler selection per configuration
        let param_path = PathBuf::from(&config.param_file);
        let (scheduler, rts): (Arc<dyn Scheduler>, Option<Arc<RtsScheduler>>) =
            if config.scheduler == "rts" {
                let rts = RtsScheduler::new(param_path.clone());
                (rts.clone(), Some(rts))
            } else {
                (Arc::new(RoundRobinScheduler::new()), None)
            };

        // Subsystems
        let telemetry = TelemetryHub::new(
            Arc::clone(&registry),
            Arc::clone(&database),
            config.heartbeat_buffer_capacity,
            Arc::clone(&kick),
        );
        self.telemetry = Some(Arc::clone(&telemetry));
        let ingestor = ResultIngestor::new(
            Arc::clone(&registry),
            Arc::clone(&database),
            Arc::clone(&kick),
        );
        let worker_client = WorkerClient::new(config.api_key.clone())?;
        let engine = AssignmentEngine::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            scheduler,
            Arc::clone(&database),
            worker_client.clone(),
            Duration::from_secs(config.assign_timeout_seconds),
            Arc::clone(&kick),
        );
        let artifacts = Arc::new(
            ArtifactStore::open(&config.artifact_root, config.admin_users.clone())
                .context("Failed to open artifact store")?,
        );
        let monitor = ReconnectionMonitor::new(
            Arc::clone(&registry),
            worker_client.clone(),
            MasterInfo {
                master_id: "master".to_string(),
                address: format!("http://{}", config.listen_address),
            },
            Duration::from_secs(config.reconnect_probe_timeout_seconds),
        );
        let trainer = AodTrainer::new(
            Arc::clone(&database),
            param_path.clone(),
            config.trainer_window_seconds,
            config.trainer_min_history,
        );

        // Create shutdown broadcast channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Assignment loop
        self.background_handles.push((
            "assignment engine",
            tokio::spawn(
                Arc::clone(&engine).run(config.queue_tick_seconds, shutdown_tx.subscribe()),
            ),
        ));

        // Liveness sweeper: checks heartbeat staleness at heartbeat cadence
        {
            let registry = Arc::clone(&registry);
            let sweep_interval = config.heartbeat_interval_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.background_handles.push((
                "liveness sweeper",
                tokio::spawn(async move {
                    let mut interval =
                        tokio::time::interval(Duration::from_secs(sweep_interval.max(1)));
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                let flipped = registry.sweep_liveness().await;
                                if !flipped.is_empty() {
                                    warn!(workers = ?flipped, "Liveness sweep deactivated workers");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                info!("Liveness sweeper received shutdown signal");
                                break;
                            }
                        }
                    }
                }),
            ));
        }

        // Reconnection monitor
        self.background_handles.push((
            "reconnection monitor",
            tokio::spawn(monitor.run(config.reconnect_tick_seconds, shutdown_tx.subscribe())),
        ));

        // Trainer epochs
        self.background_handles.push((
            "trainer",
            tokio::spawn(trainer.run(config.trainer_epoch_seconds, shutdown_tx.subscribe())),
        ));

        // Parameter refresher for the risk scheduler
        if let Some(rts) = &rts {
            self.background_handles.push((
                "parameter refresher",
                tokio::spawn(
                    Arc::clone(rts)
                        .run_refresher(config.param_reload_interval_seconds, shutdown_tx.subscribe()),
                ),
            ));
        }

        // Periodic cleanup of expired rows
        {
            let database = Arc::clone(&database);
            let retention_days = config.data_retention_days;
            let cleanup_interval = config.cleanup_interval_seconds;
            let initial_delay = config.initial_cleanup_delay_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.background_handles.push((
                "cleanup",
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(initial_delay)).await;
                    let mut interval =
                        tokio::time::interval(Duration::from_secs(cleanup_interval.max(60)));
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                info!("Running periodic database cleanup");
                                let mut db = database.lock().await;
                                match db.cleanup_old_data(retention_days).await {
                                    Ok(removed) => info!(removed = removed, "Database cleanup completed"),
                                    Err(e) => error!("Database cleanup failed: {}", e),
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                info!("Cleanup task received shutdown signal");
                                break;
                            }
                        }
                    }
                }),
            ));
        }

        // Application state for the API handlers
        let app_state = api::AppState {
            config: Arc::clone(&config),
            database: Arc::clone(&database),
            registry,
            queue,
            telemetry,
            ingestor,
            engine,
            artifacts,
            worker_client,
            rts,
            param_path,
            kick,
        };
        let app = api::create_router(app_state);

        info!("Starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Rebuild the in-memory registry and queue from the store after a
    /// restart. Workers come back inactive; pending and queued tasks re-enter
    /// the queue; running tasks keep their reservations so the accounting
    /// matches the assignments until the workers re-attach and reconcile.
    async fn recover_state(
        &self,
        registry: &Arc<WorkerRegistry>,
        queue: &Arc<TaskQueue>,
        database: &Arc<Mutex<MasterDatabase>>,
    ) -> Result<()> {
        let workers = registry.load_from_store().await?;
        if workers > 0 {
            info!(workers = workers, "Recovered workers from store (inactive until heartbeat)");
        }

        let (waiting, running) = {
            let mut db = database.lock().await;
            let conn = db.get_connection()?;
            let waiting =
                db_tasks::load_tasks_by_status(conn, &[TaskStatus::Pending, TaskStatus::Queued])?;
            let running = db_tasks::load_tasks_by_status(conn, &[TaskStatus::Running])?;
            (waiting, running)
        };

        for task in &waiting {
            queue.enqueue(task.clone()).await;
        }
        if !waiting.is_empty() {
            info!(tasks = waiting.len(), "Re-queued waiting tasks from store");
        }

        let mut restored = 0;
        for task in &running {
            let assignment = {
                let mut db = database.lock().await;
                let conn = db.get_connection()?;
                db_assignments::get_assignment(conn, &task.task_id)?
            };
            match assignment {
                Some(assignment) => {
                    if registry
                        .restore_reservation(&assignment.worker_id, &task.task_id, &task.request)
                        .await
                    {
                        restored += 1;
                    } else {
                        warn!(
                            task_id = %task.task_id,
                            worker_id = %assignment.worker_id,
                            "Could not restore reservation; reconciliation will resolve it"
                        );
                    }
                }
                None => warn!(
                    task_id = %task.task_id,
                    "Running task has no assignment record; reconciliation will resolve it"
                ),
            }
        }
        if restored > 0 {
            info!(tasks = restored, "Restored reservations for running tasks");
        }

        Ok(())
    }

    /// Performs a graceful shutdown of the master.
    ///
    /// Shutdown sequence:
    /// 1. Broadcast shutdown signal to all background tasks
    /// 2. Join each background loop with a timeout
    /// 3. Stop telemetry consumers
    /// 4. Close the database connection
    pub async fn shutdown(&mut self) {
        info!("Shutting down master gracefully");

        let shutdown_timeout_secs = self
            .config_manager
            .master_config
            .as_ref()
            .map(|c| c.graceful_shutdown_timeout_seconds)
            .unwrap_or(30);

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        for (name, handle) in self.background_handles.drain(..) {
            match tokio::time::timeout(Duration::from_secs(shutdown_timeout_secs), handle).await {
                Ok(Ok(())) => info!("{} stopped", name),
                Ok(Err(e)) => warn!("{} panicked: {}", name, e),
                Err(_) => warn!("{} shutdown timeout reached, aborting", name),
            }
        }

        if let Some(telemetry) = self.telemetry.take() {
            telemetry.shutdown().await;
            info!("Telemetry consumers stopped");
        }

        if let Some(database) = &self.database {
            info!("Closing database connection");
            let mut db = database.lock().await;
            db.close().await;
            info!("Database connection closed");
        }

        info!("Master shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
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

/// Master entry point
///
/// Initializes logging, loads configuration, creates the master instance, and
/// runs until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "master.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("master=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("Container Task Orchestration Master starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut master = match Master::new(cli_args.config_file) {
        Ok(master) => master,
        Err(e) => {
            error!("Failed to initialize master: {}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides if provided
    if cli_args.listen_address.is_some()
        || cli_args.api_key.is_some()
        || cli_args.scheduler.is_some()
        || cli_args.param_file.is_some()
    {
        let changed = match master.config_manager.override_and_persist_config(
            cli_args.listen_address,
            cli_args.api_key,
            cli_args.scheduler,
            cli_args.param_file,
        ) {
            Ok(changed) => changed,
            Err(e) => {
                error!("Failed to apply configuration overrides: {}", e);
                std::process::exit(1);
            }
        };

        if changed {
            info!("Configuration overrides applied and persisted to disk");
            let listen_address = master
                .config_manager
                .master_config
                .as_ref()
                .expect("Master configuration not loaded. This should not happen as config is loaded in new().")
                .listen_address
                .clone();
            master.listen_address = match listen_address.parse() {
                Ok(address) => address,
                Err(e) => {
                    error!("Invalid listen address after override: {}", e);
                    std::process::exit(1);
                }
            };
        } else {
            info!("Command-line values match existing config, no changes needed");
        }
    }

    // Run the master and the shutdown signal handler concurrently.
    tokio::select! {
        result = master.run() => {
            if let Err(e) = result {
                error!("Master error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    master.shutdown().await;
    info!("Master shutdown complete");
    Ok(())
}
