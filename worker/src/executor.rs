//! Task execution engine for the worker
//!
//! Owns the running-task map (task id to container) and drives the container
//! lifecycle: pull, create with limits and the `/output` bind mount, start,
//! log multiplexing, wait, output collection and upload, and the final result
//! report. Cancellation stops the container gracefully (SIGTERM, then SIGKILL
//! after the grace window), removes it, and sends the cancellation result
//! asynchronously; the master's suppression rules absorb whatever order the
//! reports land in.

use crate::client::MasterClient;
use crate::logs::{LogBroadcaster, LogTail};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::uploader::OutputUploader;
use futures_util::StreamExt;
use shared::api::{LogLine, TaskResultReport};
use shared::config::WorkerConfig;
use shared::task::{Task, TaskStatus};
use shared::worker::RunningTaskInfo;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

struct RunningTask {
    task: Task,
    container_id: Option<String>,
    broadcaster: Arc<LogBroadcaster>,
    tail: Arc<StdMutex<LogTail>>,
    cancelled: bool,
}

pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    client: Arc<MasterClient>,
    uploader: OutputUploader,
    config: Arc<WorkerConfig>,
    running: Mutex<HashMap<String, RunningTask>>,
}

impl ExecutionEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        client: Arc<MasterClient>,
        config: Arc<WorkerConfig>,
    ) -> Arc<Self> {
        let uploader = OutputUploader::new(client.clone(), config.file_chunk_bytes);
        Arc::new(Self {
            runtime,
            client,
            uploader,
            config,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Accept an assignment. The ack to the master means "accepted"; the
    /// container lifecycle runs in its own task.
    pub async fn submit(self: &Arc<Self>, task: Task) -> shared::Result<()> {
        task.validate()?;

        {
            let mut running = self.running.lock().await;
            if running.contains_key(&task.task_id) {
                return Err(shared::OrchestratorError::TaskExecution(format!(
                    "Task '{}' is already running on this worker",
                    task.task_id
                ))
                .into());
            }
            running.insert(
                task.task_id.clone(),
                RunningTask {
                    task: task.clone(),
                    container_id: None,
                    broadcaster: Arc::new(LogBroadcaster::new(
                        self.config.log_subscriber_buffer,
                    )),
                    tail: Arc::new(StdMutex::new(LogTail::new(self.config.log_tail_bytes))),
                    cancelled: false,
                },
            );
        }

        info!(
            task_id = %task.task_id,
            image = %task.image,
            "Task accepted"
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_lifecycle(task).await;
        });
        Ok(())
    }

    /// Cancel a running task. Unknown ids are an error to the caller; the
    /// master treats that as already-cancelled.
    pub async fn cancel(self: &Arc<Self>, task_id: &str) -> shared::Result<()> {
        let (container_id, task, tail) = {
            let mut running = self.running.lock().await;
            let entry = running.get_mut(task_id).ok_or_else(|| {
                shared::OrchestratorError::TaskExecution(format!(
                    "Task '{}' is not running on this worker",
                    task_id
                ))
            })?;
            entry.cancelled = true;
            (
                entry.container_id.take(),
                entry.task.clone(),
                entry.tail.clone(),
            )
        };

        info!(task_id = %task_id, "Cancelling task");

        if let Some(container_id) = container_id {
            let grace = Duration::from_secs(self.config.graceful_stop_seconds);
            if let Err(e) = self.runtime.stop_container(&container_id, grace).await {
                warn!(task_id = %task_id, error = %e, "Container stop failed during cancel");
            }
            if let Err(e) = self.runtime.remove_container(&container_id).await {
                warn!(task_id = %task_id, error = %e, "Container remove failed during cancel");
            }
        }

        self.running.lock().await.remove(task_id);
        self.cleanup_output_dir(task_id);

        // The cancellation result goes out asynchronously; the caller's ack
        // doesn't wait on the master.
        let engine = self.clone();
        let logs = tail.lock().expect("log tail lock poisoned").contents();
        tokio::spawn(async move {
            let report = TaskResultReport {
                task_id: task.task_id.clone(),
                worker_id: engine.config.worker_id.clone(),
                status: TaskStatus::Cancelled,
                logs,
                output_files: vec![],
                sla_success: Some(false),
                completed_at: shared::utils::current_timestamp(),
            };
            if let Err(e) = engine.client.report_completion(&report).await {
                warn!(task_id = %task.task_id, error = %e, "Failed to deliver cancellation result");
            }
        });

        Ok(())
    }

    /// Snapshot of the running tasks for heartbeats
    pub async fn running_task_infos(&self) -> Vec<RunningTaskInfo> {
        let running = self.running.lock().await;
        let mut infos: Vec<RunningTaskInfo> = running
            .values()
            .map(|entry| RunningTaskInfo {
                task_id: entry.task.task_id.clone(),
                allocated: entry.task.request,
                status: TaskStatus::Running,
            })
            .collect();
        infos.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        infos
    }

    pub async fn running_task_ids(&self) -> Vec<String> {
        self.running_task_infos()
            .await
            .into_iter()
            .map(|info| info.task_id)
            .collect()
    }

    /// Subscribe to a running task's log stream
    pub async fn subscribe_logs(&self, task_id: &str) -> Option<mpsc::Receiver<LogLine>> {
        let running = self.running.lock().await;
        running
            .get(task_id)
            .map(|entry| entry.broadcaster.subscribe())
    }

    /// Graceful shutdown: stop every container and report each running task
    /// as failed/terminated with a short timeout. This is the fast path to
    /// resource release on the master; a hard crash instead relies on the
    /// liveness timeout and reconciliation.
    pub async fn shutdown(self: &Arc<Self>) {
        let entries: Vec<(String, Option<String>, Task)> = {
            let mut running = self.running.lock().await;
            running
                .drain()
                .map(|(task_id, entry)| (task_id, entry.container_id, entry.task))
                .collect()
        };

        if entries.is_empty() {
            return;
        }
        info!(tasks = entries.len(), "Reporting running tasks as terminated");

        let grace = Duration::from_secs(self.config.graceful_stop_seconds);
        for (task_id, container_id, _task) in &entries {
            if let Some(container_id) = container_id {
                if let Err(e) = self.runtime.stop_container(container_id, grace).await {
                    warn!(task_id = %task_id, error = %e, "Container stop failed during shutdown");
                }
                let _ = self.runtime.remove_container(container_id).await;
            }
        }

        for (task_id, _container_id, _task) in entries {
            let report = TaskResultReport {
                task_id: task_id.clone(),
                worker_id: self.config.worker_id.clone(),
                status: TaskStatus::Failed,
                logs: "terminated".to_string(),
                output_files: vec![],
                sla_success: Some(false),
                completed_at: shared::utils::current_timestamp(),
            };
            if let Err(e) = self
                .client
                .report_completion_fast(&report, Duration::from_secs(3))
                .await
            {
                warn!(task_id = %task_id, error = %e, "Termination report not delivered");
            }
        }
    }

    fn output_dir(&self, task_id: &str) -> PathBuf {
        PathBuf::from(&self.config.output_root).join(task_id)
    }

    fn cleanup_output_dir(&self, task_id: &str) {
        let dir = self.output_dir(task_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(task_id = %task_id, error = %e, "Failed to clean output directory");
            }
        }
    }

    async fn run_lifecycle(self: Arc<Self>, task: Task) {
        let task_id = task.task_id.clone();
        let output_dir = self.output_dir(&task_id);
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            self.finish_with_failure(&task, format!("Failed to create output directory: {}", e))
                .await;
            return;
        }

        // Image pull failures surface as failed results with the error text
        // as logs; pulls run with the worker's local daemon credentials.
        if let Err(e) = self.runtime.pull_image(&task.image).await {
            self.finish_with_failure(&task, e.to_string()).await;
            return;
        }

        let spec = ContainerSpec {
            name: format!("task-{}", task_id),
            image: task.image.clone(),
            command: task.command.clone(),
            cpu: task.request.cpu,
            mem_mb: task.request.mem_mb,
            output_host_dir: output_dir.clone(),
        };
        let container_id = match self.runtime.create_container(&spec).await {
            Ok(container_id) => container_id,
            Err(e) => {
                self.finish_with_failure(&task, e.to_string()).await;
                return;
            }
        };

        // Record the container against the task; a cancel that raced the
        // create wins here and the container is discarded.
        let (broadcaster, tail) = {
            let mut running = self.running.lock().await;
            match running.get_mut(&task_id) {
                Some(entry) => {
                    entry.container_id = Some(container_id.clone());
                    (entry.broadcaster.clone(), entry.tail.clone())
                }
                None => {
                    debug!(task_id = %task_id, "Task cancelled before start, discarding container");
                    let _ = self.runtime.remove_container(&container_id).await;
                    return;
                }
            }
        };

        if let Err(e) = self.runtime.start_container(&container_id).await {
            let _ = self.runtime.remove_container(&container_id).await;
            self.finish_with_failure(&task, e.to_string()).await;
            return;
        }
        debug!(task_id = %task_id, container = %container_id, "Container started");

        // Multiplex logs: one reader feeds the broadcaster and the bounded
        // tail retained for the result.
        let reader = match self.runtime.log_stream(&container_id).await {
            Ok(mut stream) => {
                let broadcaster = broadcaster.clone();
                let tail = tail.clone();
                Some(tokio::spawn(async move {
                    let mut pending = Vec::new();
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(bytes) => {
                                tail.lock().expect("log tail lock poisoned").push(&bytes);
                                publish_lines(&broadcaster, &mut pending, &bytes);
                            }
                            Err(e) => {
                                debug!(error = %e, "Log stream ended with error");
                                break;
                            }
                        }
                    }
                    // Flush a trailing unterminated line
                    if !pending.is_empty() {
                        broadcaster.publish(LogLine {
                            content: String::from_utf8_lossy(&pending).into_owned(),
                            timestamp: shared::utils::current_timestamp(),
                        });
                    }
                }))
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Log stream unavailable");
                None
            }
        };

        let exit = self.runtime.wait_container(&container_id).await;

        // Let the reader drain whatever the container flushed on exit.
        if let Some(reader) = reader {
            let _ = tokio::time::timeout(Duration::from_secs(5), reader).await;
        }

        // A cancelled task's containers and reports are handled by the
        // cancel path; the lifecycle just steps aside.
        let was_cancelled = {
            let running = self.running.lock().await;
            match running.get(&task_id) {
                Some(entry) => entry.cancelled,
                None => true,
            }
        };
        if was_cancelled {
            debug!(task_id = %task_id, "Lifecycle ending after cancellation");
            return;
        }

        let (status, mut logs) = match exit {
            Ok(0) => (TaskStatus::Completed, tail_contents(&tail)),
            Ok(code) => {
                let mut logs = tail_contents(&tail);
                logs.push_str(&format!("\ncontainer exited with status {}", code));
                (TaskStatus::Failed, logs)
            }
            Err(e) => {
                let mut logs = tail_contents(&tail);
                logs.push_str(&format!("\ncontainer wait failed: {}", e));
                (TaskStatus::Failed, logs)
            }
        };

        // Collect and stream the output files. Upload trouble downgrades to
        // a result without files rather than losing the run entirely.
        let output_files = match self.uploader.upload_dir(&task, &output_dir).await {
            Ok(files) => files,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Output upload failed");
                logs.push_str(&format!("\noutput upload failed: {}", e));
                vec![]
            }
        };

        let completed_at = shared::utils::current_timestamp();
        let report = TaskResultReport {
            task_id: task_id.clone(),
            worker_id: self.config.worker_id.clone(),
            status,
            logs,
            output_files,
            sla_success: Some(status == TaskStatus::Completed && task.meets_sla(completed_at)),
            completed_at,
        };
        if let Err(e) = self.client.report_completion(&report).await {
            error!(
                task_id = %task_id,
                error = %e,
                "Result report undeliverable; master reconciliation will recover"
            );
        }

        if let Err(e) = self.runtime.remove_container(&container_id).await {
            warn!(task_id = %task_id, error = %e, "Container remove failed");
        }
        self.running.lock().await.remove(&task_id);
        self.cleanup_output_dir(&task_id);

        info!(
            task_id = %task_id,
            status = %status.as_str(),
            "Task finished"
        );
    }

    /// Report a failure that happened before the container ran, and clean up.
    async fn finish_with_failure(&self, task: &Task, error_text: String) {
        error!(task_id = %task.task_id, error = %error_text, "Task failed before execution");

        let report = TaskResultReport {
            task_id: task.task_id.clone(),
            worker_id: self.config.worker_id.clone(),
            status: TaskStatus::Failed,
            logs: error_text,
            output_files: vec![],
            sla_success: Some(false),
            completed_at: shared::utils::current_timestamp(),
        };
        if let Err(e) = self.client.report_completion(&report).await {
            error!(task_id = %task.task_id, error = %e, "Failure report undeliverable");
        }

        self.running.lock().await.remove(&task.task_id);
        self.cleanup_output_dir(&task.task_id);
    }
}

fn tail_contents(tail: &Arc<StdMutex<LogTail>>) -> String {
    tail.lock().expect("log tail lock poisoned").contents()
}

/// Split raw container output into lines for the broadcaster, carrying
/// partial lines across chunks.
fn publish_lines(broadcaster: &LogBroadcaster, pending: &mut Vec<u8>, bytes: &[u8]) {
    pending.extend_from_slice(bytes);
    while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = pending.drain(..=newline).collect();
        let content = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        broadcaster.publish(LogLine {
            content,
            timestamp: shared::utils::current_timestamp(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeError, RuntimeLogStream};
    use async_trait::async_trait;
    use axum::{routing::post, Json, Router};
    use shared::api::{endpoints, FileChunk, ResultAck, UploadAck};
    use shared::task::{ResourceRequest, TaskType};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// In-memory runtime with programmable behavior
    struct FakeRuntime {
        pull_error: Option<String>,
        exit_code: i64,
        log_chunks: Vec<Vec<u8>>,
        /// When set, wait_container blocks until stop_container runs
        hold_until_stopped: bool,
        stopped: AtomicBool,
        stop_signal: Notify,
        stops: StdMutex<Vec<String>>,
        removes: StdMutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn completing(exit_code: i64, logs: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                pull_error: None,
                exit_code,
                log_chunks: logs.iter().map(|l| format!("{}\n", l).into_bytes()).collect(),
                hold_until_stopped: false,
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
                stops: StdMutex::new(Vec::new()),
                removes: StdMutex::new(Vec::new()),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                pull_error: None,
                exit_code: 137,
                log_chunks: vec![b"sleeping\n".to_vec()],
                hold_until_stopped: true,
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
                stops: StdMutex::new(Vec::new()),
                removes: StdMutex::new(Vec::new()),
            })
        }

        fn failing_pull(message: &str) -> Arc<Self> {
            Arc::new(Self {
                pull_error: Some(message.to_string()),
                exit_code: 0,
                log_chunks: vec![],
                hold_until_stopped: false,
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
                stops: StdMutex::new(Vec::new()),
                removes: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
            match &self.pull_error {
                Some(message) => Err(RuntimeError::Pull {
                    image: image.to_string(),
                    message: message.clone(),
                }),
                None => Ok(()),
            }
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
            Ok(format!("ctr-{}", spec.name))
        }

        async fn start_container(&self, _container_id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn log_stream(
            &self,
            _container_id: &str,
        ) -> Result<RuntimeLogStream, RuntimeError> {
            let chunks: Vec<Result<Vec<u8>, RuntimeError>> =
                self.log_chunks.iter().cloned().map(Ok).collect();
            Ok(futures_util::stream::iter(chunks).boxed())
        }

        async fn wait_container(&self, _container_id: &str) -> Result<i64, RuntimeError> {
            if self.hold_until_stopped && !self.stopped.load(Ordering::SeqCst) {
                self.stop_signal.notified().await;
            }
            Ok(self.exit_code)
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _grace: Duration,
        ) -> Result<(), RuntimeError> {
            self.stops.lock().unwrap().push(container_id.to_string());
            self.stopped.store(true, Ordering::SeqCst);
            self.stop_signal.notify_waiters();
            Ok(())
        }

        async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
            self.removes.lock().unwrap().push(container_id.to_string());
            Ok(())
        }
    }

    /// Master stub capturing reports and chunks
    struct MasterStub {
        url: String,
        reports: Arc<StdMutex<Vec<TaskResultReport>>>,
        chunks: Arc<StdMutex<Vec<FileChunk>>>,
    }

    async fn master_stub() -> MasterStub {
        let reports = Arc::new(StdMutex::new(Vec::new()));
        let chunks = Arc::new(StdMutex::new(Vec::new()));
        let reports_clone = reports.clone();
        let chunks_clone = chunks.clone();

        let app = Router::new()
            .route(
                endpoints::TASK_REPORT,
                post(move |Json(report): Json<TaskResultReport>| {
                    let reports = reports_clone.clone();
                    async move {
                        reports.lock().unwrap().push(report);
                        Json(ResultAck::recorded())
                    }
                }),
            )
            .route(
                endpoints::FILE_UPLOAD,
                post(move |Json(chunk): Json<FileChunk>| {
                    let chunks = chunks_clone.clone();
                    async move {
                        chunks.lock().unwrap().push(chunk);
                        Json(UploadAck {
                            status: "success".to_string(),
                            committed: false,
                        })
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MasterStub {
            url,
            reports,
            chunks,
        }
    }

    fn engine_with(
        runtime: Arc<dyn ContainerRuntime>,
        master_url: &str,
        output_root: &TempDir,
    ) -> Arc<ExecutionEngine> {
        let config: WorkerConfig = toml::from_str(&format!(
            r#"
worker_id = "w1"
master_url = "{}"
api_key = "secret"
listen_address = "0.0.0.0:7070"
output_root = "{}"
"#,
            master_url,
            output_root.path().display()
        ))
        .unwrap();
        let config = Arc::new(config);
        let client = Arc::new(
            MasterClient::new(
                config.master_url.clone(),
                config.api_key.clone(),
                config.worker_id.clone(),
                5,
                1,
            )
            .unwrap(),
        );
        ExecutionEngine::new(runtime, client, config)
    }

    fn task(task_id: &str, tau: Option<f64>) -> Task {
        Task {
            task_id: task_id.to_string(),
            user_id: "alice".to_string(),
            task_name: "job".to_string(),
            image: "hello-world:latest".to_string(),
            command: vec![],
            request: ResourceRequest::new(1.0, 512.0, 1_024.0, 0.0),
            task_type: TaskType::CpuLight,
            tau_seconds: tau,
            sla_multiplier: 2.0,
            submitted_at: shared::utils::current_timestamp(),
            status: TaskStatus::Running,
            started_at: None,
            completed_at: None,
        }
    }

    async fn wait_for_report(stub: &MasterStub, task_id: &str) -> TaskResultReport {
        for _ in 0..200 {
            {
                let reports = stub.reports.lock().unwrap();
                if let Some(report) = reports.iter().find(|r| r.task_id == task_id) {
                    return report.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no report for {}", task_id);
    }

    #[tokio::test]
    async fn test_happy_path_reports_completed() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::completing(0, &["hello", "done"]);
        let engine = engine_with(runtime.clone(), &stub.url, &output_root);

        engine.submit(task("t1", Some(600.0))).await.unwrap();
        let report = wait_for_report(&stub, "t1").await;

        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.sla_success, Some(true));
        assert!(report.logs.contains("hello"));
        assert!(report.logs.contains("done"));

        // Map cleaned, container removed
        assert!(engine.running_task_ids().await.is_empty());
        assert!(!runtime.removes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_failed() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::completing(3, &["boom"]);
        let engine = engine_with(runtime, &stub.url, &output_root);

        engine.submit(task("t1", None)).await.unwrap();
        let report = wait_for_report(&stub, "t1").await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.sla_success, Some(false));
        assert!(report.logs.contains("exited with status 3"));
    }

    #[tokio::test]
    async fn test_pull_failure_surfaces_error_text() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::failing_pull("no such image");
        let engine = engine_with(runtime, &stub.url, &output_root);

        engine.submit(task("t1", None)).await.unwrap();
        let report = wait_for_report(&stub, "t1").await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.logs.contains("no such image"));
        assert!(engine.running_task_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::hanging();
        let engine = engine_with(runtime, &stub.url, &output_root);

        engine.submit(task("t1", None)).await.unwrap();
        assert!(engine.submit(task("t1", None)).await.is_err());
        engine.cancel("t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_container_and_reports_cancelled() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::hanging();
        let engine = engine_with(runtime.clone(), &stub.url, &output_root);

        engine.submit(task("t2", None)).await.unwrap();
        // Wait until the container is registered in the running map
        for _ in 0..100 {
            if engine.subscribe_logs("t2").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.cancel("t2").await.unwrap();

        // Graceful stop was attempted before removal
        assert_eq!(runtime.stops.lock().unwrap().len(), 1);

        // Exactly one cancellation report; the lifecycle sent no failed one
        let report = wait_for_report(&stub, "t2").await;
        assert_eq!(report.status, TaskStatus::Cancelled);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reports = stub.reports.lock().unwrap();
        assert_eq!(
            reports.iter().filter(|r| r.task_id == "t2").count(),
            1,
            "cancelled task must produce exactly one report from the worker"
        );

        assert!(engine.running_task_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_errors() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let engine = engine_with(FakeRuntime::completing(0, &[]), &stub.url, &output_root);
        assert!(engine.cancel("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_output_files_uploaded_with_terminal_chunk() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::hanging();
        let engine = engine_with(runtime.clone(), &stub.url, &output_root);

        engine.submit(task("t3", None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Simulate the container writing into its /output mount, then exit
        let task_output = output_root.path().join("t3");
        std::fs::write(task_output.join("result.json"), b"{\"ok\":true}").unwrap();
        runtime.stopped.store(true, Ordering::SeqCst);
        runtime.stop_signal.notify_waiters();

        let report = wait_for_report(&stub, "t3").await;
        assert_eq!(report.output_files, vec!["result.json".to_string()]);

        let chunks = stub.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert_eq!(chunks[0].relative_path, "result.json");
        assert_eq!(
            shared::utils::decode_payload(&chunks[0].data).unwrap(),
            b"{\"ok\":true}"
        );
    }

    #[tokio::test]
    async fn test_log_subscription_streams_lines() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::hanging();
        let engine = engine_with(runtime.clone(), &stub.url, &output_root);

        engine.submit(task("t4", None)).await.unwrap();
        let mut rx = None;
        for _ in 0..100 {
            rx = engine.subscribe_logs("t4").await;
            if rx.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut rx = rx.expect("task should be subscribable while running");

        // The fake container emitted one line before hanging
        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten();
        if let Some(line) = line {
            assert_eq!(line.content, "sleeping");
        }
        engine.cancel("t4").await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_snapshot_lists_running_tasks() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::hanging();
        let engine = engine_with(runtime, &stub.url, &output_root);

        engine.submit(task("t5", None)).await.unwrap();
        let infos = engine.running_task_infos().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].task_id, "t5");
        assert_eq!(infos[0].allocated.cpu, 1.0);
        assert_eq!(infos[0].status, TaskStatus::Running);
        engine.cancel("t5").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_reports_terminated() {
        let stub = master_stub().await;
        let output_root = TempDir::new().unwrap();
        let runtime = FakeRuntime::hanging();
        let engine = engine_with(runtime.clone(), &stub.url, &output_root);

        engine.submit(task("t6", None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;

        let report = wait_for_report(&stub, "t6").await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.logs, "terminated");
        assert!(engine.running_task_ids().await.is_empty());
    }
}
