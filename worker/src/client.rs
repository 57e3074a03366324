//! HTTP client for worker-to-master communication
//!
//! Wraps reqwest with the master's endpoints, authentication headers, and
//! typed request/response handling. The result report carries its own retry
//! loop with exponential backoff because it is the path that releases
//! resources on the master; everything else leaves retrying to its caller.

use anyhow::{Context, Result};
use shared::api::{
    endpoints, headers, FileChunk, HeartbeatAck, HeartbeatRequest, RegisterAck,
    RegisterWorkerRequest, ResultAck, TaskResultReport, UploadAck,
};
use shared::worker::WorkerInfo;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct MasterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    worker_id: String,
    report_max_retries: u32,
}

impl MasterClient {
    pub fn new(
        base_url: String,
        api_key: String,
        worker_id: String,
        timeout_seconds: u64,
        report_max_retries: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create master HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            worker_id,
            report_max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .header(headers::API_KEY, &self.api_key)
            .header(headers::WORKER_ID, &self.worker_id)
            .header(headers::CONTENT_TYPE, "application/json")
    }

    /// Register (or re-register) this worker, declaring its capacity and the
    /// tasks it still runs so the master can reconcile.
    pub async fn register(
        &self,
        info: &WorkerInfo,
        running_task_ids: Vec<String>,
    ) -> Result<RegisterAck> {
        let request = RegisterWorkerRequest {
            worker: info.clone(),
            running_task_ids,
        };
        let response = self
            .post(endpoints::WORKER_REGISTER)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach master at {}", self.base_url))?;

        if !response.status().is_success() {
            anyhow::bail!("Master rejected registration with HTTP {}", response.status());
        }

        let ack: RegisterAck = response
            .json()
            .await
            .context("Failed to parse registration ack")?;
        if !ack.success {
            anyhow::bail!("Master declined registration: {}", ack.message);
        }
        info!(worker_id = %info.worker_id, "Registered with master");
        Ok(ack)
    }

    /// Send one heartbeat.
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatAck> {
        let response = self
            .post(endpoints::WORKER_HEARTBEAT)
            .json(request)
            .send()
            .await
            .context("Heartbeat send failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Master rejected heartbeat with HTTP {}", response.status());
        }
        response.json().await.context("Failed to parse heartbeat ack")
    }

    /// Report a terminal result, retrying with exponential backoff. The
    /// master acks duplicates, so retrying a report that actually landed is
    /// harmless.
    pub async fn report_completion(&self, report: &TaskResultReport) -> Result<ResultAck> {
        let mut last_error = None;
        for attempt in 0..=self.report_max_retries {
            if attempt > 0 {
                let delay = shared::utils::calculate_backoff_delay(attempt - 1, 500, 10_000);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match self.try_report(report).await {
                Ok(ack) => {
                    debug!(
                        task_id = %report.task_id,
                        recorded = ack.recorded,
                        "Result report delivered"
                    );
                    return Ok(ack);
                }
                Err(e) => {
                    warn!(
                        task_id = %report.task_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Result report attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }

    async fn try_report(&self, report: &TaskResultReport) -> Result<ResultAck> {
        let response = self
            .post(endpoints::TASK_REPORT)
            .json(report)
            .send()
            .await
            .context("Result report send failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Master rejected result with HTTP {}", response.status());
        }
        response.json().await.context("Failed to parse result ack")
    }

    /// Report a terminal result once with a short timeout. Used during
    /// graceful shutdown where waiting out the full retry schedule would
    /// stall the exit.
    pub async fn report_completion_fast(
        &self,
        report: &TaskResultReport,
        timeout: Duration,
    ) -> Result<ResultAck> {
        let response = self
            .post(endpoints::TASK_REPORT)
            .timeout(timeout)
            .json(report)
            .send()
            .await
            .context("Result report send failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Master rejected result with HTTP {}", response.status());
        }
        response.json().await.context("Failed to parse result ack")
    }

    /// Upload one artifact chunk.
    pub async fn upload_chunk(&self, chunk: &FileChunk) -> Result<UploadAck> {
        let response = self
            .post(endpoints::FILE_UPLOAD)
            .json(chunk)
            .send()
            .await
            .context("Chunk upload failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Master rejected chunk with HTTP {}", response.status());
        }
        response.json().await.context("Failed to parse upload ack")
    }
}
