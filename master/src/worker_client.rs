//! Outbound HTTP client for worker control calls
//!
//! Thin reqwest wrapper used by the assignment engine, the cancellation path,
//! and the reconnection monitor. Every call carries an explicit timeout; no
//! outbound worker RPC can hang the caller.

use anyhow::{Context, Result};
use shared::api::{
    endpoints, headers, AssignTaskRequest, CancelTaskRequest, MasterInfo, TaskAck,
};
use shared::task::Task;
use std::time::Duration;

#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    api_key: String,
}

impl WorkerClient {
    pub fn new(api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to create worker HTTP client")?;
        Ok(Self { http, api_key })
    }

    fn url(address: &str, path: &str) -> String {
        format!("http://{}{}", address, path)
    }

    /// Send a task to a worker. The ack must report success for the
    /// assignment to count.
    pub async fn assign_task(&self, address: &str, task: &Task, timeout: Duration) -> Result<()> {
        let url = Self::url(address, endpoints::TASK_ASSIGN);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(headers::API_KEY, &self.api_key)
            .json(&AssignTaskRequest { task: task.clone() })
            .send()
            .await
            .with_context(|| format!("Failed to send task to worker at {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Worker rejected assignment with HTTP {}", response.status());
        }

        let ack: TaskAck = response
            .json()
            .await
            .context("Failed to parse assignment ack")?;
        if !ack.success {
            anyhow::bail!("Worker declined assignment: {}", ack.message);
        }
        Ok(())
    }

    /// Ask a worker to cancel a task.
    pub async fn cancel_task(
        &self,
        address: &str,
        task_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let url = Self::url(address, endpoints::TASK_CANCEL);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(headers::API_KEY, &self.api_key)
            .json(&CancelTaskRequest {
                task_id: task_id.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("Failed to send cancellation to worker at {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Worker rejected cancellation with HTTP {}",
                response.status()
            );
        }
        Ok(())
    }

    /// Short probe of a worker's health endpoint.
    pub async fn probe_health(&self, address: &str, timeout: Duration) -> Result<()> {
        let url = Self::url(address, endpoints::HEALTH);
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("Probe of {} failed", url))?;
        if !response.status().is_success() {
            anyhow::bail!("Worker health probe returned HTTP {}", response.status());
        }
        Ok(())
    }

    /// Tell a worker which master to register with.
    pub async fn master_register(
        &self,
        address: &str,
        info: &MasterInfo,
        timeout: Duration,
    ) -> Result<()> {
        let url = Self::url(address, endpoints::MASTER_REGISTER);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(headers::API_KEY, &self.api_key)
            .json(info)
            .send()
            .await
            .with_context(|| format!("Failed to reach worker at {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Worker rejected master registration with HTTP {}",
                response.status()
            );
        }
        Ok(())
    }
}
