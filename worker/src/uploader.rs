//! Output artifact collection and chunked upload
//!
//! After a container exits, everything under its `/output` bind mount is
//! collected and streamed to the master as gzip/base64 chunks. Chunks of one
//! file go in order; `is_last` rides on the final chunk of the final file so
//! the master can commit the whole set atomically. A chunk that keeps failing
//! aborts the upload; the master discards the partial stream.

use crate::client::MasterClient;
use shared::api::FileChunk;
use shared::task::Task;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts per chunk before the upload is abandoned
const CHUNK_ATTEMPTS: u32 = 3;

pub struct OutputUploader {
    client: Arc<MasterClient>,
    chunk_bytes: usize,
}

impl OutputUploader {
    pub fn new(client: Arc<MasterClient>, chunk_bytes: usize) -> Self {
        Self {
            client,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    /// Upload every file under `output_dir`, returning the relative paths
    /// sent. An empty directory uploads nothing and returns an empty list.
    pub async fn upload_dir(&self, task: &Task, output_dir: &Path) -> shared::Result<Vec<String>> {
        let files = collect_files(output_dir)?;
        if files.is_empty() {
            debug!(task_id = %task.task_id, "No output files to upload");
            return Ok(Vec::new());
        }

        info!(
            task_id = %task.task_id,
            files = files.len(),
            "Uploading output files"
        );

        let mut uploaded = Vec::with_capacity(files.len());
        let file_count = files.len();
        for (file_index, relative_path) in files.iter().enumerate() {
            let content = std::fs::read(output_dir.join(relative_path)).map_err(|e| {
                shared::OrchestratorError::TaskExecution(format!(
                    "Failed to read output file {}: {}",
                    relative_path, e
                ))
            })?;

            // Even an empty file produces one chunk so the master sees it.
            let chunks: Vec<&[u8]> = if content.is_empty() {
                vec![&[]]
            } else {
                content.chunks(self.chunk_bytes).collect()
            };
            let chunk_count = chunks.len();

            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                let is_last =
                    file_index + 1 == file_count && chunk_index + 1 == chunk_count;
                let file_chunk = FileChunk {
                    task_id: task.task_id.clone(),
                    user_id: task.user_id.clone(),
                    relative_path: relative_path.clone(),
                    data: shared::utils::encode_payload(chunk)?,
                    is_last,
                };
                self.send_chunk(&file_chunk).await?;
            }
            uploaded.push(relative_path.clone());
        }

        info!(task_id = %task.task_id, files = uploaded.len(), "Output upload complete");
        Ok(uploaded)
    }

    async fn send_chunk(&self, chunk: &FileChunk) -> shared::Result<()> {
        let mut last_error = None;
        for attempt in 0..CHUNK_ATTEMPTS {
            if attempt > 0 {
                let delay = shared::utils::calculate_backoff_delay(attempt - 1, 250, 5_000);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match self.client.upload_chunk(chunk).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        task_id = %chunk.task_id,
                        path = %chunk.relative_path,
                        attempt = attempt + 1,
                        error = %e,
                        "Chunk upload attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(shared::OrchestratorError::Network(format!(
            "Upload of {} abandoned: {}",
            chunk.relative_path,
            last_error.expect("at least one attempt ran")
        ))
        .into())
    }
}

/// Recursively collect relative file paths under `dir`, sorted for a
/// deterministic upload order.
fn collect_files(dir: &Path) -> shared::Result<Vec<String>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    walk(dir, dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn walk(root: &Path, dir: &Path, files: &mut Vec<String>) -> shared::Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        shared::OrchestratorError::TaskExecution(format!(
            "Failed to read output directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| {
            shared::OrchestratorError::TaskExecution(format!("Failed to read dir entry: {}", e))
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, files)?;
        } else if path.is_file() {
            let relative: PathBuf = path
                .strip_prefix(root)
                .expect("walk stays under root")
                .to_path_buf();
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use shared::api::{endpoints, UploadAck};
    use shared::task::{ResourceRequest, TaskStatus, TaskType};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn task() -> Task {
        Task {
            task_id: "t1".to_string(),
            user_id: "alice".to_string(),
            task_name: "job".to_string(),
            image: "hello".to_string(),
            command: vec![],
            request: ResourceRequest::default(),
            task_type: TaskType::CpuLight,
            tau_seconds: None,
            sla_multiplier: 2.0,
            submitted_at: 0,
            status: TaskStatus::Running,
            started_at: None,
            completed_at: None,
        }
    }

    /// Master stub that records every received chunk
    async fn chunk_sink() -> (String, Arc<StdMutex<Vec<FileChunk>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        let app = Router::new().route(
            endpoints::FILE_UPLOAD,
            post(move |Json(chunk): Json<FileChunk>| {
                let received = received_clone.clone();
                async move {
                    received.lock().unwrap().push(chunk);
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
        (url, received)
    }

    fn uploader(url: String, chunk_bytes: usize) -> OutputUploader {
        let client = Arc::new(
            MasterClient::new(url, "secret".to_string(), "w1".to_string(), 5, 0).unwrap(),
        );
        OutputUploader::new(client, chunk_bytes)
    }

    #[tokio::test]
    async fn test_upload_chunks_and_terminal_flag() {
        let (url, received) = chunk_sink().await;
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("nested/b.txt"), b"xy").unwrap();

        // 4-byte chunks: a.txt -> 3 chunks, b.txt -> 1 chunk
        let uploaded = uploader(url, 4)
            .upload_dir(&task(), dir.path())
            .await
            .unwrap();
        assert_eq!(uploaded, vec!["a.txt".to_string(), "nested/b.txt".to_string()]);

        let chunks = received.lock().unwrap();
        assert_eq!(chunks.len(), 4);
        // Only the very last chunk carries is_last
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.is_last, i == chunks.len() - 1, "chunk {}", i);
        }
        assert_eq!(chunks[3].relative_path, "nested/b.txt");

        // Reassemble a.txt from its chunks
        let mut reassembled = Vec::new();
        for chunk in chunks.iter().filter(|c| c.relative_path == "a.txt") {
            reassembled.extend(shared::utils::decode_payload(&chunk.data).unwrap());
        }
        assert_eq!(reassembled, b"0123456789");
    }

    #[tokio::test]
    async fn test_empty_dir_uploads_nothing() {
        let (url, received) = chunk_sink().await;
        let dir = TempDir::new().unwrap();
        let uploaded = uploader(url, 1024)
            .upload_dir(&task(), dir.path())
            .await
            .unwrap();
        assert!(uploaded.is_empty());
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty_upload() {
        let (url, _received) = chunk_sink().await;
        let uploaded = uploader(url, 1024)
            .upload_dir(&task(), Path::new("/nonexistent/output"))
            .await
            .unwrap();
        assert!(uploaded.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_master_fails_upload() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"data").unwrap();
        let result = uploader("http://127.0.0.1:1".to_string(), 1024)
            .upload_dir(&task(), dir.path())
            .await;
        assert!(result.is_err());
    }
}
