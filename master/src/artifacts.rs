//! Artifact store: receives and serves task output files
//!
//! Workers stream each task's output as gzip/base64 chunks. Chunks append to
//! a per-task staging area; the final chunk commits the whole file set
//! atomically into the store layout
//! `<root>/<user_id>/<task_name>/<submitted_at>/<task_id>/<rel_path>`.
//! A stream that errors is aborted and its staging area discarded, so a
//! partially received file set is never visible. Directories are created
//! 0700 and files land 0600; access is per-user with an admin override.

use shared::task::Task;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default system root; falls back to the user's home when not writable
const SYSTEM_ROOT: &str = "/var/lib/taskmaster/artifacts";
const HOME_FALLBACK: &str = ".taskmaster/artifacts";

/// Upload stream state per task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Streaming,
    Done,
    Aborted,
}

/// One committed file
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedFile {
    pub relative_path: String,
    pub size_bytes: u64,
    pub checksum: String,
}

struct UploadSession {
    user_id: String,
    state: UploadState,
    staging_dir: PathBuf,
    /// Paths received so far, in arrival order
    files: Vec<String>,
}

pub struct ArtifactStore {
    root: PathBuf,
    admin_users: Vec<String>,
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl ArtifactStore {
    /// Open the store at the configured root. An empty root selects the
    /// system default, falling back to a home-relative path when the system
    /// location is not writable.
    pub fn open(configured_root: &str, admin_users: Vec<String>) -> shared::Result<Self> {
        let root = if configured_root.is_empty() {
            Self::resolve_default_root()?
        } else {
            PathBuf::from(configured_root)
        };

        create_private_dir(&root)?;
        info!(root = %root.display(), "Artifact store opened");
        Ok(Self {
            root,
            admin_users,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn resolve_default_root() -> shared::Result<PathBuf> {
        let system = PathBuf::from(SYSTEM_ROOT);
        if create_private_dir(&system).is_ok() {
            return Ok(system);
        }
        let home = std::env::var("HOME").map_err(|_| {
            shared::OrchestratorError::Config(
                "Artifact root not writable and HOME is unset".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(HOME_FALLBACK))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `requester` may touch artifacts owned by `target_user`
    pub fn access_allowed(&self, requester: &str, target_user: &str) -> bool {
        requester == target_user || self.admin_users.iter().any(|admin| admin == requester)
    }

    /// Final directory for a task's artifacts
    pub fn task_dir(&self, task: &Task) -> PathBuf {
        self.root
            .join(&task.user_id)
            .join(&task.task_name)
            .join(task.submitted_at.to_string())
            .join(&task.task_id)
    }

    fn staging_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(".staging").join(task_id)
    }

    /// Append one decoded chunk to the task's staging area. `is_last` closes
    /// the stream and commits the staged file set atomically, returning the
    /// committed files. A `None` return means the stream is still open.
    pub async fn ingest_chunk(
        &self,
        task: &Task,
        relative_path: &str,
        data: &[u8],
        is_last: bool,
    ) -> shared::Result<Option<Vec<CommittedFile>>> {
        let relative_path = shared::utils::sanitize_relative_path(relative_path)?;

        let mut sessions = self.sessions.lock().await;

        let staging_dir = match sessions.get(&task.task_id) {
            Some(session) => {
                if session.state != UploadState::Streaming {
                    return Err(shared::OrchestratorError::Validation(format!(
                        "Upload stream for task '{}' is already closed",
                        task.task_id
                    ))
                    .into());
                }
                if session.user_id != task.user_id {
                    return Err(shared::OrchestratorError::Validation(format!(
                        "Upload stream for task '{}' belongs to another user",
                        task.task_id
                    ))
                    .into());
                }
                session.staging_dir.clone()
            }
            None => {
                let staging_dir = self.staging_dir(&task.task_id);
                create_private_dir(&staging_dir)?;
                debug!(task_id = %task.task_id, "Upload stream opened");
                sessions.insert(
                    task.task_id.clone(),
                    UploadSession {
                        user_id: task.user_id.clone(),
                        state: UploadState::Streaming,
                        staging_dir: staging_dir.clone(),
                        files: Vec::new(),
                    },
                );
                staging_dir
            }
        };

        // Append the chunk to the staged file, creating parents as needed.
        let staged_path = staging_dir.join(&relative_path);
        if let Some(parent) = staged_path.parent() {
            create_private_dir(parent)?;
        }
        let append = (|| -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&staged_path)?;
            file.write_all(data)?;
            Ok(())
        })();
        if let Err(e) = append {
            // A failed write poisons the stream; discard everything staged.
            self.abort_locked(&task.task_id, &mut sessions);
            return Err(shared::OrchestratorError::Validation(format!(
                "Failed to stage chunk for task '{}': {}",
                task.task_id, e
            ))
            .into());
        }

        let session = sessions
            .get_mut(&task.task_id)
            .expect("session inserted above");
        if !session.files.iter().any(|f| f == &relative_path) {
            session.files.push(relative_path.clone());
        }

        if !is_last {
            return Ok(None);
        }

        // Terminal chunk: commit the staged set into the final layout.
        session.state = UploadState::Done;
        let session = sessions
            .remove(&task.task_id)
            .expect("session exists in this branch");
        drop(sessions);

        let final_dir = self.task_dir(task);
        let committed = commit_staged(&session.staging_dir, &final_dir, &session.files)?;
        let _ = std::fs::remove_dir_all(&session.staging_dir);

        info!(
            task_id = %task.task_id,
            files = committed.len(),
            "Artifact file set committed"
        );
        Ok(Some(committed))
    }

    /// Abort a task's upload stream, discarding staged files. Safe to call
    /// for unknown tasks.
    pub async fn abort(&self, task_id: &str) {
        let mut sessions = self.sessions.lock().await;
        self.abort_locked(task_id, &mut sessions);
    }

    fn abort_locked(&self, task_id: &str, sessions: &mut HashMap<String, UploadSession>) {
        if let Some(mut session) = sessions.remove(task_id) {
            session.state = UploadState::Aborted;
            if let Err(e) = std::fs::remove_dir_all(&session.staging_dir) {
                warn!(task_id = %task_id, error = %e, "Failed to discard staging directory");
            }
            info!(task_id = %task_id, "Upload stream aborted, staged files discarded");
        }
    }

    /// Current state of a task's upload stream, if one is open
    pub async fn stream_state(&self, task_id: &str) -> Option<UploadState> {
        self.sessions.lock().await.get(task_id).map(|s| s.state)
    }

    /// Open a committed artifact for download, access-checked.
    pub fn open_file(
        &self,
        requester: &str,
        task: &Task,
        relative_path: &str,
    ) -> shared::Result<PathBuf> {
        if !self.access_allowed(requester, &task.user_id) {
            return Err(shared::OrchestratorError::Validation(format!(
                "User '{}' may not access artifacts of '{}'",
                requester, task.user_id
            ))
            .into());
        }
        let relative_path = shared::utils::sanitize_relative_path(relative_path)?;
        let path = self.task_dir(task).join(relative_path);
        if !path.is_file() {
            return Err(shared::OrchestratorError::Validation(
                "Artifact file not found".to_string(),
            )
            .into());
        }
        Ok(path)
    }
}

/// Create a directory (and parents) with owner-only permissions
fn create_private_dir(dir: &Path) -> shared::Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        shared::OrchestratorError::Config(format!(
            "Failed to create directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(dir, perms).map_err(|e| {
            shared::OrchestratorError::Config(format!(
                "Failed to set permissions on {}: {}",
                dir.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Move the staged files into the final directory, returning their metadata.
fn commit_staged(
    staging_dir: &Path,
    final_dir: &Path,
    files: &[String],
) -> shared::Result<Vec<CommittedFile>> {
    create_private_dir(final_dir)?;

    let mut committed = Vec::with_capacity(files.len());
    for relative_path in files {
        let staged = staging_dir.join(relative_path);
        let target = final_dir.join(relative_path);
        if let Some(parent) = target.parent() {
            create_private_dir(parent)?;
        }
        std::fs::rename(&staged, &target).map_err(|e| {
            shared::OrchestratorError::Validation(format!(
                "Failed to commit artifact {}: {}",
                relative_path, e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&target, perms) {
                warn!(path = %target.display(), error = %e, "Failed to set file permissions");
            }
        }

        let bytes = std::fs::read(&target).map_err(|e| {
            shared::OrchestratorError::Validation(format!(
                "Failed to read committed artifact {}: {}",
                relative_path, e
            ))
        })?;
        committed.push(CommittedFile {
            relative_path: relative_path.clone(),
            size_bytes: bytes.len() as u64,
            checksum: shared::utils::calculate_checksum(&bytes),
        });
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::task::{ResourceRequest, TaskStatus, TaskType};
    use tempfile::TempDir;

    fn task(task_id: &str, user_id: &str) -> Task {
        Task {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            task_name: "job".to_string(),
            image: "hello-world".to_string(),
            command: vec![],
            request: ResourceRequest::default(),
            task_type: TaskType::CpuLight,
            tau_seconds: None,
            sla_multiplier: 2.0,
            submitted_at: 1_234,
            status: TaskStatus::Running,
            started_at: None,
            completed_at: None,
        }
    }

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::open(
            dir.path().join("artifacts").to_str().unwrap(),
            vec!["root".to_string()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_chunked_upload_commits_atomically() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task("t1", "alice");

        // Two chunks of one file, then a second file closing the stream
        assert!(store
            .ingest_chunk(&task, "out/part.txt", b"hello ", false)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.stream_state("t1").await,
            Some(UploadState::Streaming)
        );
        assert!(store
            .ingest_chunk(&task, "out/part.txt", b"world", false)
            .await
            .unwrap()
            .is_none());

        // Nothing visible in the final layout before commit
        assert!(!store.task_dir(&task).exists());

        let committed = store
            .ingest_chunk(&task, "summary.txt", b"done", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(committed.len(), 2);

        let part = std::fs::read_to_string(store.task_dir(&task).join("out/part.txt")).unwrap();
        assert_eq!(part, "hello world");
        let summary = std::fs::read_to_string(store.task_dir(&task).join("summary.txt")).unwrap();
        assert_eq!(summary, "done");

        // Session is gone and staging cleaned up
        assert!(store.stream_state("t1").await.is_none());
        assert!(!store.staging_dir("t1").exists());
    }

    #[tokio::test]
    async fn test_layout_contains_user_name_time_and_task() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task("t9", "bob");
        store
            .ingest_chunk(&task, "a.txt", b"x", true)
            .await
            .unwrap();

        let expected = store
            .root()
            .join("bob")
            .join("job")
            .join("1234")
            .join("t9")
            .join("a.txt");
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_abort_discards_staged_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task("t1", "alice");

        store
            .ingest_chunk(&task, "out.bin", b"partial", false)
            .await
            .unwrap();
        store.abort("t1").await;

        assert!(store.stream_state("t1").await.is_none());
        assert!(!store.staging_dir("t1").exists());
        assert!(!store.task_dir(&task).exists());

        // Aborting again is harmless
        store.abort("t1").await;
    }

    #[tokio::test]
    async fn test_traversal_paths_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task("t1", "alice");

        assert!(store
            .ingest_chunk(&task, "../escape.txt", b"x", true)
            .await
            .is_err());
        assert!(store
            .ingest_chunk(&task, "/abs.txt", b"x", true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_access_control() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task("t1", "alice");
        store
            .ingest_chunk(&task, "out.txt", b"data", true)
            .await
            .unwrap();

        // Owner and admin may read; another user may not
        assert!(store.open_file("alice", &task, "out.txt").is_ok());
        assert!(store.open_file("root", &task, "out.txt").is_ok());
        assert!(store.open_file("mallory", &task, "out.txt").is_err());
        // Missing file errors even for the owner
        assert!(store.open_file("alice", &task, "missing.txt").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task("t1", "alice");
        store
            .ingest_chunk(&task, "out.txt", b"data", true)
            .await
            .unwrap();

        let dir_mode = std::fs::metadata(store.task_dir(&task))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = std::fs::metadata(store.task_dir(&task).join("out.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_checksums_recorded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = task("t1", "alice");

        let committed = store
            .ingest_chunk(&task, "out.txt", b"data", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(committed[0].size_bytes, 4);
        assert_eq!(
            committed[0].checksum,
            shared::utils::calculate_checksum(b"data")
        );
    }
}
