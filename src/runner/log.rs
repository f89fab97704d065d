//! Per-task log files.
//!
//! Every accepted request gets its own append-only log file, named from the
//! task name and request id, created when the task is accepted and owned by
//! that task alone for its lifetime. Failure to open the file downgrades to
//! a daemon-log warning — a missing task log must never fail the task.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    file: Option<Mutex<tokio::fs::File>>,
}

impl TaskLog {
    /// Open `{dir}/{task}-{id}.log` for appending, creating `dir` as needed.
    pub async fn create(dir: &Path, task: &str, id: Uuid) -> Self {
        let path = dir.join(format!("{task}-{id}.log"));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), err = %e, "task log directory unavailable");
            return Self { path, file: None };
        }
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => Self {
                path,
                file: Some(Mutex::new(file)),
            },
            Err(e) => {
                warn!(path = %path.display(), err = %e, "task log unavailable");
                Self { path, file: None }
            }
        }
    }

    /// A log that drops everything. For tests.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line. Write errors are logged once at debug
    /// level and otherwise swallowed.
    pub async fn line(&self, message: &str) {
        let Some(file) = &self.file else { return };
        let stamped = format!(
            "{} {message}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
        );
        let mut file = file.lock().await;
        if let Err(e) = file.write_all(stamped.as_bytes()).await {
            debug!(path = %self.path.display(), err = %e, "task log write failed");
        }
    }
}
