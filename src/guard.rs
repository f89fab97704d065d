// SPDX-License-Identifier: MIT
//! Provisioning guards — advisory exclusive markers keyed by resource id.
//!
//! A guard is a marker file created with `O_CREAT | O_EXCL` semantics, so two
//! tasks provisioning the same resource race on a single atomic filesystem
//! operation: one wins, the other fails fast. There is no queue and no wait.
//!
//! Release is explicit so callers can log a failed removal as an
//! infrastructure error; `Drop` is the backstop for abort paths.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{AgentError, TaskFailure};

#[derive(Debug)]
pub struct ProvisionGuard {
    path: PathBuf,
    released: bool,
}

impl ProvisionGuard {
    /// Fail-fast acquisition. Errors when a guard for `resource_id` is
    /// already held by anyone, including this process.
    pub async fn acquire(dir: &Path, resource_id: &str) -> Result<Self, TaskFailure> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{resource_id}.guard"));

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                // Owner breadcrumb for operators inspecting a stale guard.
                let line = format!("pid={} acquired={}\n", std::process::id(), chrono::Utc::now().to_rfc3339());
                let _ = file.write_all(line.as_bytes()).await;
                Ok(Self {
                    path,
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(TaskFailure::new(
                format!("provisioning guard for '{resource_id}' is already held"),
            )),
            Err(e) => Err(TaskFailure::new(format!(
                "could not create guard {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release. A failure here is an infrastructure error for the
    /// caller to log — it must never retroactively fail a finished task.
    pub async fn release(mut self) -> Result<(), AgentError> {
        self.released = true;
        tokio::fs::remove_file(&self.path).await.map_err(|e| {
            AgentError::Infrastructure(format!(
                "failed to remove guard {}: {e}",
                self.path.display()
            ))
        })
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), err = %e, "guard not removed on drop");
            }
        }
    }
}
