// SPDX-License-Identifier: MIT
//! Task instance lifecycle.
//!
//! One `TaskInstance` exists per accepted request. Transitions are monotone:
//! PENDING → RUNNING → COMPLETE | FAILED, with the terminal states final.
//! Lifecycle calls arriving after a terminal transition are warn-logged
//! no-ops — never errors — so a slow task body signalling after a forced
//! timeout cannot disturb a settled outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TaskFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn valid_transition(from: TaskState, to: TaskState) -> bool {
    matches!(
        (from, to),
        (TaskState::Pending, TaskState::Running)
            | (TaskState::Running, TaskState::Complete)
            | (TaskState::Running, TaskState::Failed)
    )
}

#[derive(Debug)]
struct Lifecycle {
    state: TaskState,
    progress: u8,
    finished_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<TaskFailure>,
}

/// Point-in-time copy of an instance's mutable state.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub state: TaskState,
    pub progress: u8,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<TaskFailure>,
}

#[derive(Debug)]
pub struct TaskInstance {
    pub id: Uuid,
    pub task: String,
    pub started_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    /// Set when a forced timeout abandons the body task. Signals from a
    /// detached body are discarded without re-entering completion logic.
    detached: AtomicBool,
}

impl TaskInstance {
    pub fn new(id: Uuid, task: impl Into<String>) -> Self {
        Self {
            id,
            task: task.into(),
            started_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Pending,
                progress: 0,
                finished_at: None,
                result: None,
                error: None,
            }),
            detached: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn progress(&self) -> u8 {
        self.lock().progress
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// PENDING → RUNNING. Called once by the Runner before the first step.
    pub fn start(&self) {
        let mut lc = self.lock();
        if !valid_transition(lc.state, TaskState::Running) {
            warn!(id = %self.id, task = %self.task, state = %lc.state, "ignoring start on non-pending instance");
            return;
        }
        lc.state = TaskState::Running;
    }

    /// Record an absolute progress checkpoint.
    ///
    /// Checkpoints above 100 are clamped. Declaration-order monotonicity is
    /// the task author's responsibility and is not enforced here.
    pub fn record_progress(&self, checkpoint: u8) {
        let mut lc = self.lock();
        if lc.state.is_terminal() {
            self.log_discard("progress");
            return;
        }
        lc.progress = checkpoint.min(100);
    }

    /// RUNNING → COMPLETE. Returns false (and changes nothing) when the
    /// instance is already terminal.
    pub fn finish(&self, result: Option<Value>) -> bool {
        let mut lc = self.lock();
        if !valid_transition(lc.state, TaskState::Complete) {
            drop(lc);
            self.log_discard("finish");
            return false;
        }
        lc.state = TaskState::Complete;
        lc.finished_at = Some(Utc::now());
        lc.result = result;
        true
    }

    /// RUNNING → FAILED. Returns false when the instance is already terminal.
    pub fn fatal(&self, failure: TaskFailure) -> bool {
        let mut lc = self.lock();
        if !valid_transition(lc.state, TaskState::Failed) {
            drop(lc);
            self.log_discard("fatal");
            return false;
        }
        lc.state = TaskState::Failed;
        lc.finished_at = Some(Utc::now());
        lc.error = Some(failure);
        true
    }

    /// Forced FAILED on budget expiry. Marks the instance detached so every
    /// later signal from the abandoned body is dropped.
    pub fn force_timeout(&self, failure: TaskFailure) -> bool {
        self.detached.store(true, Ordering::Release);
        self.fatal(failure)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let lc = self.lock();
        InstanceSnapshot {
            state: lc.state,
            progress: lc.progress,
            finished_at: lc.finished_at,
            result: lc.result.clone(),
            error: lc.error.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().expect("instance lock poisoned")
    }

    fn log_discard(&self, signal: &str) {
        if self.is_detached() {
            debug!(id = %self.id, task = %self.task, signal, "discarding signal from detached task");
        } else {
            warn!(id = %self.id, task = %self.task, signal, "lifecycle signal after terminal state — ignored");
        }
    }
}
