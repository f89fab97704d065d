//! Per-task execution context.
//!
//! One `TaskContext` is built per accepted request and threaded through every
//! step of that task. It carries the immutable request, the injected shared
//! dependencies, scratch space for step-to-step values, and the lifecycle
//! primitives (`progress` / `finish` / `fatal` / `event`) that drive the
//! instance state machine and the completion gate.

use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::dispatch::gate::CompletionGate;
use crate::error::TaskFailure;
use crate::guard::ProvisionGuard;
use crate::machines::store::MachineStore;
use crate::protocol::TaskRequest;
use crate::recovery::RecoveryPaths;
use crate::runner::log::TaskLog;
use crate::tasks::instance::TaskInstance;

/// Shared dependencies injected into every task at construction time.
#[derive(Clone)]
pub struct TaskEnv {
    pub machines: Arc<dyn MachineStore>,
    pub recovery: RecoveryPaths,
    pub guard_dir: PathBuf,
}

pub struct TaskContext {
    pub request: TaskRequest,
    pub env: TaskEnv,
    /// Identity of the agent executing this task.
    pub node_id: String,
    /// Values steps pass forward to later steps.
    pub scratch: Map<String, Value>,
    /// Result assembled by the final step(s); consumed at completion.
    pub result: Option<Value>,
    /// Provisioning guard held for the task's lifetime, if any. Released
    /// explicitly on success; `Drop` covers abort paths.
    pub guard: Option<ProvisionGuard>,
    instance: Arc<TaskInstance>,
    gate: Arc<CompletionGate>,
    log: Arc<TaskLog>,
    log_params: bool,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: TaskRequest,
        env: TaskEnv,
        node_id: String,
        instance: Arc<TaskInstance>,
        gate: Arc<CompletionGate>,
        log: Arc<TaskLog>,
        log_params: bool,
    ) -> Self {
        Self {
            request,
            env,
            node_id,
            scratch: Map::new(),
            result: None,
            guard: None,
            instance,
            gate,
            log,
            log_params,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.instance.is_terminal()
    }

    /// Record an absolute progress checkpoint. Best-effort: late calls from
    /// a detached body are discarded by the instance.
    pub fn progress(&self, checkpoint: u8) {
        self.instance.record_progress(checkpoint);
    }

    /// Domain-side completion: RUNNING → COMPLETE plus the first gate
    /// acknowledgment. A no-op when the instance is already terminal.
    pub fn finish(&self, result: Option<Value>) {
        if self.instance.finish(result.clone()) {
            self.gate.record_result(result.unwrap_or(Value::Null));
            self.gate.ack_domain();
        }
    }

    /// Domain-side failure: RUNNING → FAILED plus the first gate
    /// acknowledgment. A no-op when the instance is already terminal.
    pub fn fatal(&self, failure: TaskFailure) {
        if self.instance.fatal(failure.clone()) {
            self.gate.record_error(failure);
            self.gate.ack_domain();
        }
    }

    /// Legacy event channel. `"finish"` records the result payload,
    /// `"error"` records the error payload; both supply the second gate
    /// acknowledgment. Other names are ignored. Events from a detached body
    /// are dropped without touching the gate.
    pub fn event(&self, name: &str, payload: Value) {
        if self.instance.is_detached() {
            debug!(id = %self.request.id, event = name, "dropping event from detached task");
            return;
        }
        match name {
            "finish" => {
                self.gate.record_result(payload);
                self.gate.ack_event();
            }
            "error" => {
                self.gate
                    .record_error(TaskFailure::from_event_payload(&payload));
                self.gate.ack_event();
            }
            other => {
                debug!(id = %self.request.id, event = other, "unhandled task event");
            }
        }
    }

    /// Append a line to this task's own log file.
    pub async fn log_line(&self, message: &str) {
        self.log.line(message).await;
    }

    /// First line of the task log. Parameters appear only when the owning
    /// queue allows it.
    pub async fn log_accept(&self) {
        let params = if self.log_params {
            self.request.params.to_string()
        } else {
            "[redacted]".to_string()
        };
        let origin = self.request.origin.as_deref().unwrap_or("local");
        self.log_line(&format!(
            "accepted {} request {} on node {} from {} params {}",
            self.request.task, self.request.id, self.node_id, origin, params
        ))
        .await;
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::machines::store::FsMachineStore;

    /// Minimal running context over a throwaway data dir, for step tests.
    pub fn bare_context(task: &str) -> (TaskContext, Arc<TaskInstance>, Arc<CompletionGate>) {
        bare_context_with_params(task, serde_json::json!({}))
    }

    pub fn bare_context_with_params(
        task: &str,
        params: Value,
    ) -> (TaskContext, Arc<TaskInstance>, Arc<CompletionGate>) {
        let dir = tempfile::tempdir().unwrap().keep();
        let request = TaskRequest::new(task, params);

        let instance = Arc::new(TaskInstance::new(request.id, task));
        instance.start();
        let gate = Arc::new(CompletionGate::new());
        let env = TaskEnv {
            machines: Arc::new(FsMachineStore::new(dir.join("machines"))),
            recovery: RecoveryPaths::new(dir.join("recovery")),
            guard_dir: dir.join("guards"),
        };
        let ctx = TaskContext::new(
            request,
            env,
            "station-test".to_string(),
            instance.clone(),
            gate.clone(),
            Arc::new(TaskLog::disabled()),
            true,
        );
        (ctx, instance, gate)
    }
}
