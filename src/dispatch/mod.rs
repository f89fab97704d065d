// SPDX-License-Identifier: MIT
//! Request dispatch.
//!
//! The dispatcher is the single entry point for task execution: it validates
//! the envelope, resolves the task name against the registry, hands the
//! request to the runner, and then waits on the completion gate for the
//! verdict. Rejected envelopes never touch task state — no instance, no
//! history entry, no log file.

pub mod gate;

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AgentError, RoutingError};
use crate::protocol::{DispatchEnvelope, TaskRequest};
use crate::runner::Runner;
use crate::tasks::descriptor::TaskRegistry;
use gate::{CompletionGate, TaskVerdict};

/// Allowance past the task budget before the dispatcher gives up on the
/// completion gate. Covers the window between the runner forcing a timeout
/// and the gate resolving; a gate that is still pending after this much is a
/// task body that completed without driving both acknowledgments.
pub const DISPATCH_GRACE: Duration = Duration::from_secs(15);

/// Settled exchange: the task ran (or was forced failed) and produced a
/// verdict for the response body.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub id: Uuid,
    pub task: String,
    pub verdict: TaskVerdict,
}

pub struct Dispatcher {
    node_id: String,
    registry: TaskRegistry,
    runner: Arc<Runner>,
}

impl Dispatcher {
    pub fn new(node_id: String, registry: TaskRegistry, runner: Arc<Runner>) -> Self {
        Self {
            node_id,
            registry,
            runner,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.registry.task_names()
    }

    /// Validate, route, execute, and wait for the verdict of one envelope.
    ///
    /// Validation order is part of the contract: node addressing first, then
    /// envelope completeness, then handler lookup. An envelope without a
    /// `node` field is treated as addressed to this agent.
    pub async fn dispatch(
        &self,
        envelope: DispatchEnvelope,
        origin: Option<String>,
    ) -> Result<DispatchOutcome, AgentError> {
        if let Some(node) = envelope.node.as_deref() {
            if node != self.node_id {
                warn!(
                    expected = %self.node_id,
                    received = %node,
                    "rejecting request addressed to another node"
                );
                return Err(RoutingError::WrongNode {
                    expected: self.node_id.clone(),
                    received: node.to_string(),
                }
                .into());
            }
        }

        let task = envelope
            .task
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AgentError::Validation("missing required field 'task'".to_string()))?;
        let params = envelope
            .params
            .clone()
            .ok_or_else(|| AgentError::Validation("missing required field 'params'".to_string()))?;

        let resolved = self
            .registry
            .resolve(task)
            .ok_or_else(|| RoutingError::UnknownTask(task.to_string()))?;

        let budget = self.runner.budget_for(resolved.queue);
        if resolved.queue.log_params {
            info!(task, queue = resolved.queue.name, params = %params, "dispatching task");
        } else {
            info!(task, queue = resolved.queue.name, params = "[redacted]", "dispatching task");
        }

        let mut request = TaskRequest::new(task, params);
        request.target_node = envelope.node.clone();
        request.origin = origin;
        let id = request.id;

        let gate = Arc::new(CompletionGate::new());
        self.runner
            .accept(resolved.queue, *resolved.spec, request, gate.clone())
            .await;

        match tokio::time::timeout(budget + DISPATCH_GRACE, gate.wait()).await {
            Ok(verdict) => Ok(DispatchOutcome {
                id,
                task: task.to_string(),
                verdict,
            }),
            Err(_) => {
                warn!(id = %id, task, "completion gate never resolved — severing the exchange");
                Err(AgentError::Timeout {
                    budget_secs: budget.as_secs(),
                })
            }
        }
    }
}
