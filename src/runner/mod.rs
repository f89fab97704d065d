// SPDX-License-Identifier: MIT
//! Task runner.
//!
//! The runner owns every task accepted by this agent: it spawns the task
//! body, supervises it against the queue's time budget, and settles the
//! bookkeeping (in-flight map, history) when the task ends. A task that
//! overruns its budget is forced FAILED and its body is *detached*, not
//! aborted — the stuck future keeps running in the background while its
//! instance stops listening to it.

pub mod history;
pub mod log;

pub use history::{History, HistoryEntry};
pub use log::TaskLog;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::gate::CompletionGate;
use crate::error::TaskFailure;
use crate::protocol::TaskRequest;
use crate::tasks::context::{TaskContext, TaskEnv};
use crate::tasks::descriptor::{QueueDefinition, TaskFlow, TaskSpec};
use crate::tasks::instance::TaskInstance;
use crate::tasks::step::run_steps;

pub struct Runner {
    node_id: String,
    env: TaskEnv,
    task_log_dir: PathBuf,
    default_budget: Duration,
    history: Arc<History>,
    in_flight: RwLock<HashMap<Uuid, Arc<TaskInstance>>>,
}

impl Runner {
    pub fn new(
        node_id: String,
        env: TaskEnv,
        task_log_dir: PathBuf,
        default_budget: Duration,
        history: Arc<History>,
    ) -> Self {
        Self {
            node_id,
            env,
            task_log_dir,
            default_budget,
            history,
            in_flight: RwLock::new(HashMap::new()),
        }
    }

    /// Time budget for a task on the given queue.
    pub fn budget_for(&self, queue: &QueueDefinition) -> Duration {
        queue.timeout.unwrap_or(self.default_budget)
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    pub async fn in_flight_instance(&self, id: Uuid) -> Option<Arc<TaskInstance>> {
        self.in_flight.read().await.get(&id).cloned()
    }

    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    /// Take on one validated request: spawn the body and its supervisor.
    ///
    /// Returns as soon as both are launched; the caller observes the outcome
    /// through the completion gate.
    pub async fn accept(
        self: &Arc<Self>,
        queue: &QueueDefinition,
        spec: TaskSpec,
        request: TaskRequest,
        gate: Arc<CompletionGate>,
    ) {
        let budget = self.budget_for(queue);
        let instance = Arc::new(TaskInstance::new(request.id, spec.name));
        self.in_flight
            .write()
            .await
            .insert(request.id, instance.clone());

        let log = Arc::new(TaskLog::create(&self.task_log_dir, spec.name, request.id).await);
        // Build the flow before the request moves into the context.
        let descriptor = (spec.build)(&request);

        instance.start();
        let ctx = TaskContext::new(
            request,
            self.env.clone(),
            self.node_id.clone(),
            instance.clone(),
            gate.clone(),
            log.clone(),
            queue.log_params,
        );
        ctx.log_accept().await;

        let body = tokio::spawn(run_task(ctx, descriptor.flow));

        let runner = self.clone();
        tokio::spawn(async move {
            runner.supervise(instance, gate, log, body, budget).await;
        });
    }

    /// Watch one task body against its budget, then settle the books.
    async fn supervise(
        &self,
        instance: Arc<TaskInstance>,
        gate: Arc<CompletionGate>,
        log: Arc<TaskLog>,
        body: JoinHandle<()>,
        budget: Duration,
    ) {
        tokio::select! {
            joined = body => {
                if let Err(e) = joined {
                    // The body panicked. Settle both sides of the exchange so
                    // the dispatcher is not left waiting out its grace window.
                    warn!(id = %instance.id, task = %instance.task, error = %e, "task body aborted");
                    log.line(&format!("task body aborted: {e}")).await;
                    let failure = TaskFailure::new(format!("task body aborted: {e}"));
                    if instance.fatal(failure.clone()) {
                        gate.record_error(failure);
                    }
                    gate.ack_domain();
                    gate.ack_event();
                }
            }
            _ = tokio::time::sleep(budget) => {
                let failure = TaskFailure::new(format!(
                    "task did not complete within {}s",
                    budget.as_secs()
                ));
                warn!(
                    id = %instance.id,
                    task = %instance.task,
                    budget_secs = budget.as_secs(),
                    "task exceeded its budget — forcing failure and detaching the body"
                );
                log.line(&failure.message).await;
                // The transition can lose a race against a body finishing at
                // the deadline; in that case the body's verdict stands.
                if instance.force_timeout(failure.clone()) {
                    gate.record_error(failure);
                }
                gate.ack_domain();
                gate.ack_event();
                // Dropping `body` here detaches the JoinHandle without
                // aborting: the stuck future keeps running on the runtime
                // until it resolves on its own.
            }
        }

        self.in_flight.write().await.remove(&instance.id);
        self.history
            .record(HistoryEntry::from_instance(&instance))
            .await;
        info!(
            id = %instance.id,
            task = %instance.task,
            state = %instance.state(),
            progress = instance.progress(),
            "task settled"
        );
    }
}

/// Drive one task body to completion and settle the lifecycle around it.
async fn run_task(mut ctx: TaskContext, flow: TaskFlow) {
    let outcome = match flow {
        TaskFlow::Steps(steps) => run_steps(&steps, &mut ctx).await,
        TaskFlow::Custom(body) => body(&mut ctx).await,
    };

    match outcome {
        Err(failure) => {
            ctx.log_line(&format!("task failed: {}", failure.message)).await;
            let payload = failure.to_value();
            ctx.fatal(failure);
            ctx.event("error", payload);
        }
        Ok(()) => {
            if !ctx.is_terminal() {
                let result = ctx.result.take().unwrap_or(serde_json::Value::Null);
                ctx.log_line("task complete").await;
                ctx.finish(Some(result.clone()));
                ctx.event("finish", result);
            }
            // A body that already completed itself is left alone. If it only
            // drove one side of the gate, the exchange stays pending until
            // the dispatcher severs it.
        }
    }
}
