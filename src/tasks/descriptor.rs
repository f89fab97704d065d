//! Task descriptors, queue definitions, and the task registry.
//!
//! A descriptor is a plain value built per accepted request: either an
//! ordered list of steps for the default sequencer, or a custom control-flow
//! closure for tasks that need to wrap the whole run (for example holding an
//! advisory lock across every step). Queue definitions are assembled at
//! startup and passed into the dispatcher explicitly; nothing here is global.

use anyhow::bail;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::TaskFailure;
use crate::protocol::TaskRequest;
use crate::tasks::context::TaskContext;
use crate::tasks::step::Step;

/// Custom control flow that drives the context directly, bypassing the
/// default sequencer. Consumed by exactly one run.
pub type CustomFlow =
    Box<dyn for<'a> FnOnce(&'a mut TaskContext) -> BoxFuture<'a, Result<(), TaskFailure>> + Send>;

pub enum TaskFlow {
    /// Ordered steps run by the default sequencer.
    Steps(Vec<Step>),
    /// Custom start routine owning its own sequencing.
    Custom(CustomFlow),
}

pub struct TaskDescriptor {
    pub flow: TaskFlow,
}

impl TaskDescriptor {
    pub fn steps(steps: Vec<Step>) -> Self {
        Self {
            flow: TaskFlow::Steps(steps),
        }
    }

    pub fn custom(flow: CustomFlow) -> Self {
        Self {
            flow: TaskFlow::Custom(flow),
        }
    }
}

/// Builds the descriptor for one accepted request.
pub type DescriptorFn = fn(&TaskRequest) -> TaskDescriptor;

/// One registrable task name and its descriptor constructor.
#[derive(Clone, Copy, Debug)]
pub struct TaskSpec {
    pub name: &'static str,
    pub build: DescriptorFn,
}

/// Static configuration for a group of related tasks.
///
/// Read-only once registered; dispatch never mutates queue definitions.
#[derive(Debug)]
pub struct QueueDefinition {
    pub name: &'static str,
    pub tasks: Vec<TaskSpec>,
    /// Wall-clock budget override for this queue's tasks. `None` uses the
    /// agent-wide default.
    pub timeout: Option<Duration>,
    /// When false, request parameters are never written to any log — not the
    /// daemon log and not the per-task log, at any level.
    pub log_params: bool,
}

/// A task name resolved to its queue and constructor.
#[derive(Clone, Copy)]
pub struct ResolvedTask<'a> {
    pub queue: &'a QueueDefinition,
    pub spec: &'a TaskSpec,
}

/// Union of all queue definitions, keyed by task name.
///
/// Construction fails on duplicate task names: a name must resolve to at
/// most one handler per agent.
#[derive(Debug)]
pub struct TaskRegistry {
    queues: Vec<QueueDefinition>,
    by_task: HashMap<&'static str, (usize, usize)>,
}

impl TaskRegistry {
    pub fn new(queues: Vec<QueueDefinition>) -> anyhow::Result<Self> {
        let mut by_task = HashMap::new();
        for (qi, queue) in queues.iter().enumerate() {
            for (si, spec) in queue.tasks.iter().enumerate() {
                if let Some((prev_qi, _)) = by_task.insert(spec.name, (qi, si)) {
                    let prev = &queues[prev_qi];
                    bail!(
                        "task '{}' registered by both queue '{}' and queue '{}'",
                        spec.name,
                        prev.name,
                        queue.name
                    );
                }
            }
        }
        Ok(Self { queues, by_task })
    }

    pub fn resolve(&self, task: &str) -> Option<ResolvedTask<'_>> {
        let &(qi, si) = self.by_task.get(task)?;
        let queue = &self.queues[qi];
        Some(ResolvedTask {
            queue,
            spec: &queue.tasks[si],
        })
    }

    /// Registered task names in a stable order, for status surfaces.
    pub fn task_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_task.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
