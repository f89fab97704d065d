//! Step pipeline — ordered, abort-on-first-failure.
//!
//! A step is a named async function over the shared task context plus an
//! absolute progress checkpoint in `[0, 100]`. The sequencer runs steps in
//! declaration order; the first failure aborts everything after it. There is
//! no retry and no skip.

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::error::TaskFailure;
use crate::tasks::context::TaskContext;

pub type StepFuture<'a> = BoxFuture<'a, Result<(), TaskFailure>>;

type StepHandler =
    Box<dyn for<'a> Fn(&'a mut TaskContext) -> StepFuture<'a> + Send + Sync + 'static>;

pub struct Step {
    pub name: &'static str,
    /// Absolute progress percentage reported after this step succeeds.
    /// Checkpoints must not decrease across declaration order; that is the
    /// author's responsibility, not the sequencer's.
    pub checkpoint: u8,
    pub description: &'static str,
    handler: StepHandler,
}

impl Step {
    pub fn new<F>(name: &'static str, checkpoint: u8, description: &'static str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut TaskContext) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self {
            name,
            checkpoint,
            description,
            handler: Box::new(handler),
        }
    }

    pub async fn run(&self, ctx: &mut TaskContext) -> Result<(), TaskFailure> {
        (self.handler)(ctx).await
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

/// Run steps in declaration order over one shared context.
///
/// On each success the instance progress is set to that step's checkpoint.
/// The first failure is returned as-is; no later step runs.
pub async fn run_steps(steps: &[Step], ctx: &mut TaskContext) -> Result<(), TaskFailure> {
    for step in steps {
        debug!(task = %ctx.request.task, id = %ctx.request.id, step = step.name, "step start");
        ctx.log_line(&format!("step {}: {}", step.name, step.description))
            .await;

        match step.run(ctx).await {
            Ok(()) => {
                ctx.progress(step.checkpoint);
                ctx.log_line(&format!(
                    "step {} ok — progress {}%",
                    step.name, step.checkpoint
                ))
                .await;
            }
            Err(failure) => {
                ctx.log_line(&format!("step {} failed: {}", step.name, failure.message))
                    .await;
                return Err(failure);
            }
        }
    }
    Ok(())
}
