// SPDX-License-Identifier: MIT
//! Key-recovery configuration tasks.
//!
//! `recovery_stage` lands a volume's recovery configuration in the staged
//! area with a SHA-256 digest sidecar; `recovery_activate` promotes staged
//! to active under an advisory lock held across the whole run. The queue is
//! registered with `log_params = false` — parameters carry key material and
//! must never reach any log.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;

use crate::error::TaskFailure;
use crate::guard::ProvisionGuard;
use crate::protocol::TaskRequest;
use crate::tasks::context::TaskContext;
use crate::tasks::descriptor::{QueueDefinition, TaskDescriptor, TaskSpec};
use crate::tasks::step::{Step, StepFuture};

/// Filesystem layout of the recovery area: `staged/` for configurations
/// written but not yet live, `active/` for the live ones.
#[derive(Debug, Clone)]
pub struct RecoveryPaths {
    root: PathBuf,
}

impl RecoveryPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.root.join("staged")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn staged(&self, volume: &str) -> PathBuf {
        self.staged_dir().join(format!("{volume}.conf"))
    }

    pub fn staged_digest(&self, volume: &str) -> PathBuf {
        self.staged_dir().join(format!("{volume}.sha256"))
    }

    pub fn active(&self, volume: &str) -> PathBuf {
        self.active_dir().join(format!("{volume}.conf"))
    }

    pub fn active_digest(&self, volume: &str) -> PathBuf {
        self.active_dir().join(format!("{volume}.sha256"))
    }
}

pub fn queue() -> QueueDefinition {
    QueueDefinition {
        name: "recovery",
        tasks: vec![
            TaskSpec {
                name: "recovery_stage",
                build: recovery_stage,
            },
            TaskSpec {
                name: "recovery_activate",
                build: recovery_activate,
            },
        ],
        timeout: None,
        log_params: false,
    }
}

fn recovery_stage(_request: &TaskRequest) -> TaskDescriptor {
    TaskDescriptor::steps(vec![
        Step::new("validate", 20, "validate recovery parameters", validate_stage),
        Step::new("stage", 70, "write the staged configuration", stage),
        Step::new("verify", 100, "check the staged configuration digest", verify_staged),
    ])
}

fn recovery_activate(_request: &TaskRequest) -> TaskDescriptor {
    TaskDescriptor::custom(Box::new(activate_flow))
}

// ─── recovery_stage steps ───────────────────────────────────────────────────

fn validate_stage(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let volume = require_volume(&ctx.request.params)?;
        let key_data = ctx.request.params.get("key_data").and_then(Value::as_str);
        match key_data {
            Some(k) if !k.is_empty() => {}
            _ => {
                return Err(TaskFailure::new(
                    "missing required parameter 'key_data'",
                ))
            }
        }
        ctx.scratch.insert("recovery_volume".into(), json!(volume));
        Ok(())
    })
}

fn stage(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let volume = scratch_volume(ctx)?;
        let key_data = ctx
            .request
            .params
            .get("key_data")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| TaskFailure::new("missing required parameter 'key_data'"))?;

        let paths = ctx.env.recovery.clone();
        fs::create_dir_all(paths.staged_dir())
            .await
            .map_err(|e| TaskFailure::new(format!("creating staged dir: {e}")))?;

        // Atomic write: write to tmp, then rename.
        let conf = paths.staged(&volume);
        let tmp = conf.with_extension("conf.tmp");
        fs::write(&tmp, key_data.as_bytes())
            .await
            .map_err(|e| TaskFailure::new(format!("writing staged configuration: {e}")))?;
        fs::rename(&tmp, &conf)
            .await
            .map_err(|e| TaskFailure::new(format!("committing staged configuration: {e}")))?;

        let digest = sha256_hex(key_data.as_bytes());
        fs::write(paths.staged_digest(&volume), &digest)
            .await
            .map_err(|e| TaskFailure::new(format!("writing digest sidecar: {e}")))?;

        ctx.scratch.insert("recovery_digest".into(), json!(digest));
        Ok(())
    })
}

fn verify_staged(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let volume = scratch_volume(ctx)?;
        let paths = ctx.env.recovery.clone();

        let body = fs::read(paths.staged(&volume))
            .await
            .map_err(|e| TaskFailure::new(format!("reading staged configuration: {e}")))?;
        let recorded = fs::read_to_string(paths.staged_digest(&volume))
            .await
            .map_err(|e| TaskFailure::new(format!("reading digest sidecar: {e}")))?;

        let actual = sha256_hex(&body);
        if actual != recorded.trim() {
            return Err(TaskFailure::new(format!(
                "staged configuration for volume '{volume}' failed digest verification"
            )));
        }
        ctx.result = Some(json!({ "volume": volume, "state": "staged", "digest": actual }));
        Ok(())
    })
}

// ─── recovery_activate (custom control flow) ────────────────────────────────

/// Promote staged → active with the activation lock held across every step.
/// The lock is released whatever the outcome; a failed release after success
/// is an infrastructure error and does not change the verdict.
fn activate_flow(ctx: &mut TaskContext) -> BoxFuture<'_, Result<(), TaskFailure>> {
    Box::pin(async move {
        let volume = require_volume(&ctx.request.params)?;
        ctx.log_line(&format!("activating recovery configuration for volume {volume}"))
            .await;

        let lock = ProvisionGuard::acquire(
            &ctx.env.guard_dir,
            &format!("recovery-activate-{volume}"),
        )
        .await?;

        let outcome = run_activation(ctx, &volume).await;

        if let Err(e) = lock.release().await {
            warn!(volume = %volume, err = %e, "activation lock release failed");
            ctx.log_line(&format!("warning: {e}")).await;
        }
        outcome
    })
}

async fn run_activation(ctx: &mut TaskContext, volume: &str) -> Result<(), TaskFailure> {
    let paths = ctx.env.recovery.clone();

    let staged = paths.staged(volume);
    let present = fs::try_exists(&staged)
        .await
        .map_err(|e| TaskFailure::new(format!("checking staged configuration: {e}")))?;
    if !present {
        return Err(TaskFailure::new(format!(
            "no staged recovery configuration for volume '{volume}'"
        )));
    }
    ctx.progress(30);
    ctx.log_line("staged configuration present").await;

    fs::create_dir_all(paths.active_dir())
        .await
        .map_err(|e| TaskFailure::new(format!("creating active dir: {e}")))?;
    fs::rename(&staged, paths.active(volume))
        .await
        .map_err(|e| TaskFailure::new(format!("promoting configuration: {e}")))?;
    // The digest sidecar travels with the configuration.
    fs::rename(paths.staged_digest(volume), paths.active_digest(volume))
        .await
        .map_err(|e| TaskFailure::new(format!("promoting digest sidecar: {e}")))?;
    ctx.progress(75);
    ctx.log_line("configuration promoted to active").await;

    let body = fs::read(paths.active(volume))
        .await
        .map_err(|e| TaskFailure::new(format!("reading active configuration: {e}")))?;
    let recorded = fs::read_to_string(paths.active_digest(volume))
        .await
        .map_err(|e| TaskFailure::new(format!("reading active digest: {e}")))?;
    let actual = sha256_hex(&body);
    if actual != recorded.trim() {
        return Err(TaskFailure::new(format!(
            "active configuration for volume '{volume}' failed digest verification"
        )));
    }
    ctx.progress(100);
    ctx.result = Some(json!({ "volume": volume, "state": "active", "digest": actual }));
    Ok(())
}

// ─── helpers ────────────────────────────────────────────────────────────────

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn require_volume(params: &Value) -> Result<String, TaskFailure> {
    let volume = params
        .get("volume")
        .and_then(Value::as_str)
        .ok_or_else(|| TaskFailure::new("missing required parameter 'volume'"))?;
    if volume.is_empty()
        || !volume
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TaskFailure::new(
            "parameter 'volume' must contain only letters, digits, '-' and '_'",
        ));
    }
    Ok(volume.to_string())
}

fn scratch_volume(ctx: &TaskContext) -> Result<String, TaskFailure> {
    ctx.scratch
        .get("recovery_volume")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TaskFailure::new("missing pipeline value 'recovery_volume'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::context::test_support::bare_context_with_params;
    use crate::tasks::descriptor::TaskFlow;
    use crate::tasks::step::run_steps;

    fn steps_of(descriptor: TaskDescriptor) -> Vec<Step> {
        match descriptor.flow {
            TaskFlow::Steps(steps) => steps,
            TaskFlow::Custom(_) => panic!("expected a step pipeline"),
        }
    }

    async fn run_custom(descriptor: TaskDescriptor, ctx: &mut TaskContext) -> Result<(), TaskFailure> {
        match descriptor.flow {
            TaskFlow::Custom(body) => body(ctx).await,
            TaskFlow::Steps(_) => panic!("expected a custom flow"),
        }
    }

    #[tokio::test]
    async fn stage_writes_configuration_and_digest() {
        let params = json!({ "volume": "vol0", "key_data": "AAAA-BBBB-CCCC" });
        let (mut ctx, instance, _gate) = bare_context_with_params("recovery_stage", params);
        let steps = steps_of(recovery_stage(&ctx.request));

        run_steps(&steps, &mut ctx).await.unwrap();

        assert_eq!(instance.progress(), 100);
        let staged = std::fs::read_to_string(ctx.env.recovery.staged("vol0")).unwrap();
        assert_eq!(staged, "AAAA-BBBB-CCCC");

        let sidecar = std::fs::read_to_string(ctx.env.recovery.staged_digest("vol0")).unwrap();
        assert_eq!(sidecar, sha256_hex(b"AAAA-BBBB-CCCC"));

        let result = ctx.result.clone().unwrap();
        assert_eq!(result["volume"], "vol0");
        assert_eq!(result["state"], "staged");
        assert_eq!(result["digest"], json!(sidecar));
    }

    #[tokio::test]
    async fn stage_rejects_bad_parameters() {
        for params in [
            json!({}),
            json!({ "volume": "vol0" }),
            json!({ "volume": "vol0", "key_data": "" }),
            json!({ "volume": "../escape", "key_data": "k" }),
        ] {
            let (mut ctx, instance, _gate) = bare_context_with_params("recovery_stage", params);
            let steps = steps_of(recovery_stage(&ctx.request));
            run_steps(&steps, &mut ctx).await.unwrap_err();
            assert_eq!(instance.progress(), 0);
        }
    }

    #[tokio::test]
    async fn verify_catches_corruption() {
        let params = json!({ "volume": "vol0", "key_data": "SECRET" });
        let (mut ctx, _instance, _gate) = bare_context_with_params("recovery_stage", params);
        let steps = steps_of(recovery_stage(&ctx.request));
        run_steps(&steps, &mut ctx).await.unwrap();

        // Flip the staged bytes behind the pipeline's back.
        std::fs::write(ctx.env.recovery.staged("vol0"), "TAMPERED").unwrap();

        let err = steps[2].run(&mut ctx).await.unwrap_err();
        assert!(err.message.contains("digest verification"));
    }

    #[tokio::test]
    async fn activate_promotes_staged_to_active_and_releases_the_lock() {
        let params = json!({ "volume": "vol0", "key_data": "SECRET" });
        let (mut ctx, _instance, _gate) = bare_context_with_params("recovery_stage", params);
        run_steps(&steps_of(recovery_stage(&ctx.request)), &mut ctx)
            .await
            .unwrap();

        let (mut actx, ainstance, _agate) =
            bare_context_with_params("recovery_activate", json!({ "volume": "vol0" }));
        actx.env = ctx.env.clone();
        run_custom(recovery_activate(&actx.request), &mut actx)
            .await
            .unwrap();

        assert_eq!(ainstance.progress(), 100);
        assert!(actx.env.recovery.active("vol0").exists());
        assert!(!actx.env.recovery.staged("vol0").exists());
        assert_eq!(actx.result.clone().unwrap()["state"], "active");
        // The activation lock is gone.
        assert!(!actx
            .env
            .guard_dir
            .join("recovery-activate-vol0.guard")
            .exists());
    }

    #[tokio::test]
    async fn activate_without_staged_configuration_fails_but_frees_the_lock() {
        let (mut ctx, instance, _gate) =
            bare_context_with_params("recovery_activate", json!({ "volume": "vol9" }));
        let err = run_custom(recovery_activate(&ctx.request), &mut ctx)
            .await
            .unwrap_err();

        assert!(err.message.contains("no staged recovery configuration"));
        assert_eq!(instance.progress(), 0);
        // Released on the failure path too.
        assert!(!ctx
            .env
            .guard_dir
            .join("recovery-activate-vol9.guard")
            .exists());
    }

    #[tokio::test]
    async fn concurrent_activation_fails_fast_on_the_lock() {
        let (mut ctx, _instance, _gate) =
            bare_context_with_params("recovery_activate", json!({ "volume": "vol0" }));
        let held = ProvisionGuard::acquire(&ctx.env.guard_dir, "recovery-activate-vol0")
            .await
            .unwrap();

        let err = run_custom(recovery_activate(&ctx.request), &mut ctx)
            .await
            .unwrap_err();
        assert!(err.message.contains("already held"));
        drop(held);
    }
}
