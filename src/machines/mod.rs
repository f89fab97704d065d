// SPDX-License-Identifier: MIT
//! Built-in machine provisioning tasks.
//!
//! `machine_create` and `machine_destroy` are the reference step pipelines
//! shipped with the agent: parameter validation up front, collision/presence
//! checks against the machine store, a provisioning guard around the write
//! path, and a final read-back so the response carries what was actually
//! persisted rather than what was requested.

pub mod store;

use serde_json::{json, Value};
use tracing::warn;

use crate::error::TaskFailure;
use crate::guard::ProvisionGuard;
use crate::protocol::TaskRequest;
use crate::tasks::context::TaskContext;
use crate::tasks::descriptor::{QueueDefinition, TaskDescriptor, TaskSpec};
use crate::tasks::step::{Step, StepFuture};
use store::MachineRecord;

pub fn queue() -> QueueDefinition {
    QueueDefinition {
        name: "machines",
        tasks: vec![
            TaskSpec {
                name: "machine_create",
                build: machine_create,
            },
            TaskSpec {
                name: "machine_destroy",
                build: machine_destroy,
            },
        ],
        timeout: None,
        log_params: true,
    }
}

fn machine_create(_request: &TaskRequest) -> TaskDescriptor {
    TaskDescriptor::steps(vec![
        Step::new("validate", 10, "validate machine parameters", validate_create),
        Step::new("collision_check", 25, "ensure the machine id is unused", collision_check),
        Step::new("acquire_guard", 40, "take the provisioning guard", acquire_guard),
        Step::new("define", 60, "assemble the machine definition", define),
        Step::new("register", 85, "persist the definition", register),
        Step::new("load_record", 100, "read back the stored record", load_record),
    ])
}

fn machine_destroy(_request: &TaskRequest) -> TaskDescriptor {
    TaskDescriptor::steps(vec![
        Step::new("validate", 15, "validate machine parameters", validate_destroy),
        Step::new("presence_check", 35, "ensure the machine is defined here", presence_check),
        Step::new("deregister", 80, "remove the definition", deregister),
        Step::new("confirm", 100, "verify the definition is gone", confirm),
    ])
}

// ─── machine_create steps ───────────────────────────────────────────────────

fn validate_create(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = require_machine_id(&ctx.request.params)?;
        let name = match ctx.request.params.get("name") {
            None | Some(Value::Null) => format!("machine-{uuid}"),
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(_) => {
                return Err(TaskFailure::new(
                    "parameter 'name' must be a non-empty string",
                ))
            }
        };
        let memory_mb = optional_positive(&ctx.request.params, "memory_mb", 1024)?;
        let vcpus = optional_positive(&ctx.request.params, "vcpus", 1)?;

        ctx.scratch.insert("machine_uuid".into(), json!(uuid));
        ctx.scratch.insert("machine_name".into(), json!(name));
        ctx.scratch.insert("machine_memory_mb".into(), json!(memory_mb));
        ctx.scratch.insert("machine_vcpus".into(), json!(vcpus));
        Ok(())
    })
}

fn collision_check(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = scratch_str(ctx, "machine_uuid")?;
        if ctx
            .env
            .machines
            .exists(&uuid)
            .await
            .map_err(TaskFailure::from)?
        {
            return Err(TaskFailure::new(format!("machine {uuid} already exists"))
                .with_detail(json!({ "uuid": uuid })));
        }
        Ok(())
    })
}

fn acquire_guard(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = scratch_str(ctx, "machine_uuid")?;
        let guard = ProvisionGuard::acquire(&ctx.env.guard_dir, &uuid).await?;
        ctx.guard = Some(guard);
        Ok(())
    })
}

fn define(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = scratch_str(ctx, "machine_uuid")?;
        let name = scratch_str(ctx, "machine_name")?;
        let memory_mb = scratch_u64(ctx, "machine_memory_mb")?;
        let vcpus = scratch_u64(ctx, "machine_vcpus")?;

        // Size against the host snapshot taken at accept time.
        let host_memory = ctx.request.facts.memory_mb;
        if host_memory > 0 && memory_mb > host_memory {
            return Err(TaskFailure::new(format!(
                "requested memory {memory_mb} MB exceeds host capacity {host_memory} MB"
            )));
        }

        let record = MachineRecord {
            uuid,
            name,
            memory_mb,
            vcpus: vcpus as u32,
            host: ctx.node_id.clone(),
            created_at: chrono::Utc::now(),
        };
        let value = serde_json::to_value(&record).map_err(TaskFailure::from)?;
        ctx.scratch.insert("machine_record".into(), value);
        Ok(())
    })
}

fn register(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let value = ctx
            .scratch
            .get("machine_record")
            .cloned()
            .ok_or_else(|| TaskFailure::new("missing pipeline value 'machine_record'"))?;
        let record: MachineRecord = serde_json::from_value(value).map_err(TaskFailure::from)?;
        ctx.env
            .machines
            .create(&record)
            .await
            .map_err(TaskFailure::from)?;
        Ok(())
    })
}

fn load_record(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = scratch_str(ctx, "machine_uuid")?;
        let record = ctx
            .env
            .machines
            .load(&uuid)
            .await
            .map_err(TaskFailure::from)?
            .ok_or_else(|| {
                TaskFailure::new(format!("record for machine {uuid} missing after registration"))
            })?;
        ctx.result = Some(serde_json::to_value(&record).map_err(TaskFailure::from)?);

        // Provisioning is done; free the guard. A failed removal is an
        // infrastructure problem, never a task failure.
        if let Some(guard) = ctx.guard.take() {
            if let Err(e) = guard.release().await {
                warn!(uuid = %uuid, err = %e, "guard release failed after successful provisioning");
                ctx.log_line(&format!("warning: {e}")).await;
            }
        }
        Ok(())
    })
}

// ─── machine_destroy steps ──────────────────────────────────────────────────

fn validate_destroy(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = require_machine_id(&ctx.request.params)?;
        ctx.scratch.insert("machine_uuid".into(), json!(uuid));
        Ok(())
    })
}

fn presence_check(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = scratch_str(ctx, "machine_uuid")?;
        if !ctx
            .env
            .machines
            .exists(&uuid)
            .await
            .map_err(TaskFailure::from)?
        {
            return Err(
                TaskFailure::new(format!("machine {uuid} is not defined on this node"))
                    .with_detail(json!({ "uuid": uuid })),
            );
        }
        Ok(())
    })
}

fn deregister(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = scratch_str(ctx, "machine_uuid")?;
        let removed = ctx
            .env
            .machines
            .remove(&uuid)
            .await
            .map_err(TaskFailure::from)?;
        if !removed {
            return Err(TaskFailure::new(format!(
                "machine {uuid} disappeared before deregistration"
            )));
        }
        Ok(())
    })
}

fn confirm(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        let uuid = scratch_str(ctx, "machine_uuid")?;
        if ctx
            .env
            .machines
            .exists(&uuid)
            .await
            .map_err(TaskFailure::from)?
        {
            return Err(TaskFailure::new(format!(
                "machine {uuid} still present after deregistration"
            )));
        }
        ctx.result = Some(json!({ "uuid": uuid, "destroyed": true }));
        Ok(())
    })
}

// ─── parameter helpers ──────────────────────────────────────────────────────

fn require_machine_id(params: &Value) -> Result<String, TaskFailure> {
    let uuid = params
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| TaskFailure::new("missing required parameter 'uuid'"))?;
    if uuid.is_empty() || !uuid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(TaskFailure::new(
            "parameter 'uuid' must contain only letters, digits, and '-'",
        ));
    }
    Ok(uuid.to_string())
}

fn optional_positive(params: &Value, key: &str, default: u64) -> Result<u64, TaskFailure> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => Ok(n),
            _ => Err(TaskFailure::new(format!(
                "parameter '{key}' must be a positive integer"
            ))),
        },
    }
}

fn scratch_str(ctx: &TaskContext, key: &str) -> Result<String, TaskFailure> {
    ctx.scratch
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TaskFailure::new(format!("missing pipeline value '{key}'")))
}

fn scratch_u64(ctx: &TaskContext, key: &str) -> Result<u64, TaskFailure> {
    ctx.scratch
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| TaskFailure::new(format!("missing pipeline value '{key}'")))
}
