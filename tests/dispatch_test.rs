//! Integration tests for the dispatch pipeline and the built-in task catalog.
//! Builds a full agent context on a temp data dir and drives envelopes through
//! the dispatcher exactly as the HTTP layer would.

use serde_json::{json, Value};
use stationd::config::AgentConfig;
use stationd::dispatch::gate::TaskVerdict;
use stationd::dispatch::{DispatchOutcome, Dispatcher};
use stationd::error::{AgentError, RoutingError};
use stationd::machines::store::FsMachineStore;
use stationd::protocol::{DispatchEnvelope, TaskRequest};
use stationd::recovery::RecoveryPaths;
use stationd::runner::{History, HistoryEntry, Runner};
use stationd::tasks::step::StepFuture;
use stationd::tasks::{
    QueueDefinition, Step, TaskContext, TaskDescriptor, TaskEnv, TaskRegistry, TaskSpec, TaskState,
};
use stationd::AgentContext;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn test_context() -> (Arc<AgentContext>, PathBuf) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let config = AgentConfig::new(
        None,
        Some(data_dir.clone()),
        Some("error".to_string()),
        Some("station-test".to_string()),
        None,
    );
    let ctx = Arc::new(AgentContext::new(config).unwrap());
    (ctx, data_dir)
}

fn envelope(task: &str, params: Value) -> DispatchEnvelope {
    DispatchEnvelope {
        node: Some("station-test".to_string()),
        task: Some(task.to_string()),
        params: Some(params),
    }
}

/// Wait until every accepted task has been settled into history.
async fn settled_history(ctx: &AgentContext, expect: usize) -> Vec<HistoryEntry> {
    for _ in 0..200 {
        let entries = ctx.runner.history().snapshot().await;
        if entries.len() >= expect && ctx.runner.in_flight_count().await == 0 {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tasks did not settle into history in time");
}

#[tokio::test]
async fn test_machine_lifecycle_end_to_end() {
    let (ctx, data_dir) = test_context();

    let outcome = ctx
        .dispatcher
        .dispatch(
            envelope(
                "machine_create",
                json!({ "uuid": "vm-100", "name": "edge-1", "memory_mb": 2048, "vcpus": 2 }),
            ),
            None,
        )
        .await
        .unwrap();

    assert!(outcome.verdict.is_success());
    let result = match outcome.verdict {
        TaskVerdict::Success(v) => v,
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(result["uuid"], "vm-100");
    assert_eq!(result["name"], "edge-1");
    assert_eq!(result["memoryMb"], 2048);
    assert_eq!(result["host"], "station-test");

    // Record persisted, provisioning guard released.
    assert!(data_dir.join("machines").join("vm-100.json").exists());
    assert!(!data_dir.join("guards").join("vm-100.guard").exists());

    let outcome = ctx
        .dispatcher
        .dispatch(envelope("machine_destroy", json!({ "uuid": "vm-100" })), None)
        .await
        .unwrap();
    assert!(outcome.verdict.is_success());
    assert!(!data_dir.join("machines").join("vm-100.json").exists());

    let entries = settled_history(&ctx, 2).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].task, "machine_create");
    assert_eq!(entries[1].task, "machine_destroy");
    assert!(entries.iter().all(|e| e.state == TaskState::Complete));
    assert!(entries.iter().all(|e| e.progress == 100));
}

#[tokio::test]
async fn test_create_collision_reports_failure_verdict() {
    let (ctx, _data_dir) = test_context();
    let params = json!({ "uuid": "vm-dup" });

    let first = ctx
        .dispatcher
        .dispatch(envelope("machine_create", params.clone()), None)
        .await
        .unwrap();
    assert!(first.verdict.is_success());

    let second = ctx
        .dispatcher
        .dispatch(envelope("machine_create", params), None)
        .await
        .unwrap();
    match second.verdict {
        TaskVerdict::Failure(f) => {
            assert!(f.message.contains("already exists"), "got: {}", f.message);
        }
        other => panic!("expected failure verdict, got {other:?}"),
    }

    let entries = settled_history(&ctx, 2).await;
    let failed = &entries[1];
    assert_eq!(failed.state, TaskState::Failed);
    // Aborted in the collision check, so only the validate checkpoint landed.
    assert_eq!(failed.progress, 10);
    assert!(failed.error.as_deref().unwrap().contains("already exists"));
}

#[tokio::test]
async fn test_concurrent_creates_for_one_uuid_admit_exactly_one() {
    let (ctx, data_dir) = test_context();
    let params = json!({ "uuid": "vm-dup" });

    let (first, second) = tokio::join!(
        ctx.dispatcher
            .dispatch(envelope("machine_create", params.clone()), None),
        ctx.dispatcher
            .dispatch(envelope("machine_create", params), None),
    );
    let verdicts = [first.unwrap().verdict, second.unwrap().verdict];

    let winners = verdicts.iter().filter(|v| v.is_success()).count();
    assert_eq!(winners, 1, "exactly one create may win: {verdicts:?}");
    // Depending on interleaving the loser trips the collision check, the
    // guard, or the store's own overwrite refusal.
    match verdicts.iter().find(|v| !v.is_success()).unwrap() {
        TaskVerdict::Failure(f) => assert!(
            f.message.contains("already exists") || f.message.contains("already held"),
            "got: {}",
            f.message
        ),
        other => panic!("expected failure verdict, got {other:?}"),
    }

    let entries = settled_history(&ctx, 2).await;
    let complete = entries.iter().filter(|e| e.state == TaskState::Complete);
    let failed = entries.iter().filter(|e| e.state == TaskState::Failed);
    assert_eq!(complete.count(), 1);
    assert_eq!(failed.count(), 1);

    // One record on disk, and nobody left a guard behind.
    assert!(data_dir.join("machines").join("vm-dup.json").exists());
    assert!(!data_dir.join("guards").join("vm-dup.guard").exists());
}

#[tokio::test]
async fn test_rejected_envelopes_leave_no_trace() {
    let (ctx, data_dir) = test_context();

    // Addressed to a different node: rejected before anything else is checked.
    let err = ctx
        .dispatcher
        .dispatch(
            DispatchEnvelope {
                node: Some("some-other-node".to_string()),
                task: Some("machine_create".to_string()),
                params: Some(json!({ "uuid": "vm-9" })),
            },
            None,
        )
        .await
        .unwrap_err();
    match err {
        AgentError::Routing(RoutingError::WrongNode { expected, received }) => {
            assert_eq!(expected, "station-test");
            assert_eq!(received, "some-other-node");
        }
        other => panic!("expected wrong-node routing error, got {other}"),
    }

    // Incomplete envelope.
    let err = ctx
        .dispatcher
        .dispatch(
            DispatchEnvelope {
                node: None,
                task: Some("machine_create".to_string()),
                params: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Validation(_)));

    // Unknown task name.
    let err = ctx
        .dispatcher
        .dispatch(envelope("flying_toaster", json!({})), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AgentError::Routing(RoutingError::UnknownTask(_))
    ));

    // None of the rejects created an instance, history entry, or side effects.
    assert_eq!(ctx.runner.in_flight_count().await, 0);
    assert!(ctx.runner.history().snapshot().await.is_empty());
    assert!(!data_dir.join("machines").join("vm-9.json").exists());
    assert!(!ctx.config.task_log_dir().exists());
}

#[tokio::test]
async fn test_recovery_stage_then_activate() {
    let (ctx, data_dir) = test_context();
    let paths = RecoveryPaths::new(data_dir.join("recovery"));

    let outcome = ctx
        .dispatcher
        .dispatch(
            envelope(
                "recovery_stage",
                json!({ "volume": "crypt-a", "key_data": "RECOVERY-KEY-ALPHA" }),
            ),
            None,
        )
        .await
        .unwrap();
    assert!(outcome.verdict.is_success());
    assert!(paths.staged("crypt-a").exists());
    assert!(paths.staged_digest("crypt-a").exists());

    let outcome = ctx
        .dispatcher
        .dispatch(envelope("recovery_activate", json!({ "volume": "crypt-a" })), None)
        .await
        .unwrap();
    let result = match outcome.verdict {
        TaskVerdict::Success(v) => v,
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(result["state"], "active");
    assert!(paths.active("crypt-a").exists());
    assert!(!paths.staged("crypt-a").exists());

    let entries = settled_history(&ctx, 2).await;
    assert!(entries.iter().all(|e| e.state == TaskState::Complete));
}

#[tokio::test]
async fn test_recovery_params_never_reach_the_task_log() {
    let (ctx, _data_dir) = test_context();

    let outcome = ctx
        .dispatcher
        .dispatch(
            envelope(
                "recovery_stage",
                json!({ "volume": "crypt-b", "key_data": "SECRET-KEY-MATERIAL" }),
            ),
            Some("10.0.0.7:52110".to_string()),
        )
        .await
        .unwrap();
    assert!(outcome.verdict.is_success());

    let log_path = ctx
        .config
        .task_log_dir()
        .join(format!("recovery_stage-{}.log", outcome.id));
    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("[redacted]"), "accept line not redacted:\n{content}");
    assert!(content.contains("10.0.0.7:52110"));
    assert!(
        !content.contains("SECRET-KEY-MATERIAL"),
        "key material leaked into the task log"
    );
}

// ── Queue-level time budgets ──────────────────────────────────────────────────

fn hang(_ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        std::future::pending::<()>().await;
        Ok(())
    })
}

fn hang_descriptor(_request: &TaskRequest) -> TaskDescriptor {
    TaskDescriptor::steps(vec![Step::new("hang", 50, "stall forever", hang)])
}

/// A dispatcher whose single queue carries a 100ms budget override.
fn impatient_dispatcher(data_dir: &std::path::Path) -> (Dispatcher, Arc<Runner>) {
    let registry = TaskRegistry::new(vec![QueueDefinition {
        name: "lab",
        tasks: vec![TaskSpec {
            name: "hang",
            build: hang_descriptor,
        }],
        timeout: Some(Duration::from_millis(100)),
        log_params: true,
    }])
    .unwrap();

    let env = TaskEnv {
        machines: Arc::new(FsMachineStore::new(data_dir.join("machines"))),
        recovery: RecoveryPaths::new(data_dir.join("recovery")),
        guard_dir: data_dir.join("guards"),
    };
    let runner = Arc::new(Runner::new(
        "station-test".to_string(),
        env,
        data_dir.join("task-logs"),
        Duration::from_secs(300),
        Arc::new(History::new(16)),
    ));
    (
        Dispatcher::new("station-test".to_string(), registry, runner.clone()),
        runner,
    )
}

#[tokio::test]
async fn test_queue_budget_overrun_yields_failure_verdict() {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let (dispatcher, runner) = impatient_dispatcher(&data_dir);

    // The gate resolves (forced failure), so this is a verdict, not an error.
    let outcome: DispatchOutcome = dispatcher
        .dispatch(envelope("hang", json!({})), None)
        .await
        .unwrap();
    match outcome.verdict {
        TaskVerdict::Failure(f) => {
            assert!(f.message.contains("did not complete"), "got: {}", f.message);
        }
        other => panic!("expected forced-failure verdict, got {other:?}"),
    }

    // Supervisor settles the books shortly after the gate resolves.
    for _ in 0..100 {
        if runner.in_flight_count().await == 0 && runner.history().len().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let entries = runner.history().snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, TaskState::Failed);
    assert_eq!(entries[0].progress, 0);
}
