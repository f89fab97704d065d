pub mod config;
pub mod dispatch;
pub mod error;
pub mod facts;
pub mod guard;
pub mod machines;
pub mod protocol;
pub mod recovery;
pub mod runner;
pub mod server;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use config::AgentConfig;
use dispatch::Dispatcher;
use machines::store::{FsMachineStore, MachineStore};
use recovery::RecoveryPaths;
use runner::{History, Runner};
use tasks::context::TaskEnv;
use tasks::descriptor::TaskRegistry;

/// Shared agent state passed to every request handler.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub runner: Arc<Runner>,
    /// Same store the task pipelines write through; read here for the
    /// inventory endpoint.
    pub machines: Arc<dyn MachineStore>,
    pub started_at: std::time::Instant,
}

impl AgentContext {
    /// Wire the task runtime from configuration: built-in queues, shared
    /// dependencies, runner, dispatcher. Fails if two queues claim the same
    /// task name.
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let registry = TaskRegistry::new(vec![machines::queue(), recovery::queue()])?;

        let machine_store: Arc<dyn MachineStore> =
            Arc::new(FsMachineStore::new(config.machine_dir()));
        let env = TaskEnv {
            machines: machine_store.clone(),
            recovery: RecoveryPaths::new(config.recovery_dir()),
            guard_dir: config.guard_dir(),
        };
        let history = Arc::new(History::new(config.history_capacity));
        let runner = Arc::new(Runner::new(
            config.node_id.clone(),
            env,
            config.task_log_dir(),
            Duration::from_secs(config.task_timeout_secs),
            history,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.node_id.clone(),
            registry,
            runner.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            runner,
            machines: machine_store,
            started_at: std::time::Instant::now(),
        })
    }
}
