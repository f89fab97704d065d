pub mod context;
pub mod descriptor;
pub mod instance;
pub mod step;

pub use context::{TaskContext, TaskEnv};
pub use descriptor::{QueueDefinition, TaskDescriptor, TaskFlow, TaskRegistry, TaskSpec};
pub use instance::{InstanceSnapshot, TaskInstance, TaskState};
pub use step::{run_steps, Step};
