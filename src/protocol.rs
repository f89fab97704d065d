//! Wire types for the dispatch channel.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::facts::HostFacts;

/// Loosely-typed body of `POST /api/v1/tasks`.
///
/// Every field is optional so the dispatcher can reject malformed envelopes
/// with field-precise errors instead of a generic deserialization failure.
/// Field names are part of the controller contract — do not rename.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchEnvelope {
    /// Target node identity the controller addressed. When present it must
    /// match this agent's configured node id.
    #[serde(default)]
    pub node: Option<String>,
    /// Task name to execute.
    #[serde(default)]
    pub task: Option<String>,
    /// Opaque domain parameters handed to the task body unmodified.
    #[serde(default)]
    pub params: Option<Value>,
}

/// Fully validated, immutable request handed to the Runner.
///
/// Constructed once per accepted envelope; the facts snapshot is taken at
/// acceptance time and never refreshed.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub id: Uuid,
    pub task: String,
    pub params: Value,
    pub facts: HostFacts,
    /// Node identity the requester addressed, if it declared one.
    pub target_node: Option<String>,
    /// Requester address, when the transport knows it.
    pub origin: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            params,
            facts: crate::facts::collect(),
            target_node: None,
            origin: None,
            received_at: Utc::now(),
        }
    }
}
