// SPDX-License-Identifier: MIT
//! Error taxonomy for the dispatch path.
//!
//! Rejections (`Validation`, `Routing`) happen before any task state exists.
//! `Execution` failures ride inside the response body with a `failed` status.
//! `Infrastructure` failures are logged and never change a task's outcome.

use serde_json::{json, Value};
use thiserror::Error;

/// Diagnostic payload recorded when a task fails.
///
/// `message` is the operator-facing summary. `detail` and `extra` carry
/// structured diagnostics attached by the failing step; both are optional
/// and both ride the wire unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub message: String,
    pub detail: Option<Value>,
    pub extra: Option<Value>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            extra: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Wire shape of the failure payload in responses and history entries.
    pub fn to_value(&self) -> Value {
        let mut obj = json!({ "message": self.message });
        if let Some(d) = &self.detail {
            obj["detail"] = d.clone();
        }
        if let Some(x) = &self.extra {
            obj["extra"] = x.clone();
        }
        obj
    }

    /// Rebuild a failure from an `event("error", …)` payload.
    ///
    /// Accepts either the shape produced by [`to_value`](Self::to_value) or a
    /// bare string; anything else becomes the payload's JSON rendering.
    pub fn from_event_payload(payload: &Value) -> Self {
        if let Some(msg) = payload.get("message").and_then(Value::as_str) {
            Self {
                message: msg.to_string(),
                detail: payload.get("detail").cloned(),
                extra: payload.get("extra").cloned(),
            }
        } else if let Some(msg) = payload.as_str() {
            Self::new(msg)
        } else {
            Self::new(payload.to_string())
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(e: anyhow::Error) -> Self {
        // "{:#}" renders the whole context chain on one line.
        Self::new(format!("{e:#}"))
    }
}

impl From<std::io::Error> for TaskFailure {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<serde_json::Error> for TaskFailure {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Routing-class rejections, raised before any task state is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("request addressed to node '{received}' but this agent is '{expected}'")]
    WrongNode { expected: String, received: String },
    #[error("unknown task '{0}'")]
    UnknownTask(String),
}

/// Everything that can go wrong between envelope receipt and response.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed envelope — rejected before any handler lookup.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Request could not be routed to a handler.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// A step failed and the pipeline aborted.
    #[error("task failed: {0}")]
    Execution(TaskFailure),

    /// The exchange outlived the task's budget plus the grace period.
    #[error("task did not complete within {budget_secs}s")]
    Timeout { budget_secs: u64 },

    /// Ancillary failure that never changes a task's outcome.
    #[error("infrastructure: {0}")]
    Infrastructure(String),
}
