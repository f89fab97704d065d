// SPDX-License-Identifier: MIT
//! Dual-acknowledgment completion gate.
//!
//! A response may be formatted only after two independent acknowledgments:
//! one from the domain lifecycle (`finish()`/`fatal()`) and one from the
//! legacy event channel (`event("finish")`/`event("error")`). The gate keeps
//! the two as named flags — never a counter — so a misbehaving body that
//! drives the same side twice cannot sneak a response out early, and a body
//! that drives only one side leaves the gate pending until the exchange is
//! severed upstream.

use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::error::TaskFailure;

/// Terminal verdict of one dispatch, assembled from the recorded payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskVerdict {
    Success(Value),
    Failure(TaskFailure),
}

impl TaskVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskVerdict::Success(_))
    }
}

#[derive(Debug, Default)]
struct GateState {
    domain_finish: bool,
    event_finish: bool,
    result: Option<Value>,
    error: Option<TaskFailure>,
}

impl GateState {
    fn is_complete(&self) -> bool {
        self.domain_finish && self.event_finish
    }

    fn verdict(&self) -> TaskVerdict {
        match &self.error {
            Some(failure) => TaskVerdict::Failure(failure.clone()),
            None => TaskVerdict::Success(self.result.clone().unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Default)]
pub struct CompletionGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domain-side acknowledgment, driven by `finish()`/`fatal()`.
    pub fn ack_domain(&self) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.domain_finish = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Event-side acknowledgment, driven by `event("finish")`/`event("error")`.
    pub fn ack_event(&self) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.event_finish = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Record the success payload. First write wins; duplicates are ignored.
    pub fn record_result(&self, value: Value) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        if state.result.is_none() {
            state.result = Some(value);
        }
    }

    /// Record the failure payload. First write wins, so a late forced-timeout
    /// error cannot mask a real step failure.
    pub fn record_error(&self, failure: TaskFailure) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        if state.error.is_none() {
            state.error = Some(failure);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().expect("gate lock poisoned").is_complete()
    }

    /// Resolve once both acknowledgments have landed.
    ///
    /// An error recorded before the second acknowledgment makes the verdict a
    /// failure regardless of any result payload.
    pub async fn wait(&self) -> TaskVerdict {
        loop {
            // Register interest before checking, so an acknowledgment landing
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            {
                let state = self.state.lock().expect("gate lock poisoned");
                if state.is_complete() {
                    return state.verdict();
                }
            }
            notified.await;
        }
    }
}
