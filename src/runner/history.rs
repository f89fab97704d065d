// SPDX-License-Identifier: MIT
//! Bounded in-memory record of completed tasks.
//!
//! Entries are appended in completion order and the oldest entry is evicted
//! once the ring is full. The record is in-memory only and does not survive
//! an agent restart. Writes come from the single runner supervisor per task;
//! reads take a point-in-time copy, so the REST surface never observes a
//! half-applied eviction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::tasks::instance::{TaskInstance, TaskState};

/// Large payloads are clipped before entering the record so one verbose task
/// cannot balloon the agent's memory.
const PAYLOAD_CLIP: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub task: String,
    pub state: TaskState,
    pub progress: u8,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn from_instance(instance: &TaskInstance) -> Self {
        let snap = instance.snapshot();
        Self {
            id: instance.id,
            task: instance.task.clone(),
            state: snap.state,
            progress: snap.progress,
            started_at: instance.started_at,
            finished_at: snap.finished_at,
            result: snap.result.as_ref().map(clip_value),
            error: snap.error.as_ref().map(|f| clip(&f.message)),
        }
    }
}

fn clip(s: &str) -> String {
    if s.len() <= PAYLOAD_CLIP {
        return s.to_string();
    }
    let mut end = PAYLOAD_CLIP;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} [truncated]", &s[..end])
}

fn clip_value(value: &Value) -> Value {
    let rendered = value.to_string();
    if rendered.len() <= PAYLOAD_CLIP {
        value.clone()
    } else {
        Value::String(clip(&rendered))
    }
}

#[derive(Debug)]
pub struct History {
    capacity: usize,
    entries: RwLock<VecDeque<HistoryEntry>>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Append one completed task, evicting the oldest entry when full.
    pub async fn record(&self, entry: HistoryEntry) {
        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Copy of the record, oldest first.
    pub async fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
