use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AgentContext;

/// `GET /api/v1/history` — settled tasks, oldest first, capacity-bounded.
pub async fn history(State(ctx): State<Arc<AgentContext>>) -> Json<Value> {
    let entries = ctx.runner.history().snapshot().await;
    Json(json!({ "history": entries }))
}
