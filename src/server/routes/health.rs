use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AgentContext;

pub async fn health(State(ctx): State<Arc<AgentContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node": ctx.dispatcher.node_id(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
        "inFlight": ctx.runner.in_flight_count().await,
        "tasks": ctx.dispatcher.task_names(),
    }))
}
