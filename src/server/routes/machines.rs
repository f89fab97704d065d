use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::AgentContext;

/// `GET /api/v1/machines` — the machine records this node currently hosts.
pub async fn machines(
    State(ctx): State<Arc<AgentContext>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.machines.list().await {
        Ok(records) => Ok(Json(json!({ "machines": records }))),
        Err(e) => {
            error!(err = %format!("{e:#}"), "machine store listing failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "machine store unavailable" })),
            ))
        }
    }
}
