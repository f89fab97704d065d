// server/routes/tasks.rs — the dispatch endpoint.

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::dispatch::gate::TaskVerdict;
use crate::error::{AgentError, RoutingError};
use crate::protocol::DispatchEnvelope;
use crate::AgentContext;

/// `POST /api/v1/tasks` — run one task to its verdict.
///
/// A task that ran and failed (including a forced timeout) is still a
/// successful dispatch: 200 with `status: "failed"`. Error statuses are
/// reserved for envelopes that never reached a task body.
pub async fn dispatch_task(
    State(ctx): State<Arc<AgentContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(envelope): Json<DispatchEnvelope>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx
        .dispatcher
        .dispatch(envelope, Some(addr.to_string()))
        .await
    {
        Ok(outcome) => match outcome.verdict {
            TaskVerdict::Success(result) => Ok(Json(json!({
                "status": "success",
                "id": outcome.id,
                "task": outcome.task,
                "result": result,
            }))),
            TaskVerdict::Failure(failure) => Ok(Json(json!({
                "status": "failed",
                "id": outcome.id,
                "task": outcome.task,
                "error": failure.to_value(),
            }))),
        },
        Err(e) => Err(reject(e)),
    }
}

fn reject(e: AgentError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        AgentError::Validation(_) => StatusCode::BAD_REQUEST,
        AgentError::Routing(RoutingError::UnknownTask(_)) => StatusCode::NOT_FOUND,
        AgentError::Routing(RoutingError::WrongNode { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        AgentError::Execution(_) | AgentError::Timeout { .. } | AgentError::Infrastructure(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() })))
}
