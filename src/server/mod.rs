// SPDX-License-Identifier: MIT
// server/mod.rs — HTTP surface of the agent.
//
// Axum server bridging the controller's HTTP calls to the dispatcher.
//
// Endpoints:
//   POST /api/v1/tasks      (dispatch one task, respond with its verdict)
//   GET  /api/v1/history    (bounded record of settled tasks)
//   GET  /api/v1/machines   (machine records hosted on this node)
//   GET  /api/v1/health

pub mod routes;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::AgentContext;

pub async fn run(ctx: Arc<AgentContext>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.bind_address, ctx.config.port).parse()?;
    let router = build_router(ctx);

    info!("station agent listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(make_shutdown_future())
    .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AgentContext>) -> Router {
    Router::new()
        .route("/api/v1/tasks", post(routes::tasks::dispatch_task))
        .route("/api/v1/history", get(routes::history::history))
        .route("/api/v1/machines", get(routes::machines::machines))
        .route("/api/v1/health", get(routes::health::health))
        .with_state(ctx)
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    info!("shutdown signal received — stopping server");
}
