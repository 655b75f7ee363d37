//! Operational HTTP endpoints: `/health` and `/metrics`

use crate::RewardsEngine;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::future::Future;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: String,
}

async fn health_check(State(engine): State<RewardsEngine>) -> Json<HealthResponse> {
    let config = engine.config();
    Json(HealthResponse {
        status: "healthy",
        service: config.service_name.clone(),
        version: config.service_version.clone(),
    })
}

// Prometheus metrics endpoint
async fn metrics_handler(State(engine): State<RewardsEngine>) -> Result<String, (StatusCode, String)> {
    engine.metrics().export().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to export metrics: {}", e),
        )
    })
}

/// Router exposing the engine's health and metrics
pub fn router(engine: RewardsEngine) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(engine)
}

/// Serve [`router`] on `listener` until `shutdown` resolves
pub async fn serve(
    engine: RewardsEngine,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr()?, "Serving /health and /metrics");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
