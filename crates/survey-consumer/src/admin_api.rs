//! Admin API for the survey consumer
//!
//! Health, readiness, counters, and the Prometheus scrape endpoint. Shares
//! nothing with the consumer loop beyond read-only counters.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use survey_core::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{ConsumerStats, StatsSnapshot};

/// Admin API state
#[derive(Clone)]
pub struct AdminState {
    pub stats: Arc<ConsumerStats>,
    pub storage: Arc<dyn HealthCheck>,
    /// Absent when no recorder is installed
    pub prometheus: Option<PrometheusHandle>,
}

/// Health response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn live() -> &'static str {
    "OK"
}

async fn ready(
    State(state): State<AdminState>,
) -> std::result::Result<&'static str, (StatusCode, String)> {
    match state.storage.health_check().await {
        Ok(()) => Ok("OK"),
        Err(e) => {
            warn!(component = state.storage.component_name(), error = %e, "Readiness check failed");
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

async fn stats(State(state): State<AdminState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn metrics(State(state): State<AdminState>) -> String {
    state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Build the admin router
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run admin server until `cancel` fires
pub async fn run_admin_server(
    listen: &str,
    state: AdminState,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| IndexerError::config(format!("failed to bind admin listener {}: {}", listen, e)))?;
    info!(listen, "Admin API started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| IndexerError::Internal(format!("admin server failed: {}", e)))
}
