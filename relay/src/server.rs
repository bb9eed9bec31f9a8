use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::recent::{RecentEntry, RecentReadings};

/// Operational HTTP surface: liveness probes, the Prometheus scrape
/// endpoint, and per-device recent readings for operator inspection. Runs
/// beside the pipeline and never writes telemetry data.
pub async fn serve_status(host: String, port: u16, recent: Arc<RecentReadings>) -> Result<()> {
    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let router = Router::new()
        .route("/", get(|| async { "telemetry-relay" }))
        .route("/_liveness", get(|| async { "ok" }))
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .route("/devices/:device_id/recent", get(recent_readings))
        .with_state(recent);

    let address = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind status server to {address}"))?;
    info!(address, "status server listening");

    axum::serve(listener, router)
        .await
        .context("status server failed")
}

async fn recent_readings(
    Path(device_id): Path<String>,
    State(recent): State<Arc<RecentReadings>>,
) -> Json<Vec<RecentEntry>> {
    Json(recent.snapshot(&device_id))
}
