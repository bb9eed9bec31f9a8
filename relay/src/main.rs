use anyhow::{Context, Result};
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use std::sync::Arc;

use telemetry_relay::config::Config;
use telemetry_relay::recent::RecentReadings;
use telemetry_relay::server;
use telemetry_relay::service::RelayService;

fn setup_tracing() {
    let log_layer: tracing_subscriber::fmt::Layer<tracing_subscriber::Registry> =
        tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(log_layer.with_filter(EnvFilter::from_default_env()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config =
        Config::init_from_env().context("invalid configuration, refusing to start")?;
    info!(
        device_registry = %config.device_registry,
        topic = %config.kafka.kafka_consumer_topic,
        event_bus_topic = %config.event_bus_topic,
        "starting telemetry relay"
    );

    let recent = Arc::new(RecentReadings::new(
        config.recent_readings_per_device,
        config.object_storage_prefix.clone(),
    ));
    let status_server = tokio::spawn(server::serve_status(
        config.host.clone(),
        config.port,
        Arc::clone(&recent),
    ));

    let service = RelayService::new(config, recent).await?;
    let outcome = service.run().await;

    status_server.abort();
    outcome
}
