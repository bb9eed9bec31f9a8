use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::decoder::Decoder;
use crate::dedup::DedupWindow;
use crate::kafka::{BrokerConsumer, InFlightTracker};
use crate::pipeline::PipelineWorker;
use crate::processor_pool::WorkerPool;
use crate::recent::RecentReadings;
use crate::retry::RetryPolicy;
use crate::sinks::{
    EventBusSink, ObjectStoreSink, PersistenceRouter, Sink, WarehouseSink,
};

/// Owns the whole ingestion pipeline: broker consumer, worker pool and the
/// downstream sinks. Constructing one connects to every dependency; a
/// dependency that cannot be reached at startup is a fatal error.
pub struct RelayService {
    consumer: BrokerConsumer,
    pool: WorkerPool,
    shutdown_tx: oneshot::Sender<()>,
    shutdown_timeout: Duration,
}

impl RelayService {
    /// `recent` is shared with the status server, which reads what the
    /// pipeline records.
    pub async fn new(config: Config, recent: Arc<RecentReadings>) -> Result<RelayService> {
        info!(
            device_registry = %config.device_registry,
            topic = %config.kafka.kafka_consumer_topic,
            "assembling telemetry relay"
        );

        let publisher: Arc<dyn Sink> = Arc::new(EventBusSink::new(
            &config.kafka.producer_client_config(),
            config.event_bus_topic.clone(),
            config.object_storage_prefix.clone(),
            config.kafka.send_timeout(),
        )?);

        let warehouse = WarehouseSink::new(
            &config.database_url,
            config.warehouse_table.clone(),
            config.warehouse_max_connections,
        )
        .await?;

        let blobs = ObjectStoreSink::new(
            config.object_storage_bucket.clone(),
            config.object_storage_region.clone(),
            config.object_storage_endpoint.clone(),
        )
        .await?;

        let router: Arc<dyn Sink> = Arc::new(PersistenceRouter::new(
            Arc::new(warehouse),
            Arc::new(blobs),
            config.object_storage_prefix.clone(),
        ));

        let retry = config.retry_policy();
        let workers: Vec<PipelineWorker> = (0..config.worker_count.max(1))
            .map(|_| {
                PipelineWorker::new(
                    Decoder::new(config.topic_prefix.clone()),
                    DedupWindow::new(config.dedup_config()),
                    Arc::clone(&publisher),
                    Arc::clone(&router),
                    Arc::clone(&recent),
                    retry.clone(),
                )
            })
            .collect();
        let (dispatch_tx, pool) = WorkerPool::spawn(workers, config.dedup_sweep_interval());

        let tracker = Arc::new(InFlightTracker::new(config.max_in_flight_messages));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = BrokerConsumer::from_config(
            &config.kafka.consumer_client_config(),
            &config.kafka.kafka_consumer_topic,
            tracker,
            dispatch_tx,
            config.commit_interval(),
            RetryPolicy::default(),
            shutdown_rx,
        )?;

        Ok(RelayService {
            consumer,
            pool,
            shutdown_tx,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Runs until the consumer fails or SIGTERM/ctrl-c arrives, then
    /// drains: no further intake, in-flight messages finish, safe offsets
    /// are committed, workers exit.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Same as [`run`](Self::run) with a caller-supplied shutdown trigger,
    /// which is what tests use.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = Result<()>>,
    ) -> Result<()> {
        let mut consumer_handle = tokio::spawn(self.consumer.start_consumption());

        tokio::select! {
            result = &mut consumer_handle => {
                // Consumer stopped on its own; the dispatch sender is gone,
                // so the pool drains below.
                result.context("consumer task panicked")??;
                warn!("consumer stopped without a shutdown signal");
            }
            signal = shutdown => {
                signal?;
                info!("shutdown requested, draining pipeline");
                // The consumer may already be gone; nothing to signal then.
                let _ = self.shutdown_tx.send(());
                match timeout(self.shutdown_timeout, consumer_handle).await {
                    Ok(result) => result.context("consumer task panicked")??,
                    Err(_) => {
                        warn!(
                            timeout_secs = self.shutdown_timeout.as_secs(),
                            "drain timed out, in-flight messages will be redelivered"
                        );
                        return Ok(());
                    }
                }
            }
        }

        timeout(self.shutdown_timeout, self.pool.join())
            .await
            .context("worker pool drain timed out")??;
        info!("telemetry relay stopped");
        Ok(())
    }
}

async fn shutdown_signal() -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("received ctrl-c");
        }
    }
    Ok(())
}
