use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, TopicPartitionList};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;
use crate::kafka::connection::ConnectionHealth;
use crate::kafka::message::AckableMessage;
use crate::kafka::tracker::InFlightTracker;
use crate::metrics_const::{MESSAGES_RECEIVED, OFFSETS_COMMITTED};
use crate::retry::RetryPolicy;

/// The process's single broker connection.
///
/// Receives telemetry messages, wraps each as an [`AckableMessage`] tracked
/// by the [`InFlightTracker`], and hands it to the worker pool without
/// waiting for processing. Intake stalls (rather than buffering unboundedly)
/// once the in-flight bound is reached, which pushes backpressure onto the
/// broker.
pub struct BrokerConsumer {
    consumer: StreamConsumer,
    topic: String,
    tracker: Arc<InFlightTracker>,
    dispatcher: mpsc::UnboundedSender<AckableMessage>,
    commit_interval: Duration,
    health: ConnectionHealth,
    shutdown_rx: oneshot::Receiver<()>,
}

impl BrokerConsumer {
    pub fn from_config(
        client_config: &ClientConfig,
        topic: &str,
        tracker: Arc<InFlightTracker>,
        dispatcher: mpsc::UnboundedSender<AckableMessage>,
        commit_interval: Duration,
        reconnect: RetryPolicy,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = client_config
            .create()
            .map_err(ConnectionError)
            .context("failed to create broker consumer")?;
        consumer
            .subscribe(&[topic])
            .map_err(ConnectionError)
            .with_context(|| format!("failed to subscribe to telemetry topic '{topic}'"))?;

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            tracker,
            dispatcher,
            commit_interval,
            health: ConnectionHealth::new(reconnect),
            shutdown_rx,
        })
    }

    /// Block until the broker answers a metadata probe. Attempts are
    /// unbounded with a capped, jittered delay; every failed probe is
    /// logged, never silently swallowed.
    pub async fn wait_for_broker(&mut self) {
        loop {
            match self
                .consumer
                .client()
                .fetch_metadata(None, Timeout::After(Duration::from_secs(10)))
            {
                Ok(_) => {
                    self.health.record_success();
                    info!(topic = %self.topic, "connected to broker");
                    return;
                }
                Err(e) => {
                    let delay = self.health.record_failure();
                    warn!(
                        error = %ConnectionError(e),
                        attempt = self.health.consecutive_failures(),
                        delay_ms = delay.as_millis() as u64,
                        "broker unreachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Consume until shutdown, then drain: every accepted message reaches a
    /// terminal outcome before the final offset commit and disconnect.
    pub async fn start_consumption(mut self) -> Result<()> {
        self.wait_for_broker().await;
        info!(topic = %self.topic, "starting telemetry consumption");

        let mut commit_tick = tokio::time::interval(self.commit_interval);

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    info!("shutdown signal received, stopping intake");
                    break;
                }

                recv = timeout(Duration::from_secs(1), self.consumer.recv()) => {
                    match recv {
                        Ok(Ok(msg)) => {
                            if self.health.record_success() {
                                info!("broker connection recovered");
                            }
                            self.handle_message(msg.detach()).await?;
                        }
                        Ok(Err(e)) => {
                            let delay = self.health.record_failure();
                            if self.health.consecutive_failures() == 1 {
                                warn!(error = %ConnectionError(e), "broker connection lost");
                            } else {
                                debug!(
                                    error = %ConnectionError(e),
                                    consecutive_failures = self.health.consecutive_failures(),
                                    "broker still unavailable"
                                );
                            }
                            // Back off without going deaf to shutdown.
                            tokio::select! {
                                _ = &mut self.shutdown_rx => {
                                    info!("shutdown signal received during reconnect");
                                    break;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        Err(_) => {
                            // Poll timeout; nothing to read.
                        }
                    }
                }

                _ = commit_tick.tick() => {
                    if let Err(e) = self.commit_safe_offsets(CommitMode::Async) {
                        error!(error = %e, "failed to commit offsets");
                    }
                }
            }
        }

        info!("draining in-flight messages");
        self.tracker.wait_for_completion().await;
        self.commit_safe_offsets(CommitMode::Sync)
            .context("final offset commit failed")?;
        info!("telemetry consumption stopped cleanly");
        Ok(())
    }

    async fn handle_message(&self, msg: rdkafka::message::OwnedMessage) -> Result<()> {
        metrics::counter!(MESSAGES_RECEIVED).increment(1);
        debug!(
            topic = msg.topic(),
            partition = msg.partition(),
            offset = msg.offset(),
            "received telemetry message"
        );

        // Backpressure: waits here while the pipeline is saturated, which
        // stops further broker reads instead of queueing without bound.
        let permit = self.tracker.acquire_permit().await?;
        let ackable = self.tracker.track(msg, permit);

        self.dispatcher
            .send(ackable)
            .map_err(|_| anyhow::anyhow!("worker pool is gone, cannot dispatch"))?;
        Ok(())
    }

    fn commit_safe_offsets(&self, mode: CommitMode) -> Result<(), ConnectionError> {
        let safe = self.tracker.safe_commit_offsets();
        if safe.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for ((topic, partition), offset) in safe {
            debug!(topic, partition, offset, "committing safe offset");
            list.add_partition_offset(&topic, partition, rdkafka::Offset::Offset(offset + 1))?;
            metrics::counter!(OFFSETS_COMMITTED).increment(1);
        }
        self.consumer.commit(&list, mode)?;
        Ok(())
    }
}
