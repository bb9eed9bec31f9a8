use std::hash::{Hash, Hasher};
use std::time::Duration;

use anyhow::{Context, Result};
use siphasher::sip::SipHasher13;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::kafka::AckableMessage;
use crate::pipeline::PipelineWorker;

/// Fans messages out to a fixed set of pipeline workers, keyed by device.
///
/// All messages from one device land on the same worker, so per-device
/// ordering holds end to end and each worker's dedup window sees every
/// message for the devices it owns. Worker channels are unbounded; total
/// in-flight work is already bounded by the intake permits, the channels
/// only stage it.
pub struct WorkerPool {
    router: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the workers and the routing task. The returned sender is the
    /// consumer's dispatch handle; dropping it begins pool shutdown.
    pub fn spawn(
        workers: Vec<PipelineWorker>,
        sweep_interval: Duration,
    ) -> (mpsc::UnboundedSender<AckableMessage>, WorkerPool) {
        let worker_count = workers.len();
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for (index, worker) in workers.into_iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(index, worker, rx, sweep_interval)));
        }

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(route_messages(dispatch_rx, senders));
        info!(worker_count, "worker pool started");

        (
            dispatch_tx,
            WorkerPool {
                router,
                workers: handles,
            },
        )
    }

    /// Waits for the routing task and every worker to finish. Call after
    /// dropping the dispatch sender; workers drain their queues first, so
    /// every staged message still reaches a terminal outcome.
    pub async fn join(self) -> Result<()> {
        self.router.await.context("pool router task panicked")?;
        for (index, handle) in self.workers.into_iter().enumerate() {
            handle
                .await
                .with_context(|| format!("pipeline worker {index} panicked"))?;
        }
        info!("worker pool drained");
        Ok(())
    }
}

async fn route_messages(
    mut dispatch_rx: mpsc::UnboundedReceiver<AckableMessage>,
    senders: Vec<mpsc::UnboundedSender<AckableMessage>>,
) {
    while let Some(message) = dispatch_rx.recv().await {
        let index = worker_for(message.key(), senders.len());
        // A closed worker channel means the worker panicked; dropping the
        // message here auto-nacks it, so the offset is never committed past.
        if senders[index].send(message).is_err() {
            debug!(worker = index, "worker channel closed, message auto-nacked");
        }
    }
    // Dispatch sender dropped: closing the per-worker senders lets each
    // worker drain and exit.
}

async fn run_worker(
    index: usize,
    mut worker: PipelineWorker,
    mut rx: mpsc::UnboundedReceiver<AckableMessage>,
    sweep_interval: Duration,
) {
    let mut sweep_tick = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(message) => worker.handle(message).await,
                    None => break,
                }
            }
            _ = sweep_tick.tick() => {
                worker.sweep_dedup();
            }
        }
    }
    debug!(worker = index, "pipeline worker stopped");
}

/// Worker index for a raw message key. Hashing only the device segment keeps
/// all of a device's event types on one worker.
fn worker_for(key: Option<&[u8]>, worker_count: usize) -> usize {
    let mut hasher = SipHasher13::new();
    match key.and_then(device_segment) {
        Some(device) => device.hash(&mut hasher),
        None => key.unwrap_or_default().hash(&mut hasher),
    }
    (hasher.finish() % worker_count as u64) as usize
}

fn device_segment(key: &[u8]) -> Option<&[u8]> {
    key.split(|&b| b == b'/').nth(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_event_types_of_a_device_share_a_worker() {
        let metric = worker_for(Some(b"devices/dev-42/metric"), 8);
        let status = worker_for(Some(b"devices/dev-42/status"), 8);
        let image = worker_for(Some(b"devices/dev-42/image"), 8);
        assert_eq!(metric, status);
        assert_eq!(metric, image);
    }

    #[test]
    fn keyless_messages_still_route_inside_the_pool() {
        assert!(worker_for(None, 4) < 4);
        assert!(worker_for(Some(b"garbage"), 4) < 4);
    }
}
