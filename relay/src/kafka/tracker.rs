use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::kafka::message::{AckableMessage, MessageResult};
use crate::metrics_const::IN_FLIGHT_MESSAGES;

/// Tracks every message handed to the pipeline until it reaches a terminal
/// outcome, and derives the offsets that are safe to commit.
///
/// An offset is safe only when it and every lower tracked offset of its
/// partition have completed (success or terminal failure). Committing past
/// an undetermined message would silently lose it on restart; this keeps the
/// at-least-once guarantee.
pub struct InFlightTracker {
    shared: Arc<TrackerShared>,
    semaphore: Arc<Semaphore>,
}

pub(crate) struct TrackerShared {
    state: Mutex<TrackerState>,
    drained: Notify,
}

#[derive(Default)]
struct TrackerState {
    in_flight: usize,
    completed: u64,
    failed: u64,
    abandoned: u64,
    partitions: HashMap<(String, i32), PartitionState>,
}

#[derive(Default)]
struct PartitionState {
    /// Tracked offsets in order, marked true once their outcome is known.
    pending: BTreeMap<i64, bool>,
    /// Highest contiguous completed offset, not yet handed out for commit.
    safe: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl InFlightTracker {
    /// `max_in_flight` bounds how many messages may be between broker
    /// receipt and terminal outcome at once; the semaphore is the intake
    /// backpressure valve.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                state: Mutex::new(TrackerState::default()),
                drained: Notify::new(),
            }),
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    /// Waits while the pipeline is saturated; holding the permit keeps the
    /// message counted against the in-flight bound until it is acked.
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .context("in-flight semaphore closed")
    }

    pub fn track(&self, message: OwnedMessage, permit: OwnedSemaphorePermit) -> AckableMessage {
        {
            let mut state = self.shared.lock_state();
            state.in_flight += 1;
            metrics::gauge!(IN_FLIGHT_MESSAGES).set(state.in_flight as f64);
            state
                .partitions
                .entry((message.topic().to_string(), message.partition()))
                .or_default()
                .pending
                .insert(message.offset(), false);
        }
        AckableMessage::new(message, Arc::clone(&self.shared), permit)
    }

    /// Offsets whose processing outcome is determined, one per partition,
    /// drained so a later call does not re-commit them.
    pub fn safe_commit_offsets(&self) -> Vec<((String, i32), i64)> {
        let mut state = self.shared.lock_state();
        state
            .partitions
            .iter_mut()
            .filter_map(|(key, partition)| partition.safe.take().map(|offset| (key.clone(), offset)))
            .collect()
    }

    /// Resolves once no tracked message is awaiting an outcome.
    pub async fn wait_for_completion(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.shared.lock_state().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> TrackerStats {
        let state = self.shared.lock_state();
        TrackerStats {
            in_flight: state.in_flight,
            completed: state.completed,
            failed: state.failed,
            abandoned: state.abandoned,
        }
    }
}

impl TrackerShared {
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().expect("tracker state mutex poisoned")
    }

    pub(crate) fn complete(&self, topic: &str, partition: i32, offset: i64, result: &MessageResult) {
        let mut state = self.lock_state();
        match result {
            MessageResult::Success => state.completed += 1,
            MessageResult::Failed(_) => state.failed += 1,
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        metrics::gauge!(IN_FLIGHT_MESSAGES).set(state.in_flight as f64);

        if let Some(partition_state) = state
            .partitions
            .get_mut(&(topic.to_string(), partition))
        {
            partition_state.pending.insert(offset, true);
            // Advance the safe offset through the contiguous completed run.
            while let Some((&first, &done)) = partition_state.pending.iter().next() {
                if !done {
                    break;
                }
                partition_state.pending.remove(&first);
                partition_state.safe = Some(first);
            }
        }

        if state.in_flight == 0 {
            drop(state);
            self.drained.notify_waiters();
        }
    }

    /// A message left without a determined outcome. Its offset stays
    /// pending, so the safe commit offset for the partition never advances
    /// past it and a restart redelivers it.
    pub(crate) fn abandon(&self) {
        let mut state = self.lock_state();
        state.abandoned += 1;
        state.in_flight = state.in_flight.saturating_sub(1);
        metrics::gauge!(IN_FLIGHT_MESSAGES).set(state.in_flight as f64);

        if state.in_flight == 0 {
            drop(state);
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{OwnedHeaders, Timestamp};

    fn test_message(partition: i32, offset: i64) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"{}".to_vec()),
            Some(b"devices/dev-1/metric".to_vec()),
            "telemetry".to_string(),
            Timestamp::now(),
            partition,
            offset,
            Some(OwnedHeaders::new()),
        )
    }

    #[tokio::test]
    async fn safe_offset_requires_contiguous_completion() {
        let tracker = InFlightTracker::new(16);

        let first = tracker.track(test_message(0, 10), tracker.acquire_permit().await.unwrap());
        let second = tracker.track(test_message(0, 11), tracker.acquire_permit().await.unwrap());

        // Completing the later offset alone must not unlock a commit.
        second.ack();
        assert!(tracker.safe_commit_offsets().is_empty());

        first.ack();
        assert_eq!(
            tracker.safe_commit_offsets(),
            vec![(("telemetry".to_string(), 0), 11)]
        );
        // Already handed out; nothing new to commit.
        assert!(tracker.safe_commit_offsets().is_empty());
    }

    #[tokio::test]
    async fn failed_outcomes_still_release_offsets() {
        let tracker = InFlightTracker::new(16);
        let msg = tracker.track(test_message(2, 5), tracker.acquire_permit().await.unwrap());
        msg.nack("sink gave up".to_string());

        assert_eq!(
            tracker.safe_commit_offsets(),
            vec![(("telemetry".to_string(), 2), 5)]
        );
        let stats = tracker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn dropped_message_keeps_its_offset_uncommitted() {
        let tracker = InFlightTracker::new(16);
        {
            let _msg = tracker.track(test_message(0, 7), tracker.acquire_permit().await.unwrap());
            // Dropped without an ack: the outcome was never determined.
        }
        let stats = tracker.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.in_flight, 0);

        // The offset must not be handed out for commit; a restart has to
        // redeliver it.
        assert!(tracker.safe_commit_offsets().is_empty());
    }

    #[tokio::test]
    async fn abandoned_offset_blocks_later_completions_from_committing() {
        let tracker = InFlightTracker::new(16);
        {
            let _dropped =
                tracker.track(test_message(0, 10), tracker.acquire_permit().await.unwrap());
        }
        let later = tracker.track(test_message(0, 11), tracker.acquire_permit().await.unwrap());
        later.ack();

        // Offset 11 completed, but committing it would skip the abandoned
        // offset 10.
        assert!(tracker.safe_commit_offsets().is_empty());

        // An earlier partition run below the abandoned offset still commits.
        let earlier = tracker.track(test_message(1, 3), tracker.acquire_permit().await.unwrap());
        earlier.ack();
        assert_eq!(
            tracker.safe_commit_offsets(),
            vec![(("telemetry".to_string(), 1), 3)]
        );
    }

    #[tokio::test]
    async fn wait_for_completion_resolves_after_drain() {
        let tracker = Arc::new(InFlightTracker::new(16));
        let msg = tracker.track(test_message(0, 1), tracker.acquire_permit().await.unwrap());

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_completion().await })
        };

        msg.ack();
        waiter.await.unwrap();
        assert_eq!(tracker.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn permits_enforce_the_in_flight_bound() {
        let tracker = InFlightTracker::new(1);
        let held = tracker.acquire_permit().await.unwrap();

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), tracker.acquire_permit())
                .await;
        assert!(blocked.is_err(), "second permit should be unavailable");

        drop(held);
        assert!(tracker.acquire_permit().await.is_ok());
    }
}
