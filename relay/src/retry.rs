use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::SinkError;
use crate::event::{DeliveryReceipt, DeliveryStatus, TelemetryEvent};
use crate::metrics_const::SINK_RETRIES;
use crate::sinks::Sink;

/// Capped exponential backoff with full jitter.
///
/// Delays are awaited inside the owning worker task only, so one device's
/// retries never stall another device's worker.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Jittered delay before retry number `attempt` (1-based). The
    /// exponential envelope is capped at `max_delay`; the actual delay is
    /// drawn uniformly from it to avoid synchronized retry storms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let envelope = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let millis = envelope.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Drive a sink to a terminal outcome for one event: retry transient
/// failures within the bounded attempt budget, then report terminal failure
/// rather than blocking indefinitely.
pub async fn deliver(
    sink: &dyn Sink,
    event: &TelemetryEvent,
    policy: &RetryPolicy,
) -> DeliveryReceipt {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match sink.deliver(event).await {
            Ok(()) => {
                return DeliveryReceipt {
                    event: event.key(),
                    sink: sink.name(),
                    attempts,
                    status: DeliveryStatus::Delivered,
                }
            }
            Err(SinkError::Terminal(reason)) => {
                return DeliveryReceipt {
                    event: event.key(),
                    sink: sink.name(),
                    attempts,
                    status: DeliveryStatus::TerminalFailure(reason),
                }
            }
            Err(SinkError::Retryable(reason)) => {
                if attempts >= policy.max_attempts {
                    return DeliveryReceipt {
                        event: event.key(),
                        sink: sink.name(),
                        attempts,
                        status: DeliveryStatus::TerminalFailure(format!(
                            "retries exhausted after {attempts} attempts: {reason}"
                        )),
                    };
                }
                metrics::counter!(SINK_RETRIES, "sink" => sink.name()).increment(1);
                warn!(
                    sink = sink.name(),
                    event = %event.key(),
                    attempt = attempts,
                    reason,
                    "transient sink failure, backing off"
                );
                tokio::time::sleep(policy.delay(attempts)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_bounded_by_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        };
        for attempt in 1..=32 {
            assert!(policy.delay(attempt) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn zero_base_delay_never_sleeps() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(3), Duration::ZERO);
    }
}
