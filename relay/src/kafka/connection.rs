use std::time::Duration;

use crate::metrics_const::BROKER_CONNECTION_TRANSITIONS;
use crate::retry::RetryPolicy;

/// Broker connection state machine shared by the metadata probe and the
/// consume loop. Failures and recoveries are recorded here so the
/// disconnected/reconnecting/connected transitions are counted and backed
/// off consistently, and so the logic is testable without a broker.
pub struct ConnectionHealth {
    backoff: RetryPolicy,
    connected: bool,
    consecutive_failures: u32,
}

impl ConnectionHealth {
    /// Starts disconnected; the first successful probe or read is the
    /// transition to connected.
    pub fn new(backoff: RetryPolicy) -> Self {
        Self {
            backoff,
            connected: false,
            consecutive_failures: 0,
        }
    }

    /// Records a failed read or probe and returns the delay to wait before
    /// the next attempt. The first failure of an outage is the
    /// disconnected transition; every failure counts as reconnecting.
    pub fn record_failure(&mut self) -> Duration {
        if self.connected {
            self.connected = false;
            metrics::counter!(BROKER_CONNECTION_TRANSITIONS, "state" => "disconnected")
                .increment(1);
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        metrics::counter!(BROKER_CONNECTION_TRANSITIONS, "state" => "reconnecting").increment(1);
        self.backoff.delay(self.consecutive_failures)
    }

    /// Records a successful read or probe. Returns true when this success
    /// ends an outage (one or more recorded failures since the connection
    /// was last up).
    pub fn record_success(&mut self) -> bool {
        let recovered = !self.connected && self.consecutive_failures > 0;
        if !self.connected {
            self.connected = true;
            metrics::counter!(BROKER_CONNECTION_TRANSITIONS, "state" => "connected").increment(1);
        }
        self.consecutive_failures = 0;
        recovered
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}
