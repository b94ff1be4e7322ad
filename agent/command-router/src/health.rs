//! Actuator link health bookkeeping.

use std::time::Duration;

use adapter_trait::Backoff;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    None,
    /// The failure threshold was just reached.
    WentDown { consecutive_failures: u32 },
    Restored,
}

#[derive(Debug)]
pub struct LinkHealth {
    pub last_success:         Option<Instant>,
    pub consecutive_failures: u32,
    pub link_down:            bool,
    /// Earliest time the next write may be attempted after a failure.
    pub next_attempt:         Option<Instant>,
    threshold:                u32,
    backoff:                  Backoff,
}

impl LinkHealth {
    /// `retry_base` is one cadence tick; retries double up to `retry_cap`.
    pub fn new(threshold: u32, retry_base: Duration, retry_cap: Duration) -> Self {
        Self {
            last_success:         None,
            consecutive_failures: 0,
            link_down:            false,
            next_attempt:         None,
            threshold:            threshold.max(1),
            backoff:              Backoff::new(retry_base, retry_cap),
        }
    }

    pub fn may_attempt(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |t| now >= t)
    }

    pub fn record_success(&mut self, now: Instant) -> HealthChange {
        self.last_success = Some(now);
        self.consecutive_failures = 0;
        self.next_attempt = None;
        self.backoff.reset();
        if std::mem::take(&mut self.link_down) {
            HealthChange::Restored
        } else {
            HealthChange::None
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> HealthChange {
        self.consecutive_failures += 1;
        self.next_attempt = Some(now + self.backoff.next_delay());
        if !self.link_down && self.consecutive_failures >= self.threshold {
            self.link_down = true;
            HealthChange::WentDown { consecutive_failures: self.consecutive_failures }
        } else {
            HealthChange::None
        }
    }
}
