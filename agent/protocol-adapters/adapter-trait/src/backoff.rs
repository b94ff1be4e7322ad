//! Capped exponential backoff shared by every retry loop in the agent.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base:    Duration,
    cap:     Duration,
    current: Duration,
    jitter:  bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, current: base, jitter: false, attempt: 0 }
    }

    /// Adds up to 25% random delay on top of each step.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay to wait before the next attempt. Doubles each call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        self.attempt += 1;
        if self.jitter {
            let extra = rand_jitter(delay.as_millis() as u64 / 4);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempt = 0;
    }
}

/// Simple non-cryptographic jitter in range [0, max_ms]
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 { return 0; }
    // Use lower bits of current time as entropy source
    let entropy = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    entropy % (max_ms + 1)
}
