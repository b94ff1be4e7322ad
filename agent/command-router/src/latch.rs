//! Single-controller latch.
//!
//! The first peer whose control frame passes validation holds the latch until
//! it leaves, hands control over, or (when configured) stays idle too long.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatchDecision {
    /// The latch was free and now belongs to this origin.
    Acquired,
    Held,
    Denied { holder: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{requester} cannot hand over control held by {holder:?}")]
pub struct HandoverDenied {
    pub requester: String,
    pub holder:    Option<String>,
}

#[derive(Debug, Default)]
pub struct ControllerLatch {
    holder:        Option<String>,
    last_activity: Option<Instant>,
    idle_release:  Option<Duration>,
}

impl ControllerLatch {
    pub fn new(idle_release: Option<Duration>) -> Self {
        Self { holder: None, last_activity: None, idle_release }
    }

    pub fn holder(&self) -> Option<&str> {
        self.holder.as_deref()
    }

    /// Decide whether `origin` may drive. Acquires the latch when it is free.
    pub fn authorize(&mut self, origin: &str, now: Instant) -> LatchDecision {
        match &self.holder {
            None => {
                self.holder = Some(origin.to_string());
                self.last_activity = Some(now);
                LatchDecision::Acquired
            }
            Some(h) if h == origin => {
                self.last_activity = Some(now);
                LatchDecision::Held
            }
            Some(h) => LatchDecision::Denied { holder: h.clone() },
        }
    }

    /// Release the latch if the idle timeout elapsed. Returns the former holder.
    pub fn expire(&mut self, now: Instant) -> Option<String> {
        let idle = self.idle_release?;
        let last = self.last_activity?;
        if now.saturating_duration_since(last) > idle {
            self.last_activity = None;
            self.holder.take()
        } else {
            None
        }
    }

    /// Release the latch if `identity` holds it.
    pub fn release_if(&mut self, identity: &str) -> bool {
        if self.holder.as_deref() == Some(identity) {
            self.holder = None;
            self.last_activity = None;
            true
        } else {
            false
        }
    }

    /// Release the latch if its holder is not among `present`.
    pub fn retain(&mut self, present: &[String]) -> Option<String> {
        let holder = self.holder.as_ref()?;
        if present.iter().any(|p| p == holder) {
            return None;
        }
        self.last_activity = None;
        self.holder.take()
    }

    /// Move the latch from `from` to `to` (`None` releases it). Only the
    /// current holder may hand over.
    pub fn handover(&mut self, from: &str, to: Option<String>, now: Instant) -> Result<(), HandoverDenied> {
        if self.holder.as_deref() != Some(from) {
            return Err(HandoverDenied { requester: from.to_string(), holder: self.holder.clone() });
        }
        self.last_activity = to.as_ref().map(|_| now);
        self.holder = to;
        Ok(())
    }
}
