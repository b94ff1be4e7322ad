//! Command Router: operator control frames → actuator link.
//!
//! ```text
//!  frames ──► submit (range → stale → latch) ──► pending slot ──┐
//!                                                               ├─ cadence tick ─► ActuatorLink
//!  events ──► peer left / reset / handover / maneuver ──────────┘       │
//!                                                                       ▼
//!                                                        link health, status events
//! ```
//!
//! The cadence loop is the only writer. Input arriving faster than the
//! cadence is coalesced (latest accepted frame wins); input stopping for longer
//! than the watchdog interval produces exactly one zero-motion write.

pub mod health;
pub mod latch;
pub mod mixer;
pub mod router;

use std::time::Duration;

use serde::Deserialize;

pub use health::{HealthChange, LinkHealth};
pub use latch::{ControllerLatch, HandoverDenied, LatchDecision};
pub use router::{CommandRouter, Rejection, RouterCore, WriteIntent, WriteKind};

/// What to do with a frame whose axes leave [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRangePolicy {
    #[default]
    Reject,
    Clamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Actuator write rate.
    #[serde(default = "default_cadence")]
    pub cadence_hz:             u32,
    #[serde(default = "default_watchdog")]
    pub watchdog_ms:            u64,
    /// Consecutive write failures before the link is reported down.
    #[serde(default = "default_failure_threshold")]
    pub link_failure_threshold: u32,
    /// Retry backoff starts at one cadence tick and doubles up to this.
    #[serde(default = "default_retry_max")]
    pub retry_max_ms:           u64,
    #[serde(default)]
    pub out_of_range:           OutOfRangePolicy,
    /// Wheel command magnitude at full stick deflection.
    #[serde(default = "default_max_throttle")]
    pub max_throttle:           f32,
    /// Speed that maps to `max_throttle` for autonomy maneuvers.
    #[serde(default = "default_max_speed")]
    pub max_speed_mps:          f32,
    /// Release the controller latch after this much inactivity. Off when unset.
    #[serde(default)]
    pub latch_idle_release_ms:  Option<u64>,
    #[serde(default = "default_stop_timeout")]
    pub shutdown_stop_timeout_ms: u64,
}

fn default_cadence()           -> u32 { 20 }
fn default_watchdog()          -> u64 { 300 }
fn default_failure_threshold() -> u32 { 3 }
fn default_retry_max()         -> u64 { 1_000 }
fn default_max_throttle()      -> f32 { 0.5 }
fn default_max_speed()         -> f32 { 1.0 }
fn default_stop_timeout()      -> u64 { 500 }

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cadence_hz:               default_cadence(),
            watchdog_ms:              default_watchdog(),
            link_failure_threshold:   default_failure_threshold(),
            retry_max_ms:             default_retry_max(),
            out_of_range:             OutOfRangePolicy::default(),
            max_throttle:             default_max_throttle(),
            max_speed_mps:            default_max_speed(),
            latch_idle_release_ms:    None,
            shutdown_stop_timeout_ms: default_stop_timeout(),
        }
    }
}

impl RouterConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.cadence_hz.max(1)))
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}
