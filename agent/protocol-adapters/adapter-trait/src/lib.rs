//! The hardware abstraction layer for the teleoperation agent.
//!
//! `ActuatorLink` is the single trait that ALL actuator adapters implement.
//! The command router only depends on this trait. It has no knowledge of
//! serial line formats, MAVLink, or any specific robot firmware.
//!
//! `TrackSink` is the matching seam on the video side: the uplink relay hands
//! complete access units to whatever currently owns the outbound track.
//!
//! To add support for a new robot protocol:
//!   1. Create a new crate under `protocol-adapters/`
//!   2. Implement `ActuatorLink` for your type
//!   3. Add a variant to `AdapterType` below
//!   4. Add a match arm in `agent-core/src/main.rs` to construct it from config

pub mod backoff;
pub mod control;
pub mod status;

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use bytes::Bytes;
use futures::Stream;

pub use backoff::Backoff;
pub use control::{Axes, ControlFrame, DataMessage, ManeuverDirection, ManeuverRequest, RouterEvent};
pub use status::{SessionState, StatusEvent};

// ──────────────────────────────────────────────────────────────────────────────
// Actuator side
// ──────────────────────────────────────────────────────────────────────────────

/// Robot-specific drive command derived from one `ControlFrame`.
///
/// `throttle`/`steering` are the pre-mix values (used by adapters whose
/// firmware does its own mixing, e.g. MAVLink MANUAL_CONTROL). `left`/`right`
/// are the differential-drive wheel values written by line-oriented firmware.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActuatorCommand {
    pub throttle: f32,
    pub steering: f32,
    pub left:     f32,
    pub right:    f32,
}

impl ActuatorCommand {
    /// Zero-motion command written by the safety fallback.
    pub const STOP: ActuatorCommand = ActuatorCommand {
        throttle: 0.0,
        steering: 0.0,
        left:     0.0,
        right:    0.0,
    };

    pub fn is_stop(&self) -> bool {
        self.left == 0.0 && self.right == 0.0 && self.throttle == 0.0
    }
}

/// One message received back from the robot firmware.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Feedback {
    pub link_id:     String,
    pub received_ms: u64,
    pub body:        serde_json::Value,
}

/// Exclusive connection to the robot's motor controller.
///
/// Implementations are responsible for:
/// - Opening the underlying device (serial port, UDP socket) lazily
/// - Translating `ActuatorCommand` → native wire format and writing it
/// - Reopening the device after a failed write; a failure is reported once
///   per call, retry pacing belongs to the caller
///
/// Only the command router ever holds an `ActuatorLink`; writes are never
/// issued concurrently.
pub trait ActuatorLink: Send + Sync + 'static {
    /// Encode and write one command. Resolves once the bytes are handed to the
    /// device (or the write timed out / failed).
    fn write_command(
        &self,
        cmd: ActuatorCommand,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;

    /// Messages the firmware sends back (status lines, heartbeats).
    ///
    /// May be called once; subsequent calls return an empty stream.
    fn feedback_stream(&self) -> Pin<Box<dyn Stream<Item = Feedback> + Send>>;

    /// Human-readable link name, used in logs and metrics labels.
    /// Example: "serial-line:/dev/ttyUSB0@115200"
    fn link_id(&self) -> &str;
}

/// Which actuator adapter to instantiate, driven by the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterType {
    /// Newline-terminated JSON commands on a serial device (`{"T":1,"L":..,"R":..}`)
    SerialLine,
    /// MAVLink v2 MANUAL_CONTROL via UDP (mavlink-router output)
    MavlinkUdp,
}

// ──────────────────────────────────────────────────────────────────────────────
// Media side
// ──────────────────────────────────────────────────────────────────────────────

/// One complete, independently forwardable access unit of the video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSample {
    /// Annex-B bytes of every NAL unit in the access unit, start codes included.
    pub data:      Bytes,
    pub keyframe:  bool,
    /// Capture-side timestamp, microseconds since UNIX epoch.
    pub pts_us:    u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    /// The outbound track cannot take a sample right now (not connected,
    /// not yet published, transport queue full). The sample is dropped.
    #[error("outbound track not ready")]
    NotReady,
    /// The sink is gone for good; the forwarder should exit.
    #[error("outbound track closed")]
    Closed,
}

/// Whatever currently owns the outbound video track.
pub trait TrackSink: Send + Sync + 'static {
    /// Hand one access unit to the transport.
    fn send(&self, sample: MediaSample) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;

    /// Ask for the track to be (re)published.
    fn open_track(&self);

    /// Tear the publication down (source is gone for good).
    fn close_track(&self);
}

// ──────────────────────────────────────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────────────────────────────────────

/// Returns the current wall-clock time as milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Returns the current wall-clock time as microseconds since UNIX epoch.
pub fn now_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
