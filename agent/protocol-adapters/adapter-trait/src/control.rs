//! Operator control messages: the JSON data-message contract and the
//! in-process types derived from it.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Four normalized joystick axes. Valid range is [-1.0, 1.0] on every axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Axes {
    pub left_x:  f32,
    pub left_y:  f32,
    pub right_x: f32,
    pub right_y: f32,
}

impl Axes {
    pub fn values(&self) -> [f32; 4] {
        [self.left_x, self.left_y, self.right_x, self.right_y]
    }

    /// True when every axis is finite and inside [-1.0, 1.0] (inclusive).
    pub fn in_range(&self) -> bool {
        self.values().iter().all(|v| v.is_finite() && (-1.0..=1.0).contains(v))
    }

    /// Clamps every axis into [-1.0, 1.0]. `None` if any axis is NaN/inf.
    pub fn clamped(&self) -> Option<Axes> {
        if !self.values().iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Axes {
            left_x:  self.left_x.clamp(-1.0, 1.0),
            left_y:  self.left_y.clamp(-1.0, 1.0),
            right_x: self.right_x.clamp(-1.0, 1.0),
            right_y: self.right_y.clamp(-1.0, 1.0),
        })
    }
}

/// A data message received from a remote peer, on the control or command topic.
///
/// ```json
/// {"type":"gamepad","data":{"left_x":0.5,"left_y":-0.2,"right_x":0.0,"right_y":0.1},"timestamp":1234}
/// {"type":"handover","to":"operator-2"}
/// {"type":"forward","distance":2.0,"velocity":0.5,"steering":0.0}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataMessage {
    Gamepad {
        data: Axes,
        /// Sender clock, integer milliseconds.
        timestamp: u64,
        /// Explicit per-sender sequence number. Falls back to `timestamp`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    /// Sent by the current controller to pass control on (or release it with `to: null`).
    Handover {
        #[serde(default)]
        to: Option<String>,
    },
    Forward {
        distance: f32,
        velocity: f32,
        #[serde(default)]
        steering: f32,
    },
    Backward {
        distance: f32,
        velocity: f32,
        #[serde(default)]
        steering: f32,
    },
}

impl DataMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A timestamped joystick sample from one operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFrame {
    /// Strictly increasing per origin; stale frames are discarded by the router.
    pub seq:        u64,
    /// Identity of the remote peer that produced the frame.
    pub origin:     String,
    pub axes:       Axes,
    /// Sender-side timestamp (ms) as carried in the message.
    pub sent_ms:    u64,
    pub received_at: Instant,
}

impl ControlFrame {
    pub fn new(origin: impl Into<String>, seq: u64, axes: Axes) -> Self {
        Self {
            seq,
            origin: origin.into(),
            axes,
            sent_ms: seq,
            received_at: Instant::now(),
        }
    }

    /// Builds a frame from a gamepad data message. Returns `None` for any other message type.
    pub fn from_message(origin: &str, msg: &DataMessage) -> Option<Self> {
        match msg {
            DataMessage::Gamepad { data, timestamp, seq } => Some(Self {
                seq:         seq.unwrap_or(*timestamp),
                origin:      origin.to_string(),
                axes:        *data,
                sent_ms:     *timestamp,
                received_at: Instant::now(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManeuverDirection {
    Forward,
    Backward,
}

/// Autonomy command: drive `distance_m` at `velocity_mps` with fixed steering.
#[derive(Debug, Clone, PartialEq)]
pub struct ManeuverRequest {
    pub origin:       String,
    pub direction:    ManeuverDirection,
    pub distance_m:   f32,
    pub velocity_mps: f32,
    pub steering:     f32,
}

impl ManeuverRequest {
    pub fn from_message(origin: &str, msg: &DataMessage) -> Option<Self> {
        let (direction, distance, velocity, steering) = match *msg {
            DataMessage::Forward { distance, velocity, steering } =>
                (ManeuverDirection::Forward, distance, velocity, steering),
            DataMessage::Backward { distance, velocity, steering } =>
                (ManeuverDirection::Backward, distance, velocity, steering),
            _ => return None,
        };
        Some(Self {
            origin: origin.to_string(),
            direction,
            distance_m: distance,
            velocity_mps: velocity,
            steering,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.distance_m.is_finite() && self.distance_m > 0.0
            && self.velocity_mps.is_finite() && self.velocity_mps > 0.0
            && self.steering.is_finite() && (-1.0..=1.0).contains(&self.steering)
    }
}

/// Reliable (non-coalesced) events from the session bridge to the command router.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// The transport reported this peer leaving the room.
    PeerLeft { identity: String },
    /// A new Session was built; these are the only peers that exist now.
    PeersReset { identities: Vec<String> },
    Handover { from: String, to: Option<String> },
    Maneuver(ManeuverRequest),
}
