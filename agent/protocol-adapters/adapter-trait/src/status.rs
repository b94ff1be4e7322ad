//! Status and telemetry published back to the room on the status topic.

use serde::Serialize;

use crate::Feedback;

/// Connection state of the Session Bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Session { state: SessionState },
    /// Terminal session failure; the process exits after this.
    SessionFatal { reason: String },
    LinkDown { link: String, consecutive_failures: u32 },
    LinkRestored { link: String },
    ControllerLatched { identity: String },
    ControllerReleased { identity: String },
    /// The uplink relay gave up on the capture endpoint and tore the track down.
    UplinkDown,
    UplinkRestored,
    Feedback(Feedback),
}

impl StatusEvent {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StatusEvent::SessionFatal { .. })
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
