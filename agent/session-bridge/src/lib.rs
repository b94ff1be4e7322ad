//! Session Bridge: owns the connection to the room.
//!
//! ```text
//!                 start / reconnect request
//!  Disconnected ─────────────────────────────► Connecting
//!       ▲  ▲                                       │ join ack
//!       │  │ auth failure / timeout (fatal)        ▼
//!       │  └──────────────────────────────────  Connected ◄──────┐
//!       │        non-recoverable disconnect        │             │ re-join
//!       │                                          │ recoverable │
//!       │   reconnect budget exhausted (fatal)     ▼             │
//!       └────────────────────────────────────  Reconnecting ─────┘
//! ```
//!
//! On every (re)connect the bridge builds a fresh [`Session`]: peers come only
//! from the join acknowledgement, the uplink track is published again and
//! matching remote tracks are re-subscribed. Consumers see:
//!
//! - [`BridgeHandle::on_data_message`]: `ControlFrame`s of a topic, per-origin
//!   bounded queues
//! - [`BridgeHandle::on_track_available`]: epoch-tagged track handles plus an
//!   invalidation event when their session ends
//! - [`SessionBridge::take_router_events`]: peer departures, session resets,
//!   handovers and maneuvers for the command router
//!
//! Status flows the other way through [`BridgeHandle::send_status`] or the
//! bounded sender from [`SessionBridge::status_sender`].

pub mod bridge;
pub mod inbound;
pub mod session;
pub mod transport;
pub mod ws;

use serde::Deserialize;

pub use bridge::{BridgeError, BridgeHandle, SessionBridge, TrackPublisher};
pub use session::{PeerRole, RemotePeer, Session, TrackEvent, TrackHandle};
pub use transport::{
    DisconnectReason, JoinError, JoinParams, PeerInfo, RoomConnection, RoomEvent, RoomRequest,
    RoomTransport, TrackInfo, TrackKind,
};
pub use ws::WsRoomTransport;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Rendezvous point, e.g. `wss://rtc.example.net`
    #[serde(default)]
    pub url:      String,
    #[serde(default)]
    pub room:     String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub token:    String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms:  u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts:  u32,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms:   u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms:    u64,

    #[serde(default = "default_control_topic")]
    pub control_topic:       String,
    #[serde(default = "default_command_topic")]
    pub command_topic:       String,
    #[serde(default = "default_status_topic")]
    pub status_topic:        String,

    /// Remote tracks are subscribed only for peers with one of these roles.
    #[serde(default = "default_subscribe_roles")]
    pub subscribe_roles:     Vec<String>,
    #[serde(default = "default_track_name")]
    pub track_name:          String,
    #[serde(default = "default_track_mime")]
    pub track_mime:          String,
    /// Per-origin inbound ControlFrame queue depth.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_queue_depth: usize,
}

fn default_connect_timeout()    -> u64         { 10_000 }
fn default_reconnect_attempts() -> u32         { 5 }
fn default_reconnect_base()     -> u64         { 1_000 }
fn default_reconnect_max()      -> u64         { 30_000 }
fn default_control_topic()      -> String      { "control".into() }
fn default_command_topic()      -> String      { "command".into() }
fn default_status_topic()       -> String      { "status".into() }
fn default_subscribe_roles()    -> Vec<String> { vec!["controller".into()] }
fn default_track_name()         -> String      { "camera".into() }
fn default_track_mime()         -> String      { "video/h264".into() }
fn default_inbound_capacity()   -> usize       { 4 }

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url:                 String::new(),
            room:                String::new(),
            identity:            String::new(),
            token:               String::new(),
            connect_timeout_ms:  default_connect_timeout(),
            reconnect_attempts:  default_reconnect_attempts(),
            reconnect_base_ms:   default_reconnect_base(),
            reconnect_max_ms:    default_reconnect_max(),
            control_topic:       default_control_topic(),
            command_topic:       default_command_topic(),
            status_topic:        default_status_topic(),
            subscribe_roles:     default_subscribe_roles(),
            track_name:          default_track_name(),
            track_mime:          default_track_mime(),
            inbound_queue_depth: default_inbound_capacity(),
        }
    }
}

impl BridgeConfig {
    pub fn join_params(&self) -> JoinParams {
        JoinParams {
            url:      self.url.clone(),
            room:     self.room.clone(),
            identity: self.identity.clone(),
            token:    self.token.clone(),
        }
    }
}
