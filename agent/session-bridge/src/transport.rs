//! The seam between the session state machine and a concrete room transport.
//!
//! A transport only knows how to join a room and pump messages. Everything
//! about session lifetime (timeouts, reconnects, epochs, peer bookkeeping)
//! lives in [`crate::bridge`].

use std::future::Future;
use std::pin::Pin;

use adapter_trait::MediaSample;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    /// Base URL of the rendezvous point, e.g. `wss://rtc.example.net`
    pub url:      String,
    pub room:     String,
    pub identity: String,
    /// Opaque access token; empty means none.
    pub token:    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub sid:  String,
    pub kind: TrackKind,
    #[serde(default)]
    pub name: String,
}

/// A participant as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub identity: String,
    #[serde(default)]
    pub role:     Option<String>,
    #[serde(default)]
    pub tracks:   Vec<TrackInfo>,
}

/// Why the transport dropped the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    NetworkLost(String),
    ServerRestart,
    /// The event stream ended without an explicit reason.
    StreamEnded,
    Kicked,
    RoomClosed,
    DuplicateIdentity,
}

impl DisconnectReason {
    /// Recoverable reasons move the bridge to `Reconnecting`; the rest are fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::NetworkLost(_) | DisconnectReason::ServerRestart | DisconnectReason::StreamEnded
        )
    }

    /// Map a server-supplied leave reason.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "kicked" | "removed"     => DisconnectReason::Kicked,
            "room_closed" | "room_deleted" => DisconnectReason::RoomClosed,
            "duplicate_identity"     => DisconnectReason::DuplicateIdentity,
            "server_restart" | "server_shutdown" => DisconnectReason::ServerRestart,
            other => DisconnectReason::NetworkLost(format!("server leave: {other}")),
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::NetworkLost(e)    => write!(f, "network lost: {e}"),
            DisconnectReason::ServerRestart     => f.write_str("server restart"),
            DisconnectReason::StreamEnded       => f.write_str("transport stream ended"),
            DisconnectReason::Kicked            => f.write_str("removed from room"),
            DisconnectReason::RoomClosed        => f.write_str("room closed"),
            DisconnectReason::DuplicateIdentity => f.write_str("identity joined elsewhere"),
        }
    }
}

/// Everything the transport reports after the join acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    PeerJoined(PeerInfo),
    PeerLeft { identity: String },
    TrackPublished { identity: String, track: TrackInfo },
    TrackUnpublished { identity: String, sid: String },
    Data { from: String, topic: String, payload: Bytes },
    Disconnected(DisconnectReason),
}

/// Requests from the bridge to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomRequest {
    PublishTrack { name: String, mime: String },
    UnpublishTrack { name: String },
    /// One access unit for the published video track.
    Sample(MediaSample),
    Subscribe { sid: String },
    Data { topic: String, payload: Vec<u8>, reliable: bool },
    /// Leave the room and close the underlying connection.
    Close,
}

/// A joined room. Dropping it (and every clone of `outbound`) closes the transport.
pub struct RoomConnection {
    pub local_identity: String,
    /// Peers present at join time.
    pub peers:          Vec<PeerInfo>,
    pub events:         Pin<Box<dyn Stream<Item = RoomEvent> + Send>>,
    pub outbound:       mpsc::Sender<RoomRequest>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("connect timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A room-based real-time transport.
pub trait RoomTransport: Send + Sync + 'static {
    /// Join the room. Resolves after the server acknowledged the join.
    ///
    /// Dropping the returned future abandons the attempt and closes whatever
    /// was opened so far.
    fn connect(
        &self,
        params: JoinParams,
    ) -> Pin<Box<dyn Future<Output = Result<RoomConnection, JoinError>> + Send>>;

    /// Example: "ws:wss://rtc.example.net"
    fn transport_id(&self) -> &str;
}
