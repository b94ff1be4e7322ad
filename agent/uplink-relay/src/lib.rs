//! Uplink relay: local capture endpoint → outbound video track.
//!
//! The camera pipeline runs as a **separate process** (GStreamer) and writes an
//! Annex-B elementary stream to a local TCP endpoint. This crate reads that
//! stream, cuts it into access units and hands each one to a [`TrackSink`]
//! (the Session Bridge's outbound track).
//!
//! # Data path
//!
//! ```text
//! capture ──TCP──► read task ──framer──► ring(1) ──► forward task ──► TrackSink
//! ```
//!
//! The ring between the two tasks holds exactly one access unit. When the sink
//! stalls (session reconnecting, congested link) the read task keeps reading at
//! capture rate and every new access unit overwrites the pending one. The
//! capture process never sees backpressure and the operator always gets the
//! freshest picture once the sink unblocks.
//!
//! # Intended capture pipeline
//!
//! See [`capture_hint`]; with the default `connect` endpoint the pipeline hosts
//! `tcpserversink` and the relay dials in.
//!
//! # Configuration
//!
//! ```yaml
//! uplink:
//!   endpoint: { mode: connect, addr: 127.0.0.1:5000 }   # or mode: listen
//!   codec: h264                  # h264 | h265
//!   retry_base_ms: 500
//!   retry_max_ms: 5000
//!   max_consecutive_failures: 5  # then the outbound track is torn down
//! ```
//!
//! [`TrackSink`]: adapter_trait::TrackSink

pub mod framer;
pub mod relay;

use std::net::SocketAddr;

use serde::Deserialize;

pub use framer::{AccessUnitFramer, Codec, FramedUnit};
pub use relay::{UplinkHandle, UplinkRelay, UplinkStats, UplinkStatsSnapshot};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// How the relay reaches the capture process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LocalEndpoint {
    /// Dial the capture process (it runs `tcpserversink`).
    Connect { addr: SocketAddr },
    /// Accept one connection at a time from the capture process (`tcpclientsink`).
    Listen { addr: SocketAddr },
}

impl LocalEndpoint {
    pub fn addr(&self) -> SocketAddr {
        match self {
            LocalEndpoint::Connect { addr } | LocalEndpoint::Listen { addr } => *addr,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint:                 LocalEndpoint,
    #[serde(default)]
    pub codec:                    Codec,
    #[serde(default = "default_retry_base")]
    pub retry_base_ms:            u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_ms:             u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_read_buffer")]
    pub read_buffer_bytes:        usize,
    #[serde(default = "default_max_au")]
    pub max_access_unit_bytes:    usize,
    #[serde(default = "default_camera")]
    pub camera_device:            String,
}

fn default_endpoint() -> LocalEndpoint {
    LocalEndpoint::Connect { addr: SocketAddr::from(([127, 0, 0, 1], 5000)) }
}
fn default_retry_base()   -> u64    { 500 }
fn default_retry_max()    -> u64    { 5_000 }
fn default_max_failures() -> u32    { 5 }
fn default_read_buffer()  -> usize  { 64 * 1024 }
fn default_max_au()       -> usize  { 4 * 1024 * 1024 }
fn default_camera()       -> String { "/dev/video0".into() }

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            endpoint:                 default_endpoint(),
            codec:                    Codec::default(),
            retry_base_ms:            default_retry_base(),
            retry_max_ms:             default_retry_max(),
            max_consecutive_failures: default_max_failures(),
            read_buffer_bytes:        default_read_buffer(),
            max_access_unit_bytes:    default_max_au(),
            camera_device:            default_camera(),
        }
    }
}

/// `gst-launch-1.0` command line that produces what the relay expects:
/// byte-stream, AU-aligned, parameter sets repeated on every keyframe.
pub fn capture_hint(cfg: &UplinkConfig) -> String {
    let encode = match cfg.codec {
        Codec::H264 => "x264enc tune=zerolatency speed-preset=superfast key-int-max=30 \
                        ! h264parse config-interval=-1 \
                        ! video/x-h264,stream-format=byte-stream,alignment=au",
        Codec::H265 => "x265enc tune=zerolatency speed-preset=superfast key-int-max=30 \
                        ! h265parse config-interval=-1 \
                        ! video/x-h265,stream-format=byte-stream,alignment=au",
    };
    let addr = cfg.endpoint.addr();
    let sink = match cfg.endpoint {
        LocalEndpoint::Connect { .. } =>
            format!("tcpserversink host={} port={}", addr.ip(), addr.port()),
        LocalEndpoint::Listen { .. } =>
            format!("tcpclientsink host={} port={}", addr.ip(), addr.port()),
    };
    format!(
        "gst-launch-1.0 v4l2src device={dev} ! videoconvert ! {encode} ! {sink}",
        dev = cfg.camera_device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_matches_endpoint_mode() {
        let cfg = UplinkConfig::default();
        let hint = capture_hint(&cfg);
        assert!(hint.contains("tcpserversink host=127.0.0.1 port=5000"));
        assert!(hint.contains("h264parse"));

        let cfg = UplinkConfig {
            endpoint: LocalEndpoint::Listen { addr: "0.0.0.0:7000".parse().unwrap() },
            codec:    Codec::H265,
            ..UplinkConfig::default()
        };
        let hint = capture_hint(&cfg);
        assert!(hint.contains("tcpclientsink host=0.0.0.0 port=7000"));
        assert!(hint.contains("h265parse"));
    }
}
