//! MAVLink v2 actuator adapter.
//!
//! Sends MANUAL_CONTROL to an autopilot (ArduPilot Rover, PX4) through a UDP
//! endpoint, normally the output of `mavlink-router` running next to the
//! agent. The autopilot does its own mixing, so only the pre-mix values are
//! used:
//!
//! ```text
//! x = throttle · 1000   (forward/back)
//! r = steering · 1000   (yaw)
//! z = 500               (neutral)
//! ```
//!
//! HEARTBEAT and SYS_STATUS received from the autopilot are forwarded as
//! feedback. The adapter also announces itself with a GCS heartbeat so the
//! autopilot's GCS failsafe stays quiet while we drive.
//!
//! Serial autopilot connections go through mavlink-router; this adapter only
//! speaks UDP.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adapter_trait::{now_ms, ActuatorCommand, ActuatorLink, Feedback};
use anyhow::{Context, Result};
use async_stream::stream;
use futures::Stream;
use mavlink::{
    ardupilotmega::{
        MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
        MANUAL_CONTROL_DATA,
    },
    MavHeader,
};
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MavlinkConfig {
    /// mavlink-router UDP endpoint.
    #[serde(default = "default_addr")]
    pub addr:             SocketAddr,
    #[serde(default = "default_bind")]
    pub bind:             SocketAddr,
    /// System ID of the autopilot MANUAL_CONTROL is addressed to.
    #[serde(default = "default_target")]
    pub target_system:    u8,
    /// Our identity on the bus. 255 is the conventional GCS ID.
    #[serde(default = "default_system_id")]
    pub gcs_system_id:    u8,
    #[serde(default = "default_component_id")]
    pub gcs_component_id: u8,
    /// GCS heartbeat period; 0 disables it.
    #[serde(default = "default_heartbeat")]
    pub gcs_heartbeat_ms: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

fn default_addr()          -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 14550)) }
fn default_bind()          -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 0)) }
fn default_target()        -> u8  { 1 }
fn default_system_id()     -> u8  { 255 }
fn default_component_id()  -> u8  { 190 }
fn default_heartbeat()     -> u64 { 1_000 }
fn default_write_timeout() -> u64 { 100 }

impl Default for MavlinkConfig {
    fn default() -> Self {
        Self {
            addr:             default_addr(),
            bind:             default_bind(),
            target_system:    default_target(),
            gcs_system_id:    default_system_id(),
            gcs_component_id: default_component_id(),
            gcs_heartbeat_ms: default_heartbeat(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Adapter implementation
// ──────────────────────────────────────────────────────────────────────────────

pub struct MavlinkLink {
    link_id:        String,
    config:         MavlinkConfig,
    /// Connected to the router; MAVLink is full-duplex on one socket.
    socket:         Arc<UdpSocket>,
    seq:            Arc<AtomicU8>,
    feedback_taken: AtomicBool,
    heartbeat:      Option<JoinHandle<()>>,
}

impl MavlinkLink {
    pub async fn connect(config: MavlinkConfig) -> Result<Self> {
        let link_id = format!("mavlink-udp:{}", config.addr);
        let socket = UdpSocket::bind(config.bind).await
            .context("binding MAVLink UDP socket")?;
        socket.connect(config.addr).await
            .context("connecting MAVLink UDP socket to router")?;
        info!(link = %link_id, remote = %config.addr, "MAVLink UDP connected");

        let socket = Arc::new(socket);
        let seq = Arc::new(AtomicU8::new(0));
        let heartbeat = (config.gcs_heartbeat_ms > 0).then(|| {
            tokio::spawn(send_heartbeats(
                Arc::clone(&socket),
                Arc::clone(&seq),
                config.clone(),
            ))
        });

        Ok(Self { link_id, config, socket, seq, feedback_taken: AtomicBool::new(false), heartbeat })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("reading MAVLink socket address")
    }

    fn header(&self) -> MavHeader {
        header(&self.config, &self.seq)
    }
}

impl Drop for MavlinkLink {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

fn header(config: &MavlinkConfig, seq: &AtomicU8) -> MavHeader {
    MavHeader {
        system_id:    config.gcs_system_id,
        component_id: config.gcs_component_id,
        sequence:     seq.fetch_add(1, Ordering::Relaxed),
    }
}

fn encode(header: MavHeader, msg: &MavMessage) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(280);
    mavlink::write_v2_msg(&mut out, header, msg).context("serializing MAVLink frame")?;
    Ok(out)
}

/// Maps a pre-mix command onto MANUAL_CONTROL axes.
pub fn manual_control(cmd: &ActuatorCommand, target: u8) -> MavMessage {
    let axis = |v: f32| (v.clamp(-1.0, 1.0) * 1000.0).round() as i16;
    MavMessage::MANUAL_CONTROL(MANUAL_CONTROL_DATA {
        x:       axis(cmd.throttle),
        y:       0,
        z:       500,
        r:       axis(cmd.steering),
        buttons: 0,
        target,
        ..Default::default()
    })
}

async fn send_heartbeats(socket: Arc<UdpSocket>, seq: Arc<AtomicU8>, config: MavlinkConfig) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.gcs_heartbeat_ms));
    let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode:     0,
        mavtype:         MavType::MAV_TYPE_GCS,
        autopilot:       MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode:       MavModeFlag::empty(),
        system_status:   MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    });
    loop {
        ticker.tick().await;
        let frame = match encode(header(&config, &seq), &msg) {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "GCS heartbeat encoding failed");
                return;
            }
        };
        if let Err(e) = socket.send(&frame).await {
            debug!(error = %e, "GCS heartbeat send failed");
        }
    }
}

impl ActuatorLink for MavlinkLink {
    fn write_command(
        &self,
        cmd: ActuatorCommand,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
        let socket = Arc::clone(&self.socket);
        let frame = encode(self.header(), &manual_control(&cmd, self.config.target_system));
        let write_timeout = Duration::from_millis(self.config.write_timeout_ms);

        Box::pin(async move {
            let frame = frame?;
            tokio::time::timeout(write_timeout, socket.send(&frame))
                .await
                .context("MAVLink send timed out")?
                .context("sending MAVLink MANUAL_CONTROL via UDP")?;
            Ok(())
        })
    }

    fn feedback_stream(&self) -> Pin<Box<dyn Stream<Item = Feedback> + Send>> {
        if self.feedback_taken.swap(true, Ordering::SeqCst) {
            return Box::pin(futures::stream::empty());
        }
        let link_id = self.link_id.clone();
        let socket = Arc::clone(&self.socket);

        Box::pin(stream! {
            let mut buf = vec![0u8; 280]; // MAVLink v2 max frame = 280 bytes
            let mut announced = false;

            loop {
                let n = match socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(link = %link_id, error = %e, "MAVLink UDP recv error, retrying");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let (hdr, msg) = match mavlink::read_v2_msg::<MavMessage, _>(
                    &mut mavlink::peek_reader::PeekReader::new(std::io::Cursor::new(&buf[..n]))
                ) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(link = %link_id, error = %e, "MAVLink parse error (non-fatal)");
                        continue;
                    }
                };

                if !announced && matches!(msg, MavMessage::HEARTBEAT(_)) {
                    announced = true;
                    info!(link = %link_id, system_id = hdr.system_id, "Received first HEARTBEAT from autopilot");
                }

                if let Some(body) = translate(&hdr, &msg) {
                    yield Feedback { link_id: link_id.clone(), received_ms: now_ms(), body };
                }
            }
        })
    }

    fn link_id(&self) -> &str {
        &self.link_id
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// MAVLink → feedback translation
// ──────────────────────────────────────────────────────────────────────────────

fn translate(hdr: &MavHeader, msg: &MavMessage) -> Option<serde_json::Value> {
    match msg {
        MavMessage::HEARTBEAT(d) => {
            let armed = d.base_mode.bits() & 0x80 != 0; // MAV_MODE_FLAG_SAFETY_ARMED
            Some(json!({
                "msg":           "heartbeat",
                "system_id":     hdr.system_id,
                "armed":         armed,
                "custom_mode":   d.custom_mode,
                "system_status": d.system_status as u32,
            }))
        }
        MavMessage::SYS_STATUS(d) => Some(json!({
            "msg":           "sys_status",
            "system_id":     hdr.system_id,
            "voltage_mv":    d.voltage_battery,
            "current_ca":    d.current_battery,
            "remaining_pct": d.battery_remaining,
        })),
        _ => None,
    }
}
