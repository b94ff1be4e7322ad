//! Teleoperation agent
//!
//! Entry point. Responsibilities:
//! 1. Load configuration (exit code 2 on failure)
//! 2. Start the metrics exporter
//! 3. Instantiate the actuator adapter selected by config
//! 4. Start the uplink relay (capture endpoint → outbound video track)
//! 5. Start the command router (control frames → actuator link)
//! 6. Drive the session bridge until shutdown or a terminal session failure
//!    (exit code 3)
//!
//! Data topology inside the agent:
//!
//!   [capture TCP] → [Uplink relay] → [sample slot (1)] → [TrackPublisher] ─┐
//!                                                                         ├→ [Session bridge] ⇄ room
//!   [Command router] ← [per-origin frame queues (4)] ← control topic ─────┤
//!          │         ← [router events] ← peers / handover / command topic ─┤
//!          └─→ [ActuatorLink]                                               │
//!          └─→ [status (bounded)] ───────────────────→ status topic ───────┘

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use adapter_trait::{ActuatorLink, AdapterType};
use anyhow::{Context, Result};
use command_router::CommandRouter;
use mavlink_adapter::MavlinkLink;
use serial_line_adapter::SerialLineLink;
use session_bridge::{SessionBridge, WsRoomTransport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uplink_relay::{capture_hint, UplinkRelay};

const EXIT_CONFIG: u8 = 2;
const EXIT_SESSION_FATAL: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // ── Configuration ──────────────────────────────────────────────────────────
    let cfg = match config::AgentConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cfg.log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .json()
        .init();

    info!(
        identity = %cfg.session.identity,
        room     = %cfg.session.room,
        version  = env!("CARGO_PKG_VERSION"),
        "Teleoperation agent starting"
    );

    match run(cfg).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "Agent startup failed");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(cfg: config::AgentConfig) -> Result<ExitCode> {
    // ── Metrics exporter ────────────────────────────────────────────────────────
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(cfg.metrics_addr()?)
        .install()
        .context("installing Prometheus exporter")?;

    // ── Actuator adapter ────────────────────────────────────────────────────────
    let link: Box<dyn ActuatorLink> = match cfg.adapter {
        AdapterType::SerialLine => Box::new(SerialLineLink::new(&cfg.serial_line)),
        AdapterType::MavlinkUdp => Box::new(MavlinkLink::connect(cfg.mavlink.clone()).await?),
    };
    info!(link = %link.link_id(), "Actuator adapter initialized");

    // ── Session bridge ──────────────────────────────────────────────────────────
    let mut session_cfg = cfg.session.clone();
    session_cfg.track_mime = cfg.uplink.codec.mime().to_string();
    let transport = Arc::new(WsRoomTransport::new(&session_cfg.url));
    let mut bridge = SessionBridge::new(session_cfg, transport);

    let handle = bridge.handle();
    let router_events = bridge
        .take_router_events()
        .context("router event channel already taken")?;
    let frames = handle.on_data_message(&cfg.session.control_topic);
    let status = bridge.status_sender();
    let track_sink = bridge.track_sink();

    let cancel = CancellationToken::new();

    // ── Uplink relay ────────────────────────────────────────────────────────────
    info!(pipeline = %capture_hint(&cfg.uplink), "Expecting capture pipeline");
    let uplink = UplinkRelay::start(cfg.uplink.clone(), track_sink, &cancel);

    // ── Command router ──────────────────────────────────────────────────────────
    // Owns the actuator link; writes a final stop once cancelled.
    let router = CommandRouter::new(cfg.router.clone(), link);
    let router_task = tokio::spawn(router.run(frames, router_events, status, cancel.child_token()));

    // ── Run until shutdown or terminal session failure ─────────────────────────
    let mut bridge_task = tokio::spawn(bridge.run(cancel.clone()));

    let (exit, bridge_done) = tokio::select! {
        result = &mut bridge_task => {
            let code = match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!(error = %e, "Session reached terminal state, shutting down");
                    ExitCode::from(EXIT_SESSION_FATAL)
                }
                Err(e) => {
                    error!(error = %e, "Session bridge task failed");
                    ExitCode::from(EXIT_SESSION_FATAL)
                }
            };
            (code, true)
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            (ExitCode::SUCCESS, false)
        }
    };

    cancel.cancel();

    if let Err(e) = router_task.await {
        warn!(error = %e, "Command router task failed");
    }
    let stats = uplink.stats();
    uplink.stop().await;
    if !bridge_done {
        match bridge_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Session bridge failed during shutdown"),
            Err(e) => warn!(error = %e, "Session bridge task failed"),
        }
    }

    info!(
        bytes_read   = stats.bytes_read,
        access_units = stats.access_units,
        forwarded    = stats.forwarded,
        dropped      = stats.dropped,
        "Teleoperation agent stopped"
    );
    Ok(exit)
}

/// SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
