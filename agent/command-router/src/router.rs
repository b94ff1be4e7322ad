//! Validation, coalescing and the actuator write loop.
//!
//! `RouterCore` is the synchronous state machine: every decision it makes
//! takes an explicit `now`, so the tests drive it without a runtime.
//! `CommandRouter` wraps it in the cadence loop that owns the `ActuatorLink`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use adapter_trait::{
    ActuatorCommand, ActuatorLink, ControlFrame, ManeuverDirection, ManeuverRequest,
    RouterEvent, StatusEvent,
};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::{HealthChange, LinkHealth};
use crate::latch::{ControllerLatch, LatchDecision};
use crate::mixer::{mix, mix_axes};
use crate::{OutOfRangePolicy, RouterConfig};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("axis value outside [-1, 1]")]
    OutOfRange,
    #[error("stale frame: seq {seq} is not newer than {last}")]
    Stale { seq: u64, last: u64 },
    #[error("{origin} is not the controller ({holder} holds control)")]
    NotController { origin: String, holder: String },
    #[error("maneuver parameters out of range")]
    InvalidManeuver,
}

impl Rejection {
    /// Metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::OutOfRange           => "out_of_range",
            Rejection::Stale { .. }         => "stale",
            Rejection::NotController { .. } => "not_controller",
            Rejection::InvalidManeuver      => "invalid_maneuver",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    /// The most recent accepted operator frame.
    Control { frame: ControlFrame },
    /// Watchdog zero after input went quiet.
    Fallback,
    ManeuverDrive,
    ManeuverStop,
}

/// A command the core wants written, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteIntent {
    pub cmd:  ActuatorCommand,
    pub kind: WriteKind,
}

#[derive(Debug)]
struct ActiveManeuver {
    origin:        String,
    cmd:           ActuatorCommand,
    ends_at:       Instant,
    drive_written: bool,
}

pub struct RouterCore {
    config:       RouterConfig,
    link_id:      String,
    latch:        ControllerLatch,
    /// Highest accepted sequence number per origin.
    last_seq:     HashMap<String, u64>,
    /// Latest accepted frame not yet written. Newer frames overwrite it.
    pending:      Option<ControlFrame>,
    last_input:   Instant,
    zero_written: bool,
    health:       LinkHealth,
    maneuver:     Option<ActiveManeuver>,
    in_flight:    bool,
}

impl RouterCore {
    pub fn new(config: RouterConfig, link_id: impl Into<String>, now: Instant) -> Self {
        let health = LinkHealth::new(
            config.link_failure_threshold,
            config.tick(),
            Duration::from_millis(config.retry_max_ms),
        );
        let latch = ControllerLatch::new(config.latch_idle_release_ms.map(Duration::from_millis));
        Self {
            config,
            link_id: link_id.into(),
            latch,
            last_seq: HashMap::new(),
            pending: None,
            last_input: now,
            zero_written: false,
            health,
            maneuver: None,
            in_flight: false,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn controller(&self) -> Option<&str> {
        self.latch.holder()
    }

    pub fn pending(&self) -> Option<&ControlFrame> {
        self.pending.as_ref()
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    pub fn maneuver_active(&self) -> bool {
        self.maneuver.is_some()
    }

    /// Validate a frame and make it the pending command.
    ///
    /// Checks run in order: axis range, sequence, controller latch. A rejected
    /// frame leaves no trace; in particular it never advances the sequence.
    pub fn submit(&mut self, frame: ControlFrame, now: Instant) -> Result<Vec<StatusEvent>, Rejection> {
        let axes = if frame.axes.in_range() {
            frame.axes
        } else {
            match self.config.out_of_range {
                OutOfRangePolicy::Reject => return Err(Rejection::OutOfRange),
                OutOfRangePolicy::Clamp => frame.axes.clamped().ok_or(Rejection::OutOfRange)?,
            }
        };

        if let Some(&last) = self.last_seq.get(&frame.origin) {
            if frame.seq <= last {
                return Err(Rejection::Stale { seq: frame.seq, last });
            }
        }

        let mut events = Vec::new();
        match self.latch.authorize(&frame.origin, now) {
            LatchDecision::Denied { holder } => {
                return Err(Rejection::NotController { origin: frame.origin, holder });
            }
            LatchDecision::Acquired => {
                info!(identity = %frame.origin, "Controller latched");
                events.push(StatusEvent::ControllerLatched { identity: frame.origin.clone() });
            }
            LatchDecision::Held => {}
        }

        if let Some(m) = self.maneuver.take() {
            info!(origin = %m.origin, "Maneuver cancelled by operator input");
        }

        self.last_seq.insert(frame.origin.clone(), frame.seq);
        self.last_input = now;
        self.zero_written = false;
        self.pending = Some(ControlFrame { axes, ..frame });
        Ok(events)
    }

    pub fn handle_event(&mut self, event: RouterEvent, now: Instant) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        match event {
            RouterEvent::PeerLeft { identity } => {
                self.last_seq.remove(&identity);
                if self.pending.as_ref().is_some_and(|f| f.origin == identity) {
                    self.pending = None;
                }
                if self.latch.release_if(&identity) {
                    info!(%identity, "Controller left, latch released");
                    events.push(StatusEvent::ControllerReleased { identity });
                }
            }
            RouterEvent::PeersReset { identities } => {
                // Producers keep counting across our session rebuild.
                self.last_seq.retain(|id, _| identities.contains(id));
                if self.pending.as_ref().is_some_and(|f| !identities.contains(&f.origin)) {
                    self.pending = None;
                }
                if let Some(identity) = self.latch.retain(&identities) {
                    info!(%identity, "Controller absent after session rebuild, latch released");
                    events.push(StatusEvent::ControllerReleased { identity });
                }
            }
            RouterEvent::Handover { from, to } => match self.latch.handover(&from, to.clone(), now) {
                Ok(()) => {
                    info!(%from, to = ?to, "Control handed over");
                    events.push(StatusEvent::ControllerReleased { identity: from });
                    if let Some(identity) = to {
                        events.push(StatusEvent::ControllerLatched { identity });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Handover refused");
                    metrics::counter!("teleop.router.handover_denied").increment(1);
                }
            },
            RouterEvent::Maneuver(request) => {
                let origin = request.origin.clone();
                if let Err(e) = self.start_maneuver(request, now) {
                    warn!(%origin, error = %e, "Maneuver rejected");
                    metrics::counter!("teleop.router.frames_rejected", "reason" => e.reason()).increment(1);
                }
            }
        }
        events
    }

    /// Autonomy maneuvers are accepted from the controller, or from anyone
    /// while nobody holds control. They do not take the latch.
    pub fn start_maneuver(&mut self, request: ManeuverRequest, now: Instant) -> Result<(), Rejection> {
        if !request.is_valid() {
            return Err(Rejection::InvalidManeuver);
        }
        if let Some(holder) = self.latch.holder() {
            if holder != request.origin {
                return Err(Rejection::NotController {
                    origin: request.origin,
                    holder: holder.to_string(),
                });
            }
        }

        let duration = Duration::try_from_secs_f32(request.distance_m / request.velocity_mps)
            .map_err(|_| Rejection::InvalidManeuver)?;
        let sign = match request.direction {
            ManeuverDirection::Forward => 1.0,
            ManeuverDirection::Backward => -1.0,
        };
        let speed = (request.velocity_mps / self.config.max_speed_mps).min(1.0);
        let max = self.config.max_throttle;
        let cmd = mix(sign * speed * max, request.steering, max);

        info!(
            origin = %request.origin,
            direction = ?request.direction,
            distance_m = request.distance_m,
            duration_ms = duration.as_millis() as u64,
            "Maneuver started"
        );
        self.pending = None;
        self.last_input = now;
        self.maneuver = Some(ActiveManeuver {
            origin: request.origin,
            cmd,
            ends_at: now + duration,
            drive_written: false,
        });
        Ok(())
    }

    /// Idle-release of the latch, if configured.
    pub fn housekeeping(&mut self, now: Instant) -> Vec<StatusEvent> {
        match self.latch.expire(now) {
            Some(identity) => {
                info!(%identity, "Controller idle, latch released");
                vec![StatusEvent::ControllerReleased { identity }]
            }
            None => Vec::new(),
        }
    }

    /// What to write on this cadence tick, if anything.
    ///
    /// Returns `None` while a write is outstanding or the link is backing off.
    /// Once a `WriteIntent` is returned the caller must report its outcome
    /// through `complete_write`.
    pub fn next_write(&mut self, now: Instant) -> Option<WriteIntent> {
        if self.in_flight || !self.health.may_attempt(now) {
            return None;
        }

        let quiet = now.saturating_duration_since(self.last_input) > self.config.watchdog();
        if quiet && self.pending.take().is_some() {
            debug!("Dropping pending frame older than the watchdog interval");
        }

        let intent = if let Some(frame) = self.pending.take() {
            WriteIntent {
                cmd:  mix_axes(&frame.axes, self.config.max_throttle),
                kind: WriteKind::Control { frame },
            }
        } else if let Some(m) = &self.maneuver {
            if now >= m.ends_at {
                WriteIntent { cmd: ActuatorCommand::STOP, kind: WriteKind::ManeuverStop }
            } else if !m.drive_written {
                WriteIntent { cmd: m.cmd, kind: WriteKind::ManeuverDrive }
            } else {
                return None;
            }
        } else if quiet && !self.zero_written {
            WriteIntent { cmd: ActuatorCommand::STOP, kind: WriteKind::Fallback }
        } else {
            return None;
        };

        self.in_flight = true;
        Some(intent)
    }

    pub fn complete_write(&mut self, intent: WriteIntent, succeeded: bool, now: Instant) -> Vec<StatusEvent> {
        self.in_flight = false;
        let mut events = Vec::new();

        if succeeded {
            if self.health.record_success(now) == HealthChange::Restored {
                info!(link = %self.link_id, "Actuator link restored");
                events.push(StatusEvent::LinkRestored { link: self.link_id.clone() });
            }
            match intent.kind {
                WriteKind::Fallback => {
                    warn!(link = %self.link_id, "No operator input, zero command written");
                    self.zero_written = true;
                }
                WriteKind::ManeuverDrive => {
                    if let Some(m) = &mut self.maneuver {
                        m.drive_written = true;
                    }
                }
                WriteKind::ManeuverStop => {
                    info!("Maneuver complete");
                    self.maneuver = None;
                    self.zero_written = true;
                    self.last_input = now;
                }
                WriteKind::Control { .. } => {}
            }
            return events;
        }

        if let HealthChange::WentDown { consecutive_failures } = self.health.record_failure(now) {
            warn!(link = %self.link_id, consecutive_failures, "Actuator link down");
            events.push(StatusEvent::LinkDown { link: self.link_id.clone(), consecutive_failures });
        }
        // Retry the failed frame unless something newer arrived meanwhile.
        if let WriteKind::Control { frame } = intent.kind {
            if self.pending.is_none() {
                self.pending = Some(frame);
            }
        }
        events
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Cadence loop
// ──────────────────────────────────────────────────────────────────────────────

type WriteFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub struct CommandRouter {
    core: RouterCore,
    link: Box<dyn ActuatorLink>,
}

impl CommandRouter {
    pub fn new(config: RouterConfig, link: Box<dyn ActuatorLink>) -> Self {
        let core = RouterCore::new(config, link.link_id(), Instant::now());
        Self { core, link }
    }

    /// Runs until `cancel` fires, then writes a final stop command.
    ///
    /// `frames` is the coalesced control-topic stream, `events` the reliable
    /// peer/handover/maneuver channel from the session bridge. Status events
    /// go to `status`; they are dropped when that queue is full.
    pub async fn run(
        mut self,
        mut frames: Pin<Box<dyn Stream<Item = ControlFrame> + Send>>,
        mut events: mpsc::Receiver<RouterEvent>,
        status: mpsc::Sender<StatusEvent>,
        cancel: CancellationToken,
    ) {
        let link_id = self.link.link_id().to_string();
        info!(link = %link_id, cadence_hz = self.core.config().cadence_hz, "Command router started");

        let mut ticker = tokio::time::interval(self.core.config().tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feedback = self.link.feedback_stream();
        let mut in_flight: Option<(WriteIntent, WriteFuture)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(frame) = frames.next() => {
                    let origin = frame.origin.clone();
                    match self.core.submit(frame, Instant::now()) {
                        Ok(out) => {
                            metrics::counter!("teleop.router.frames_accepted").increment(1);
                            report(&status, out);
                        }
                        Err(rejection) => {
                            debug!(%origin, reason = %rejection, "Control frame rejected");
                            metrics::counter!("teleop.router.frames_rejected", "reason" => rejection.reason()).increment(1);
                        }
                    }
                }

                Some(event) = events.recv() => {
                    let out = self.core.handle_event(event, Instant::now());
                    report(&status, out);
                }

                Some(fb) = feedback.next() => {
                    metrics::counter!("teleop.actuator.feedback").increment(1);
                    report(&status, vec![StatusEvent::Feedback(fb)]);
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    let out = self.core.housekeeping(now);
                    report(&status, out);
                    if in_flight.is_none() {
                        if let Some(intent) = self.core.next_write(now) {
                            let fut = self.link.write_command(intent.cmd);
                            in_flight = Some((intent, fut));
                        }
                    }
                }

                result = wait_write(&mut in_flight) => {
                    if let Some((intent, _)) = in_flight.take() {
                        let out = self.finish_write(intent, result);
                        report(&status, out);
                    }
                }
            }
        }

        let stop_timeout = Duration::from_millis(self.core.config().shutdown_stop_timeout_ms);
        if let Some((intent, fut)) = in_flight.take() {
            let result = tokio::time::timeout(stop_timeout, fut)
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("write timed out during shutdown")));
            self.finish_write(intent, result);
        }

        match tokio::time::timeout(stop_timeout, self.link.write_command(ActuatorCommand::STOP)).await {
            Ok(Ok(())) => info!(link = %link_id, "Stop command written, command router stopped"),
            Ok(Err(e)) => warn!(link = %link_id, error = %e, "Final stop command failed"),
            Err(_) => warn!(link = %link_id, "Final stop command timed out"),
        }
    }

    fn finish_write(&mut self, intent: WriteIntent, result: anyhow::Result<()>) -> Vec<StatusEvent> {
        match &result {
            Ok(()) => {
                metrics::counter!("teleop.actuator.writes").increment(1);
            }
            Err(e) => {
                debug!(link = %self.link.link_id(), error = %e, "Actuator write failed");
                metrics::counter!("teleop.actuator.write_failures").increment(1);
            }
        }
        let out = self.core.complete_write(intent, result.is_ok(), Instant::now());
        metrics::gauge!("teleop.actuator.link_down").set(if self.core.health().link_down { 1.0 } else { 0.0 });
        out
    }
}

async fn wait_write(slot: &mut Option<(WriteIntent, WriteFuture)>) -> anyhow::Result<()> {
    match slot {
        Some((_, fut)) => fut.await,
        None => std::future::pending().await,
    }
}

fn report(status: &mpsc::Sender<StatusEvent>, events: Vec<StatusEvent>) {
    for event in events {
        if status.try_send(event).is_err() {
            metrics::counter!("teleop.status.dropped").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use adapter_trait::{Axes, DataMessage, Feedback};
    use proptest::prelude::*;

    use super::*;

    fn axes(left_y: f32, right_x: f32) -> Axes {
        Axes { left_x: 0.0, left_y, right_x, right_y: 0.0 }
    }

    fn frame(origin: &str, seq: u64, left_y: f32) -> ControlFrame {
        ControlFrame::new(origin, seq, axes(left_y, 0.0))
    }

    fn new_core() -> (RouterCore, Instant) {
        let t0 = Instant::now();
        (RouterCore::new(RouterConfig::default(), "mock", t0), t0)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn axis_boundaries_are_inclusive() {
        let (mut core, t0) = new_core();
        assert!(core.submit(frame("a", 1, 1.0), t0).is_ok());
        assert!(core.submit(frame("a", 2, -1.0), t0).is_ok());
        assert_eq!(core.submit(frame("a", 3, 1.0001), t0), Err(Rejection::OutOfRange));
        // A rejected frame does not consume its sequence number.
        assert!(core.submit(frame("a", 3, 0.5), t0).is_ok());
    }

    #[test]
    fn clamp_policy_clamps() {
        let t0 = Instant::now();
        let config = RouterConfig { out_of_range: OutOfRangePolicy::Clamp, ..RouterConfig::default() };
        let mut core = RouterCore::new(config, "mock", t0);
        core.submit(frame("a", 1, 1.5), t0).unwrap();
        assert_eq!(core.pending().unwrap().axes.left_y, 1.0);

        let nan = ControlFrame::new("a", 2, axes(f32::NAN, 0.0));
        assert_eq!(core.submit(nan, t0), Err(Rejection::OutOfRange));
    }

    #[test]
    fn stale_and_duplicate_frames_are_rejected() {
        let (mut core, t0) = new_core();
        core.submit(frame("a", 10, -0.2), t0).unwrap();
        assert_eq!(core.submit(frame("a", 9, 0.8), t0), Err(Rejection::Stale { seq: 9, last: 10 }));
        assert_eq!(core.submit(frame("a", 10, 0.8), t0), Err(Rejection::Stale { seq: 10, last: 10 }));
        assert_eq!(core.pending().unwrap().axes.left_y, -0.2);
    }

    #[test]
    fn second_operator_is_denied_until_controller_leaves() {
        let (mut core, t0) = new_core();
        let out = core.submit(frame("a", 1, 0.1), t0).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], StatusEvent::ControllerLatched { identity } if identity == "a"));

        assert!(matches!(
            core.submit(frame("b", 1, 0.1), t0),
            Err(Rejection::NotController { holder, .. }) if holder == "a"
        ));

        let out = core.handle_event(RouterEvent::PeerLeft { identity: "a".into() }, t0);
        assert!(matches!(&out[0], StatusEvent::ControllerReleased { identity } if identity == "a"));
        assert!(core.pending().is_none());
        assert!(core.submit(frame("b", 1, 0.1), t0).is_ok());
        assert_eq!(core.controller(), Some("b"));
    }

    #[test]
    fn session_rebuild_keeps_sequence_of_present_peers() {
        let (mut core, t0) = new_core();
        core.submit(frame("a", 10, 0.1), t0).unwrap();
        core.handle_event(RouterEvent::PeersReset { identities: vec!["a".into()] }, t0);
        assert_eq!(core.controller(), Some("a"));
        assert_eq!(core.submit(frame("a", 9, 0.1), t0), Err(Rejection::Stale { seq: 9, last: 10 }));
        assert!(core.submit(frame("a", 11, 0.1), t0).is_ok());

        // Absent from the rebuilt peer list: latch and history are gone.
        core.handle_event(RouterEvent::PeersReset { identities: vec!["b".into()] }, t0);
        assert_eq!(core.controller(), None);
        assert!(core.submit(frame("a", 1, 0.1), t0).is_ok());
    }

    #[test]
    fn handover_moves_control() {
        let (mut core, t0) = new_core();
        core.submit(frame("a", 1, 0.1), t0).unwrap();
        let out = core.handle_event(RouterEvent::Handover { from: "b".into(), to: Some("b".into()) }, t0);
        assert!(out.is_empty());
        assert_eq!(core.controller(), Some("a"));

        let out = core.handle_event(RouterEvent::Handover { from: "a".into(), to: Some("b".into()) }, t0);
        assert_eq!(out.len(), 2);
        assert!(core.submit(frame("b", 1, 0.1), t0).is_ok());
    }

    #[test]
    fn failed_write_is_retried_unless_superseded() {
        let (mut core, t0) = new_core();
        core.submit(frame("a", 1, 0.2), t0).unwrap();
        let intent = core.next_write(t0).unwrap();
        assert!(core.next_write(t0).is_none(), "one write at a time");
        core.complete_write(intent, false, t0);

        assert!(core.next_write(t0).is_none(), "backing off");
        let retry = core.next_write(t0 + ms(50)).unwrap();
        assert!(matches!(&retry.kind, WriteKind::Control { frame } if frame.seq == 1));

        core.submit(frame("a", 2, 0.4), t0 + ms(60)).unwrap();
        core.complete_write(retry, false, t0 + ms(60));
        assert_eq!(core.pending().unwrap().seq, 2);
    }

    #[test]
    fn watchdog_writes_one_zero_and_retries_it_on_failure() {
        let (mut core, t0) = new_core();
        core.submit(frame("a", 1, 0.2), t0).unwrap();
        let first = core.next_write(t0).unwrap();
        core.complete_write(first, true, t0);

        assert!(core.next_write(t0 + ms(300)).is_none());
        let zero = core.next_write(t0 + ms(301)).unwrap();
        assert_eq!(zero.kind, WriteKind::Fallback);
        assert!(zero.cmd.is_stop());
        core.complete_write(zero, false, t0 + ms(301));

        let again = core.next_write(t0 + ms(400)).unwrap();
        assert_eq!(again.kind, WriteKind::Fallback);
        core.complete_write(again, true, t0 + ms(400));

        assert!(core.next_write(t0 + ms(5_000)).is_none());
    }

    #[test]
    fn pending_frame_older_than_watchdog_becomes_a_stop() {
        let (mut core, t0) = new_core();
        core.submit(frame("a", 1, 0.9), t0).unwrap();
        let intent = core.next_write(t0 + ms(400)).unwrap();
        assert_eq!(intent.kind, WriteKind::Fallback);
    }

    #[test]
    fn link_goes_down_after_threshold_and_recovers() {
        let (mut core, t0) = new_core();
        let mut now = t0;
        let mut events = Vec::new();
        for seq in 1..=3 {
            core.submit(frame("a", seq, 0.2), now).unwrap();
            let intent = core.next_write(now).unwrap();
            events.extend(core.complete_write(intent, false, now));
            now += ms(1_000);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StatusEvent::LinkDown { consecutive_failures: 3, .. }));

        core.submit(frame("a", 4, 0.2), now).unwrap();
        let intent = core.next_write(now).unwrap();
        let out = core.complete_write(intent, true, now);
        assert!(matches!(&out[0], StatusEvent::LinkRestored { link } if link == "mock"));
    }

    #[test]
    fn maneuver_drives_then_stops() {
        let (mut core, t0) = new_core();
        let req = ManeuverRequest {
            origin:       "autonomy".into(),
            direction:    ManeuverDirection::Backward,
            distance_m:   1.0,
            velocity_mps: 0.5,
            steering:     0.0,
        };
        core.start_maneuver(req, t0).unwrap();

        let drive = core.next_write(t0).unwrap();
        assert_eq!(drive.kind, WriteKind::ManeuverDrive);
        assert_eq!((drive.cmd.left, drive.cmd.right), (-0.25, -0.25));
        core.complete_write(drive, true, t0);

        // Watchdog is suspended while the maneuver runs.
        assert!(core.next_write(t0 + ms(1_500)).is_none());

        let stop = core.next_write(t0 + ms(2_000)).unwrap();
        assert_eq!(stop.kind, WriteKind::ManeuverStop);
        core.complete_write(stop, true, t0 + ms(2_000));
        assert!(!core.maneuver_active());
        assert!(core.next_write(t0 + ms(9_000)).is_none());
    }

    #[test]
    fn maneuver_from_non_controller_is_refused() {
        let (mut core, t0) = new_core();
        core.submit(frame("a", 1, 0.2), t0).unwrap();
        let req = ManeuverRequest {
            origin:       "b".into(),
            direction:    ManeuverDirection::Forward,
            distance_m:   1.0,
            velocity_mps: 1.0,
            steering:     0.0,
        };
        assert!(matches!(core.start_maneuver(req, t0), Err(Rejection::NotController { .. })));
        assert!(!core.maneuver_active());
    }

    proptest! {
        #[test]
        fn latest_accepted_frame_wins(values in prop::collection::vec(-1.0f32..=1.0, 1..40)) {
            let (mut core, t0) = new_core();
            for (i, v) in values.iter().enumerate() {
                core.submit(frame("a", i as u64 + 1, *v), t0).unwrap();
            }
            let pending = core.pending().unwrap();
            prop_assert_eq!(pending.seq, values.len() as u64);
            prop_assert_eq!(pending.axes.left_y, *values.last().unwrap());
        }

        #[test]
        fn stale_frames_never_replace_pending(seqs in prop::collection::vec(0u64..100, 1..40)) {
            let (mut core, t0) = new_core();
            let mut best: Option<u64> = None;
            for seq in seqs {
                let accepted = core.submit(frame("a", seq, 0.0), t0).is_ok();
                prop_assert_eq!(accepted, best.map_or(true, |b| seq > b));
                if accepted {
                    best = Some(seq);
                }
            }
            prop_assert_eq!(core.pending().map(|f| f.seq), best);
        }
    }

    // ── cadence loop ────────────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct MockLink {
        writes: Arc<Mutex<Vec<ActuatorCommand>>>,
        fail:   Arc<AtomicBool>,
    }

    impl ActuatorLink for MockLink {
        fn write_command(&self, cmd: ActuatorCommand) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            let writes = self.writes.clone();
            let fail = self.fail.load(Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    anyhow::bail!("device unplugged");
                }
                writes.lock().unwrap().push(cmd);
                Ok(())
            })
        }

        fn feedback_stream(&self) -> Pin<Box<dyn Stream<Item = Feedback> + Send>> {
            Box::pin(futures::stream::empty())
        }

        fn link_id(&self) -> &str {
            "mock"
        }
    }

    struct Harness {
        link:   MockLink,
        frames: mpsc::Sender<ControlFrame>,
        events: mpsc::Sender<RouterEvent>,
        status: mpsc::Receiver<StatusEvent>,
        cancel: CancellationToken,
        task:   tokio::task::JoinHandle<()>,
    }

    fn spawn_router() -> Harness {
        let link = MockLink::default();
        let (frames_tx, mut frames_rx) = mpsc::channel::<ControlFrame>(16);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let frames = Box::pin(async_stream::stream! {
            while let Some(f) = frames_rx.recv().await {
                yield f;
            }
        });
        let router = CommandRouter::new(RouterConfig::default(), Box::new(link.clone()));
        let task = tokio::spawn(router.run(frames, events_rx, status_tx, cancel.clone()));

        Harness { link, frames: frames_tx, events: events_tx, status: status_rx, cancel, task }
    }

    fn gamepad(origin: &str, raw: &str) -> ControlFrame {
        let msg = DataMessage::parse(raw.as_bytes()).unwrap();
        ControlFrame::from_message(origin, &msg).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_frame_is_ignored_and_mixed_command_written() {
        let h = spawn_router();
        h.frames.send(gamepad("op",
            r#"{"type":"gamepad","data":{"left_x":0.5,"left_y":-0.2,"right_x":0.0,"right_y":0.1},"timestamp":10}"#,
        )).await.unwrap();
        h.frames.send(gamepad("op",
            r#"{"type":"gamepad","data":{"left_x":0.0,"left_y":0.8,"right_x":0.0,"right_y":0.0},"timestamp":9}"#,
        )).await.unwrap();

        tokio::time::sleep(ms(120)).await;
        {
            let writes = h.link.writes.lock().unwrap();
            assert_eq!(writes.len(), 1);
            assert_eq!((writes[0].left, writes[0].right), (-0.1, -0.1));
        }

        // Input went quiet: exactly one zero command follows.
        tokio::time::sleep(ms(2_000)).await;
        {
            let writes = h.link.writes.lock().unwrap();
            assert_eq!(writes.len(), 2);
            assert!(writes[1].is_stop());
        }

        h.cancel.cancel();
        h.task.await.unwrap();
        let writes = h.link.writes.lock().unwrap();
        assert_eq!(writes.len(), 3, "shutdown writes a final stop");
        assert!(writes[2].is_stop());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_startup_gets_a_single_zero() {
        let h = spawn_router();
        tokio::time::sleep(ms(3_000)).await;
        let writes = h.link.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![ActuatorCommand::STOP]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_link_is_reported_down_then_restored() {
        let mut h = spawn_router();
        h.link.fail.store(true, Ordering::SeqCst);
        h.frames.send(frame("op", 1, 0.4)).await.unwrap();

        let latched = h.status.recv().await.unwrap();
        assert!(matches!(latched, StatusEvent::ControllerLatched { .. }));
        let down = tokio::time::timeout(ms(5_000), h.status.recv()).await.unwrap().unwrap();
        assert!(matches!(down, StatusEvent::LinkDown { consecutive_failures: 3, .. }));

        h.link.fail.store(false, Ordering::SeqCst);
        let restored = tokio::time::timeout(ms(5_000), h.status.recv()).await.unwrap().unwrap();
        assert!(matches!(restored, StatusEvent::LinkRestored { .. }));
        assert!(!h.link.writes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn maneuver_runs_for_distance_over_velocity() {
        let h = spawn_router();
        h.events.send(RouterEvent::Maneuver(ManeuverRequest {
            origin:       "autonomy".into(),
            direction:    ManeuverDirection::Forward,
            distance_m:   0.5,
            velocity_mps: 0.5,
            steering:     0.0,
        })).await.unwrap();

        tokio::time::sleep(ms(600)).await;
        assert_eq!(h.link.writes.lock().unwrap().len(), 1, "no watchdog zero mid-maneuver");

        tokio::time::sleep(ms(1_000)).await;
        let writes = h.link.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 2);
        assert_eq!((writes[0].left, writes[0].right), (0.25, 0.25));
        assert!(writes[1].is_stop());
    }
}
