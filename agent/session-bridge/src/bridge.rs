//! Session state machine and the handles other components hold on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adapter_trait::{
    Backoff, ControlFrame, DataMessage, ManeuverRequest, MediaSample, RouterEvent, SessionState,
    SinkError, StatusEvent, TrackSink,
};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::inbound::FrameMux;
use crate::session::{Session, TrackEvent, TrackHandle};
use crate::transport::{DisconnectReason, JoinError, RoomConnection, RoomEvent, RoomRequest, RoomTransport};
use crate::BridgeConfig;

const ROUTER_EVENT_CAPACITY: usize = 32;
const STATUS_CAPACITY: usize = 64;
const TRACK_EVENT_CAPACITY: usize = 64;

/// Terminal session failures. Every variant ends the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("initial connect failed: {0}")]
    InitialConnect(JoinError),
    #[error("session ended: {0}")]
    Disconnected(DisconnectReason),
    #[error("reconnect rejected: {0}")]
    ReconnectRejected(JoinError),
    #[error("gave up after {attempts} reconnect attempts, last error: {last}")]
    ReconnectExhausted { attempts: u32, last: JoinError },
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

struct Shared {
    /// Request channel of the current connection; `None` unless Connected.
    outbound:       Mutex<Option<mpsc::Sender<RoomRequest>>>,
    muxes:          DashMap<String, Arc<FrameMux>>,
    inbound_depth:  usize,
    tracks:         broadcast::Sender<TrackEvent>,
    local_status:   broadcast::Sender<StatusEvent>,
    state:          watch::Sender<SessionState>,
    reconnect:      Notify,
    /// The uplink wants its track published (cleared while the source is down).
    publish_wanted: AtomicBool,
    published:      AtomicBool,
    stopped:        AtomicBool,
    status_topic:   String,
    track_name:     String,
    track_mime:     String,
}

impl Shared {
    fn outbound(&self) -> Option<mpsc::Sender<RoomRequest>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_outbound(&self, tx: Option<mpsc::Sender<RoomRequest>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    /// Queue a signalling request on the live connection. False when not connected or full.
    fn request(&self, req: RoomRequest) -> bool {
        match self.outbound() {
            Some(tx) => tx.try_send(req).is_ok(),
            None => false,
        }
    }

    fn emit_status(&self, event: StatusEvent) {
        let _ = self.local_status.send(event.clone());
        if let Some(tx) = self.outbound() {
            let req = RoomRequest::Data {
                topic:    self.status_topic.clone(),
                payload:  event.to_json(),
                reliable: true,
            };
            if tx.try_send(req).is_err() {
                metrics::counter!("teleop.status.dropped").increment(1);
            }
        }
    }

    /// Publish the uplink track if it is wanted and not yet published in this session.
    fn publish_track(&self) -> bool {
        if !self.publish_wanted.load(Ordering::SeqCst) || self.published.swap(true, Ordering::SeqCst) {
            return false;
        }
        let req = RoomRequest::PublishTrack { name: self.track_name.clone(), mime: self.track_mime.clone() };
        if !self.request(req) {
            self.published.store(false, Ordering::SeqCst);
            return false;
        }
        info!(track = %self.track_name, "Publishing uplink track");
        true
    }

    fn mux(&self, topic: &str) -> Arc<FrameMux> {
        let entry = self
            .muxes
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(FrameMux::new(topic, self.inbound_depth)));
        Arc::clone(entry.value())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable view of the bridge for consumers of inbound data and producers of status.
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl BridgeHandle {
    /// Control frames received on `topic`, per-origin bounded queues.
    /// One consumer per topic.
    pub fn on_data_message(&self, topic: &str) -> Pin<Box<dyn Stream<Item = ControlFrame> + Send>> {
        self.shared.mux(topic).stream()
    }

    /// Track events from the moment of the call on. `Available`/`Removed` are
    /// filtered by `predicate`; `Invalidated` is always delivered.
    pub fn on_track_available<F>(&self, predicate: F) -> Pin<Box<dyn Stream<Item = TrackEvent> + Send>>
    where
        F: Fn(&TrackHandle) -> bool + Send + 'static,
    {
        let mut rx = self.shared.tracks.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        let pass = match &ev {
                            TrackEvent::Available(h) | TrackEvent::Removed(h) => predicate(h),
                            TrackEvent::Invalidated { .. } => true,
                        };
                        if pass {
                            yield ev;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Track event consumer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Send a status event to the room (when connected) and to local observers.
    pub fn send_status(&self, event: StatusEvent) {
        self.shared.emit_status(event);
    }

    /// Drop the current session (or in-flight attempt) and join again.
    pub fn request_reconnect(&self) {
        self.shared.reconnect.notify_one();
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Every status event the bridge emits or relays, including the terminal one.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.local_status.subscribe()
    }
}

/// The uplink relay's view of the outbound video track.
pub struct TrackPublisher {
    shared: Arc<Shared>,
}

impl TrackSink for TrackPublisher {
    fn send(&self, sample: MediaSample) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            if self.shared.stopped.load(Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }
            if !self.shared.published.load(Ordering::SeqCst) {
                return Err(SinkError::NotReady);
            }
            let tx = self.shared.outbound().ok_or(SinkError::NotReady)?;
            // Waits while the transport is congested; the uplink ring keeps only the newest unit meanwhile.
            tx.send(RoomRequest::Sample(sample)).await.map_err(|_| SinkError::NotReady)
        })
    }

    fn open_track(&self) {
        self.shared.publish_wanted.store(true, Ordering::SeqCst);
        self.shared.publish_track();
        self.shared.emit_status(StatusEvent::UplinkRestored);
    }

    fn close_track(&self) {
        self.shared.publish_wanted.store(false, Ordering::SeqCst);
        if self.shared.published.swap(false, Ordering::SeqCst) {
            self.shared.request(RoomRequest::UnpublishTrack { name: self.shared.track_name.clone() });
            info!(track = %self.shared.track_name, "Uplink track unpublished");
        }
        self.shared.emit_status(StatusEvent::UplinkDown);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────────────────────────

enum JoinAttempt {
    Joined(RoomConnection),
    Failed(JoinError),
    Cancelled,
    /// A reconnect request arrived while the attempt was in flight.
    Superseded,
}

enum ServeExit {
    Cancelled,
    ReconnectRequested,
    Disconnected(DisconnectReason),
}

pub struct SessionBridge {
    config:    BridgeConfig,
    transport: Arc<dyn RoomTransport>,
    shared:    Arc<Shared>,
    status_tx: mpsc::Sender<StatusEvent>,
    status_rx: mpsc::Receiver<StatusEvent>,
    router_tx: mpsc::Sender<RouterEvent>,
    router_rx: Option<mpsc::Receiver<RouterEvent>>,
    epoch:     u64,
}

impl SessionBridge {
    pub fn new(config: BridgeConfig, transport: Arc<dyn RoomTransport>) -> Self {
        let (status_tx, status_rx) = mpsc::channel(STATUS_CAPACITY);
        let (router_tx, router_rx) = mpsc::channel(ROUTER_EVENT_CAPACITY);
        let (tracks, _) = broadcast::channel(TRACK_EVENT_CAPACITY);
        let (local_status, _) = broadcast::channel(STATUS_CAPACITY);
        let (state, _) = watch::channel(SessionState::Disconnected);

        let shared = Arc::new(Shared {
            outbound:       Mutex::new(None),
            muxes:          DashMap::new(),
            inbound_depth:  config.inbound_queue_depth,
            tracks,
            local_status,
            state,
            reconnect:      Notify::new(),
            publish_wanted: AtomicBool::new(true),
            published:      AtomicBool::new(false),
            stopped:        AtomicBool::new(false),
            status_topic:   config.status_topic.clone(),
            track_name:     config.track_name.clone(),
            track_mime:     config.track_mime.clone(),
        });
        // The control topic is always recognized, even before anyone consumes it.
        shared.mux(&config.control_topic);

        Self {
            config,
            transport,
            shared,
            status_tx,
            status_rx,
            router_tx,
            router_rx: Some(router_rx),
            epoch: 0,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn track_sink(&self) -> Arc<dyn TrackSink> {
        Arc::new(TrackPublisher { shared: Arc::clone(&self.shared) })
    }

    /// Bounded status input for the router; events are dropped when full.
    pub fn status_sender(&self) -> mpsc::Sender<StatusEvent> {
        self.status_tx.clone()
    }

    /// Peer / handover / maneuver events for the command router. Available once.
    pub fn take_router_events(&mut self) -> Option<mpsc::Receiver<RouterEvent>> {
        self.router_rx.take()
    }

    /// Drive the session until cancelled (`Ok`) or a terminal failure (`Err`).
    /// A terminal failure emits exactly one `SessionFatal` status.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BridgeError> {
        info!(transport = %self.transport.transport_id(), room = %self.config.room, "Session bridge starting");
        let result = self.drive(&cancel).await;

        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.set_outbound(None);
        self.set_state(SessionState::Disconnected);

        if let Err(e) = &result {
            error!(error = %e, "Session bridge failed");
            metrics::counter!("teleop.session.fatal").increment(1);
            let _ = self.shared.local_status.send(StatusEvent::SessionFatal { reason: e.to_string() });
        } else {
            info!("Session bridge stopped");
        }
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        self.set_state(SessionState::Connecting);
        let Some(mut conn) = self.initial_join(cancel).await? else {
            return Ok(());
        };

        loop {
            self.epoch += 1;
            let mut session = self.establish(&conn);
            let exit = self.serve(&mut session, &mut conn, cancel).await;
            self.teardown(&session);
            let _ = conn.outbound.try_send(RoomRequest::Close);
            drop(conn);

            match exit {
                ServeExit::Cancelled => return Ok(()),
                ServeExit::Disconnected(reason) if !reason.is_recoverable() => {
                    return Err(BridgeError::Disconnected(reason));
                }
                ServeExit::Disconnected(reason) => warn!(%reason, epoch = self.epoch, "Session lost"),
                ServeExit::ReconnectRequested => info!(epoch = self.epoch, "Reconnect requested"),
            }

            self.set_state(SessionState::Reconnecting);
            conn = match self.reconnect(cancel).await? {
                Some(c) => c,
                None => return Ok(()),
            };
        }
    }

    async fn attempt_join(&self, cancel: &CancellationToken) -> JoinAttempt {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connect = tokio::time::timeout(timeout, self.transport.connect(self.config.join_params()));
        // Losing a select branch drops the connect future and whatever it opened.
        tokio::select! {
            _ = cancel.cancelled() => JoinAttempt::Cancelled,
            _ = self.shared.reconnect.notified() => JoinAttempt::Superseded,
            r = connect => match r {
                Ok(Ok(conn)) => JoinAttempt::Joined(conn),
                Ok(Err(e)) => JoinAttempt::Failed(e),
                Err(_) => JoinAttempt::Failed(JoinError::Timeout),
            },
        }
    }

    async fn initial_join(&self, cancel: &CancellationToken) -> Result<Option<RoomConnection>, BridgeError> {
        loop {
            match self.attempt_join(cancel).await {
                JoinAttempt::Joined(conn) => return Ok(Some(conn)),
                JoinAttempt::Cancelled => return Ok(None),
                JoinAttempt::Superseded => info!("Connect attempt superseded, starting over"),
                JoinAttempt::Failed(e) => return Err(BridgeError::InitialConnect(e)),
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<Option<RoomConnection>, BridgeError> {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.reconnect_base_ms),
            Duration::from_millis(self.config.reconnect_max_ms),
        )
        .with_jitter();
        let mut failures = 0;
        let mut last = JoinError::Network("no attempt made".into());

        while failures < self.config.reconnect_attempts {
            let delay = backoff.next_delay();
            info!(attempt = failures + 1, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.attempt_join(cancel).await {
                JoinAttempt::Joined(conn) => {
                    metrics::counter!("teleop.session.reconnects").increment(1);
                    info!(attempt = failures + 1, "Reconnected");
                    return Ok(Some(conn));
                }
                JoinAttempt::Cancelled => return Ok(None),
                JoinAttempt::Superseded => debug!("Reconnect attempt superseded"),
                JoinAttempt::Failed(e @ JoinError::Unauthorized(_)) => {
                    return Err(BridgeError::ReconnectRejected(e));
                }
                JoinAttempt::Failed(e) => {
                    failures += 1;
                    metrics::counter!("teleop.session.reconnect_failures").increment(1);
                    warn!(attempt = failures, error = %e, "Reconnect attempt failed");
                    last = e;
                }
            }
        }
        Err(BridgeError::ReconnectExhausted { attempts: failures, last })
    }

    /// Build the session for a fresh connection and announce it.
    fn establish(&self, conn: &RoomConnection) -> Session {
        let mut session = Session::new(self.epoch, conn.local_identity.clone(), conn.peers.clone());
        self.shared.set_outbound(Some(conn.outbound.clone()));
        self.set_state(SessionState::Connected);
        metrics::gauge!("teleop.session.connected").set(1.0);
        info!(epoch = self.epoch, identity = %session.local_identity, peers = ?session.identities(), "Session established");

        self.shared.publish_track();

        let identities = session.identities();
        for identity in &identities {
            for handle in self.matching_tracks(&session, identity, None) {
                self.subscribe(&mut session, handle);
            }
        }
        self.router_event(RouterEvent::PeersReset { identities });
        session
    }

    fn teardown(&self, session: &Session) {
        self.shared.set_outbound(None);
        self.shared.published.store(false, Ordering::SeqCst);
        for mux in self.shared.muxes.iter() {
            mux.value().clear();
        }
        let _ = self.shared.tracks.send(TrackEvent::Invalidated { epoch: session.epoch });
        metrics::gauge!("teleop.session.connected").set(0.0);
        debug!(epoch = session.epoch, "Session torn down");
    }

    async fn serve(
        &mut self,
        session: &mut Session,
        conn:    &mut RoomConnection,
        cancel:  &CancellationToken,
    ) -> ServeExit {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ServeExit::Cancelled,
                _ = self.shared.reconnect.notified() => return ServeExit::ReconnectRequested,
                ev = conn.events.next() => match ev {
                    None => return ServeExit::Disconnected(DisconnectReason::StreamEnded),
                    Some(RoomEvent::Disconnected(reason)) => return ServeExit::Disconnected(reason),
                    Some(ev) => self.handle_event(session, ev),
                },
                Some(status) = self.status_rx.recv() => self.shared.emit_status(status),
            }
        }
    }

    fn handle_event(&self, session: &mut Session, ev: RoomEvent) {
        match ev {
            RoomEvent::PeerJoined(info) => {
                let identity = info.identity.clone();
                if session.peer_joined(info) {
                    info!(%identity, "Peer joined");
                    for handle in self.matching_tracks(session, &identity, None) {
                        self.subscribe(session, handle);
                    }
                }
            }
            RoomEvent::PeerLeft { identity } => {
                let handles = self.matching_tracks(session, &identity, None);
                if session.peer_left(&identity).is_some() {
                    info!(%identity, "Peer left");
                    for handle in handles {
                        let _ = self.shared.tracks.send(TrackEvent::Removed(handle));
                    }
                    for mux in self.shared.muxes.iter() {
                        mux.value().remove_origin(&identity);
                    }
                    self.router_event(RouterEvent::PeerLeft { identity });
                }
            }
            RoomEvent::TrackPublished { identity, track } => {
                let sid = track.sid.clone();
                if session.track_published(&identity, track) {
                    for handle in self.matching_tracks(session, &identity, Some(&sid)) {
                        self.subscribe(session, handle);
                    }
                }
            }
            RoomEvent::TrackUnpublished { identity, sid } => {
                let was_subscribed = session.is_subscribed(&sid);
                if let Some(handle) = session.track_unpublished(&identity, &sid) {
                    if was_subscribed {
                        let _ = self.shared.tracks.send(TrackEvent::Removed(handle));
                    }
                }
            }
            RoomEvent::Data { from, topic, payload } => self.handle_data(&from, &topic, &payload),
            RoomEvent::Disconnected(_) => {}
        }
    }

    fn handle_data(&self, from: &str, topic: &str, payload: &[u8]) {
        let is_command = topic == self.config.command_topic;
        let mux = self.shared.muxes.get(topic).map(|m| Arc::clone(m.value()));
        if !is_command && mux.is_none() {
            trace!(%from, %topic, "Dropping data message on unrecognized topic");
            return;
        }

        let msg = match DataMessage::parse(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%from, %topic, error = %e, "Malformed data message");
                input_invalid(topic, "malformed");
                return;
            }
        };

        match (&msg, mux) {
            (DataMessage::Forward { .. } | DataMessage::Backward { .. }, _) if is_command => {
                if let Some(req) = ManeuverRequest::from_message(from, &msg) {
                    self.router_event(RouterEvent::Maneuver(req));
                }
            }
            (DataMessage::Gamepad { .. }, Some(mux)) => {
                if let Some(frame) = ControlFrame::from_message(from, &msg) {
                    mux.push(frame);
                }
            }
            (DataMessage::Handover { to }, Some(_)) => {
                self.router_event(RouterEvent::Handover { from: from.to_string(), to: to.clone() });
            }
            _ => input_invalid(topic, "unexpected_type"),
        }
    }

    fn matching_tracks(&self, session: &Session, identity: &str, sid: Option<&str>) -> Vec<TrackHandle> {
        let Some(peer) = session.peer(identity) else {
            return Vec::new();
        };
        if !self.config.subscribe_roles.iter().any(|r| peer.role.matches(r)) {
            return Vec::new();
        }
        peer.tracks
            .values()
            .filter(|t| sid.map_or(true, |s| s == t.sid))
            .map(|t| session.handle(peer, t))
            .collect()
    }

    fn subscribe(&self, session: &mut Session, handle: TrackHandle) {
        if session.mark_subscribed(&handle.sid) {
            self.shared.request(RoomRequest::Subscribe { sid: handle.sid.clone() });
            debug!(identity = %handle.identity, sid = %handle.sid, "Subscribed to remote track");
            let _ = self.shared.tracks.send(TrackEvent::Available(handle));
        }
    }

    fn router_event(&self, event: RouterEvent) {
        match self.router_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                metrics::counter!("teleop.router_events.dropped").increment(1);
                warn!(event = ?ev, "Router event queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => trace!("Router gone, event discarded"),
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Session state");
            self.shared.emit_status(StatusEvent::Session { state });
        }
    }
}

fn input_invalid(topic: &str, reason: &'static str) {
    metrics::counter!("teleop.input.invalid", "topic" => topic.to_string(), "reason" => reason).increment(1);
}
