//! Read / forward tasks and their supervision.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adapter_trait::{now_us, Backoff, MediaSample, SinkError, TrackSink};
use ring_buffer::{RingReceiver, RingSender};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::framer::AccessUnitFramer;
use crate::{LocalEndpoint, UplinkConfig};

/// Counters shared by the read and forward tasks.
#[derive(Debug, Default)]
pub struct UplinkStats {
    bytes_read:     AtomicU64,
    access_units:   AtomicU64,
    /// Overwritten in the ring before the sink took them.
    dropped:        AtomicU64,
    forwarded:      AtomicU64,
    /// Rejected by the sink (`SinkError::NotReady`).
    not_ready:      AtomicU64,
    endpoint_up:    AtomicBool,
    track_torn_down: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UplinkStatsSnapshot {
    pub bytes_read:      u64,
    pub access_units:    u64,
    pub dropped:         u64,
    pub forwarded:       u64,
    pub not_ready:       u64,
    pub endpoint_up:     bool,
    pub track_torn_down: bool,
}

impl UplinkStats {
    pub fn snapshot(&self) -> UplinkStatsSnapshot {
        UplinkStatsSnapshot {
            bytes_read:      self.bytes_read.load(Ordering::Relaxed),
            access_units:    self.access_units.load(Ordering::Relaxed),
            dropped:         self.dropped.load(Ordering::Relaxed),
            forwarded:       self.forwarded.load(Ordering::Relaxed),
            not_ready:       self.not_ready.load(Ordering::Relaxed),
            endpoint_up:     self.endpoint_up.load(Ordering::Relaxed),
            track_torn_down: self.track_torn_down.load(Ordering::Relaxed),
        }
    }
}

pub struct UplinkRelay;

impl UplinkRelay {
    /// Spawn the read and forward tasks. Both stop when `stop()` is called on
    /// the handle or the parent token is cancelled.
    pub fn start(
        config: UplinkConfig,
        sink:   Arc<dyn TrackSink>,
        parent: &CancellationToken,
    ) -> UplinkHandle {
        let cancel = parent.child_token();
        let stats = Arc::new(UplinkStats::default());
        // One pending access unit; newer units overwrite it while the sink is stalled.
        let (tx, rx) = ring_buffer::channel::<MediaSample>(1);

        info!(
            endpoint = ?config.endpoint,
            codec    = ?config.codec,
            "Uplink relay starting"
        );

        let reader = ReadLoop {
            framer:   AccessUnitFramer::new(config.codec, config.max_access_unit_bytes),
            backoff:  Backoff::new(
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_max_ms),
            ),
            config,
            tx,
            sink:     Arc::clone(&sink),
            stats:    Arc::clone(&stats),
            failures: 0,
            listener: None,
        };

        let read_task = tokio::spawn(reader.run(cancel.clone()));
        let forward_task = tokio::spawn(forward_loop(rx, sink, Arc::clone(&stats), cancel.clone()));

        UplinkHandle { cancel, stats, tasks: vec![read_task, forward_task] }
    }
}

pub struct UplinkHandle {
    cancel: CancellationToken,
    stats:  Arc<UplinkStats>,
    tasks:  Vec<JoinHandle<()>>,
}

impl UplinkHandle {
    pub fn stats(&self) -> UplinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop both tasks and wait for them to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Uplink relay stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read side
// ─────────────────────────────────────────────────────────────────────────────

struct ReadLoop {
    config:   UplinkConfig,
    framer:   AccessUnitFramer,
    backoff:  Backoff,
    tx:       RingSender<MediaSample>,
    sink:     Arc<dyn TrackSink>,
    stats:    Arc<UplinkStats>,
    /// Consecutive failed endpoint sessions (refused, reset, closed before data).
    failures: u32,
    /// Bound lazily in listen mode and kept across capture restarts.
    listener: Option<TcpListener>,
}

impl ReadLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.config.read_buffer_bytes.max(4096)];

        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.open_endpoint() => r,
            };

            let outcome = match opened {
                Ok(mut stream) => {
                    debug!(endpoint = ?self.config.endpoint, "Capture endpoint opened");
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.pump(&mut stream, &mut buf) => r,
                    };
                    self.stats.endpoint_up.store(false, Ordering::Relaxed);
                    outcome
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => info!("Capture endpoint closed the stream"),
                Err(e) => warn!(error = %e, "Capture endpoint failed"),
            }
            self.on_failure();

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, failures = self.failures, "Retrying capture endpoint");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Uplink read task exiting");
    }

    async fn open_endpoint(&mut self) -> io::Result<TcpStream> {
        let stream = match self.config.endpoint {
            LocalEndpoint::Connect { addr } => TcpStream::connect(addr).await?,
            LocalEndpoint::Listen { addr } => {
                if self.listener.is_none() {
                    self.listener = Some(TcpListener::bind(addr).await?);
                    info!(%addr, "Waiting for capture process");
                }
                match &self.listener {
                    Some(listener) => listener.accept().await?.0,
                    None => return Err(io::Error::new(io::ErrorKind::NotConnected, "listener missing")),
                }
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Read until EOF or error. `Ok(())` means the capture side closed cleanly.
    async fn pump(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<()> {
        loop {
            let n = stream.read(buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.on_data(n);

            for unit in self.framer.push(&buf[..n]) {
                self.stats.access_units.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("teleop.uplink.access_units").increment(1);

                let sample = MediaSample { data: unit.data, keyframe: unit.keyframe, pts_us: now_us() };
                if self.tx.push(sample) {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("teleop.uplink.access_units_dropped").increment(1);
                }
            }
        }
    }

    fn on_data(&mut self, n: usize) {
        self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        metrics::counter!("teleop.uplink.bytes_read").increment(n as u64);

        if self.stats.endpoint_up.swap(true, Ordering::Relaxed) {
            return;
        }
        // First bytes of a new endpoint session.
        self.failures = 0;
        self.backoff.reset();
        if self.stats.track_torn_down.swap(false, Ordering::Relaxed) {
            info!("Capture data resumed, republishing outbound track");
            self.sink.open_track();
        }
    }

    fn on_failure(&mut self) {
        // A partial access unit from a dead session must never be forwarded.
        self.framer.reset();
        self.failures += 1;
        metrics::counter!("teleop.uplink.endpoint_failures").increment(1);

        if self.failures >= self.config.max_consecutive_failures
            && !self.stats.track_torn_down.swap(true, Ordering::Relaxed)
        {
            warn!(
                failures = self.failures,
                "Capture endpoint unavailable, tearing down outbound track"
            );
            self.sink.close_track();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Forward side
// ─────────────────────────────────────────────────────────────────────────────

async fn forward_loop(
    mut rx: RingReceiver<MediaSample>,
    sink:   Arc<dyn TrackSink>,
    stats:  Arc<UplinkStats>,
    cancel: CancellationToken,
) {
    loop {
        let sample = tokio::select! {
            _ = cancel.cancelled() => break,
            s = rx.recv() => match s {
                Some(s) => s,
                None => break,
            },
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            r = sink.send(sample) => r,
        };
        match sent {
            Ok(()) => {
                stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(SinkError::NotReady) => {
                stats.not_ready.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("teleop.uplink.access_units_not_ready").increment(1);
            }
            Err(SinkError::Closed) => {
                info!("Outbound track closed, uplink forwarder exiting");
                break;
            }
        }
    }
    debug!("Uplink forward task exiting");
}
