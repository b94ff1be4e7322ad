//! Serial line actuator adapter.
//!
//! Drives differential-drive firmware that takes one JSON object per line:
//!
//! ```text
//! {"T":1,"L":-0.1,"R":-0.1}\n
//! ```
//!
//! `T` is the firmware's command type (1 = wheel speeds), `L`/`R` the left and
//! right wheel values in [-0.5, 0.5]. Anything the firmware prints back is
//! forwarded as feedback, parsed as JSON when it is JSON and as a plain string
//! otherwise.
//!
//! The device is opened on the first write and reopened on the write after a
//! failure. A write that does not complete within `write_timeout_ms` counts as
//! a failure and closes the device.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use adapter_trait::{now_ms, ActuatorCommand, ActuatorLink, Feedback};
use anyhow::{Context, Result};
use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SerialLineConfig {
    #[serde(default = "default_port")]
    pub port:             String,
    #[serde(default = "default_baud")]
    pub baud:             u32,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

fn default_port()          -> String { "/dev/ttyUSB0".to_string() }
fn default_baud()          -> u32    { 115_200 }
fn default_write_timeout() -> u64    { 100 }

impl Default for SerialLineConfig {
    fn default() -> Self {
        Self {
            port:             default_port(),
            baud:             default_baud(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Wire format
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WheelLine {
    #[serde(rename = "T")]
    kind:  u8,
    #[serde(rename = "L")]
    left:  f32,
    #[serde(rename = "R")]
    right: f32,
}

/// Encodes one command as a newline-terminated line.
pub fn encode_line(cmd: &ActuatorCommand) -> Result<String> {
    let mut line = serde_json::to_string(&WheelLine { kind: 1, left: cmd.left, right: cmd.right })
        .context("encoding wheel command")?;
    line.push('\n');
    Ok(line)
}

fn parse_feedback(link_id: &str, line: &str) -> Feedback {
    let body = serde_json::from_str(line)
        .unwrap_or_else(|_| serde_json::Value::String(line.to_string()));
    Feedback { link_id: link_id.to_string(), received_ms: now_ms(), body }
}

// ──────────────────────────────────────────────────────────────────────────────
// Device handling
// ──────────────────────────────────────────────────────────────────────────────

/// Anything the adapter can talk lines over: a serial port, a pty, a test pipe.
pub trait Device: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Device for T {}

pub type Opener =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Box<dyn Device>>> + Send>> + Send + Sync>;

/// Write half of an open device plus the task reading its other half.
struct OpenDevice {
    writer: WriteHalf<Box<dyn Device>>,
    reader: JoinHandle<()>,
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_lines(link_id: String, half: ReadHalf<Box<dyn Device>>, tx: mpsc::Sender<Feedback>) {
    let mut lines = BufReader::new(half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if tx.try_send(parse_feedback(&link_id, line)).is_err() {
                    debug!(link = %link_id, "Feedback queue full, line dropped");
                }
            }
            Ok(None) => {
                debug!(link = %link_id, "Device closed its output");
                return;
            }
            Err(e) => {
                debug!(link = %link_id, error = %e, "Device read failed");
                return;
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Adapter implementation
// ──────────────────────────────────────────────────────────────────────────────

pub struct SerialLineLink {
    link_id:       String,
    opener:        Opener,
    write_timeout: Duration,
    device:        Arc<Mutex<Option<OpenDevice>>>,
    feedback_tx:   mpsc::Sender<Feedback>,
    feedback_rx:   std::sync::Mutex<Option<mpsc::Receiver<Feedback>>>,
}

impl SerialLineLink {
    pub fn new(config: &SerialLineConfig) -> Self {
        let link_id = format!("serial-line:{}@{}", config.port, config.baud);
        let port = config.port.clone();
        let baud = config.baud;
        let opener: Opener = Arc::new(move || {
            let port = port.clone();
            Box::pin(async move {
                use tokio_serial::SerialPortBuilderExt;
                let stream = tokio_serial::new(&port, baud)
                    .open_native_async()
                    .with_context(|| format!("opening serial device {port}"))?;
                Ok(Box::new(stream) as Box<dyn Device>)
            })
        });
        Self::with_opener(link_id, Duration::from_millis(config.write_timeout_ms), opener)
    }

    pub fn with_opener(link_id: impl Into<String>, write_timeout: Duration, opener: Opener) -> Self {
        let (feedback_tx, feedback_rx) = mpsc::channel(64);
        Self {
            link_id: link_id.into(),
            opener,
            write_timeout,
            device: Arc::new(Mutex::new(None)),
            feedback_tx,
            feedback_rx: std::sync::Mutex::new(Some(feedback_rx)),
        }
    }
}

impl ActuatorLink for SerialLineLink {
    fn write_command(&self, cmd: ActuatorCommand) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        let link_id = self.link_id.clone();
        let opener = Arc::clone(&self.opener);
        let device = Arc::clone(&self.device);
        let feedback_tx = self.feedback_tx.clone();
        let write_timeout = self.write_timeout;

        Box::pin(async move {
            let line = encode_line(&cmd)?;
            let mut guard = device.lock().await;

            if guard.is_none() {
                let dev = opener().await?;
                let (read_half, writer) = tokio::io::split(dev);
                let reader = tokio::spawn(read_lines(link_id.clone(), read_half, feedback_tx));
                info!(link = %link_id, "Serial device opened");
                *guard = Some(OpenDevice { writer, reader });
            }
            let Some(open) = guard.as_mut() else {
                anyhow::bail!("serial device not open");
            };

            let write = async {
                open.writer.write_all(line.as_bytes()).await?;
                open.writer.flush().await
            };
            let result = tokio::time::timeout(write_timeout, write).await;
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    *guard = None;
                    warn!(link = %link_id, error = %e, "Serial write failed, device closed");
                    Err(e).context("writing to serial device")
                }
                Err(_) => {
                    *guard = None;
                    warn!(link = %link_id, timeout_ms = write_timeout.as_millis() as u64, "Serial write timed out, device closed");
                    anyhow::bail!("serial write timed out after {write_timeout:?}")
                }
            }
        })
    }

    fn feedback_stream(&self) -> Pin<Box<dyn Stream<Item = Feedback> + Send>> {
        let rx = self.feedback_rx.lock().ok().and_then(|mut slot| slot.take());
        match rx {
            Some(mut rx) => Box::pin(stream! {
                while let Some(fb) = rx.recv().await {
                    yield fb;
                }
            }),
            None => Box::pin(futures::stream::empty()),
        }
    }

    fn link_id(&self) -> &str {
        &self.link_id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;

    fn cmd(left: f32, right: f32) -> ActuatorCommand {
        ActuatorCommand { throttle: 0.0, steering: 0.0, left, right }
    }

    /// Opener handing out the given pipe ends in order, failing once they run out.
    fn pipes(ends: Vec<DuplexStream>) -> (Opener, Arc<AtomicUsize>) {
        let ends = Arc::new(std::sync::Mutex::new(ends.into_iter()));
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let opener: Opener = Arc::new(move || {
            let next = ends.lock().unwrap().next();
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let end = next.context("no device present")?;
                Ok(Box::new(end) as Box<dyn Device>)
            })
        });
        (opener, opened)
    }

    #[test]
    fn encodes_rover_wire_format() {
        assert_eq!(encode_line(&cmd(-0.1, -0.1)).unwrap(), "{\"T\":1,\"L\":-0.1,\"R\":-0.1}\n");
        assert_eq!(encode_line(&ActuatorCommand::STOP).unwrap(), "{\"T\":1,\"L\":0.0,\"R\":0.0}\n");
    }

    #[test]
    fn feedback_lines_parse_as_json_or_text() {
        let fb = parse_feedback("s", r#"{"T":1001,"V":12.1}"#);
        assert_eq!(fb.body["V"], 12.1);
        let fb = parse_feedback("s", "boot ok");
        assert_eq!(fb.body, serde_json::json!("boot ok"));
    }

    #[tokio::test]
    async fn writes_lines_and_forwards_feedback() {
        let (ours, mut firmware) = tokio::io::duplex(1024);
        let (opener, opened) = pipes(vec![ours]);
        let link = SerialLineLink::with_opener("serial-line:test", Duration::from_secs(1), opener);
        let mut feedback = link.feedback_stream();

        link.write_command(cmd(0.25, 0.5)).await.unwrap();
        link.write_command(ActuatorCommand::STOP).await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        let expected = "{\"T\":1,\"L\":0.25,\"R\":0.5}\n{\"T\":1,\"L\":0.0,\"R\":0.0}\n";
        let mut buf = vec![0u8; expected.len()];
        firmware.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);

        firmware.write_all(b"{\"T\":1001,\"L\":0.25}\n").await.unwrap();
        let fb = feedback.next().await.unwrap();
        assert_eq!(fb.link_id, "serial-line:test");
        assert_eq!(fb.body["T"], 1001);

        assert!(link.feedback_stream().next().await.is_none(), "feedback has a single consumer");
    }

    #[tokio::test]
    async fn missing_device_fails_each_write_and_recovers() {
        let (opener, opened) = pipes(vec![]);
        let link = SerialLineLink::with_opener("serial-line:none", Duration::from_secs(1), opener);
        assert!(link.write_command(ActuatorCommand::STOP).await.is_err());
        assert!(link.write_command(ActuatorCommand::STOP).await.is_err());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out_and_reopens() {
        // The first pipe is never drained, so its tiny buffer fills up.
        let (stalled, _firmware_a) = tokio::io::duplex(8);
        let (fresh, mut firmware_b) = tokio::io::duplex(1024);
        let (opener, opened) = pipes(vec![stalled, fresh]);
        let link = SerialLineLink::with_opener("serial-line:test", Duration::from_millis(100), opener);

        let err = link.write_command(cmd(0.1, 0.1)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        link.write_command(cmd(0.2, 0.2)).await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        let mut buf = vec![0u8; 24];
        firmware_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"{\"T\":1,\"L\":0.2,\"R\":0.2}\n");
    }
}
