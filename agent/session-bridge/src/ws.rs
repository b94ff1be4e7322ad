//! WebSocket room transport.
//!
//! Signalling is JSON text frames; media travels as binary frames on the same
//! socket so a single TLS connection carries the whole session.
//!
//! # Wire format
//!
//! Client → server
//! ```text
//! {"type":"publish_track","name":"camera","mime":"video/h264"}
//! {"type":"unpublish_track","name":"camera"}
//! {"type":"subscribe","sid":"TR_x"}
//! {"type":"data","topic":"status","payload":"<base64>","reliable":true}
//! {"type":"leave"}
//! binary: [kind u8 = 1][pts_us u64 BE][flags u8, bit0 = keyframe][access unit]
//! ```
//!
//! Server → client
//! ```text
//! {"type":"joined","identity":"robot-1","peers":[{"identity":"op","role":"controller","tracks":[]}]}
//! {"type":"error","code":401,"message":"token expired"}
//! {"type":"peer_joined","peer":{...}}
//! {"type":"peer_left","identity":"op"}
//! {"type":"track_published","identity":"op","track":{"sid":"TR_x","kind":"audio","name":"mic"}}
//! {"type":"track_unpublished","identity":"op","sid":"TR_x"}
//! {"type":"data","from":"op","topic":"control","payload":"<base64>"}
//! {"type":"leave","reason":"kicked"}
//! ```

use std::future::Future;
use std::pin::Pin;

use adapter_trait::MediaSample;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::transport::{
    DisconnectReason, JoinError, JoinParams, PeerInfo, RoomConnection, RoomEvent, RoomRequest,
    RoomTransport, TrackInfo,
};

const MEDIA_KIND_VIDEO: u8 = 1;
const MEDIA_FLAG_KEYFRAME: u8 = 0x01;
const MEDIA_HEADER_LEN: usize = 10;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ──────────────────────────────────────────────────────────────────────────────
// Signalling messages
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PublishTrack { name: String, mime: String },
    UnpublishTrack { name: String },
    Subscribe { sid: String },
    Data { topic: String, payload: String, reliable: bool },
    Leave,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        identity: String,
        #[serde(default)]
        peers:    Vec<PeerInfo>,
    },
    Error {
        code:    u16,
        #[serde(default)]
        message: String,
    },
    PeerJoined { peer: PeerInfo },
    PeerLeft { identity: String },
    TrackPublished { identity: String, track: TrackInfo },
    TrackUnpublished { identity: String, sid: String },
    Data { from: String, topic: String, payload: String },
    Leave {
        #[serde(default)]
        reason: String,
    },
}

impl JoinError {
    fn from_code(code: u16, message: String) -> Self {
        match code {
            401 | 403 => JoinError::Unauthorized(format!("{code}: {message}")),
            _ => JoinError::Protocol(format!("server error {code}: {message}")),
        }
    }

    fn from_ws(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(resp) => {
                let status = resp.status().as_u16();
                match status {
                    401 | 403 => JoinError::Unauthorized(format!("HTTP {status} during handshake")),
                    _ => JoinError::Network(format!("HTTP {status} during handshake")),
                }
            }
            tungstenite::Error::Url(e) => JoinError::Protocol(format!("invalid url: {e}")),
            other => JoinError::Network(other.to_string()),
        }
    }
}

/// `[kind][pts_us BE][flags][payload]`
pub fn encode_media(sample: &MediaSample) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(MEDIA_HEADER_LEN + sample.data.len());
    buf.put_u8(MEDIA_KIND_VIDEO);
    buf.put_u64(sample.pts_us);
    buf.put_u8(if sample.keyframe { MEDIA_FLAG_KEYFRAME } else { 0 });
    buf.extend_from_slice(&sample.data);
    buf.to_vec()
}

/// Inverse of [`encode_media`]; `None` when the header is truncated or the kind is unknown.
pub fn decode_media(frame: &[u8]) -> Option<MediaSample> {
    if frame.len() < MEDIA_HEADER_LEN || frame[0] != MEDIA_KIND_VIDEO {
        return None;
    }
    let mut pts = [0u8; 8];
    pts.copy_from_slice(&frame[1..9]);
    Some(MediaSample {
        pts_us:   u64::from_be_bytes(pts),
        keyframe: frame[9] & MEDIA_FLAG_KEYFRAME != 0,
        data:     Bytes::copy_from_slice(&frame[MEDIA_HEADER_LEN..]),
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Transport
// ──────────────────────────────────────────────────────────────────────────────

pub struct WsRoomTransport {
    id:              String,
    event_capacity:  usize,
    request_capacity: usize,
}

impl WsRoomTransport {
    pub fn new(url: &str) -> Self {
        Self {
            id:               format!("ws:{url}"),
            event_capacity:   256,
            request_capacity: 64,
        }
    }

    fn rtc_url(params: &JoinParams) -> String {
        let mut url = format!(
            "{}/rtc?room={}&identity={}",
            params.url.trim_end_matches('/'),
            urlencoding::encode(&params.room),
            urlencoding::encode(&params.identity),
        );
        if !params.token.is_empty() {
            url.push_str("&access_token=");
            url.push_str(&urlencoding::encode(&params.token));
        }
        url
    }
}

impl RoomTransport for WsRoomTransport {
    fn connect(
        &self,
        params: JoinParams,
    ) -> Pin<Box<dyn Future<Output = Result<RoomConnection, JoinError>> + Send>> {
        let url = Self::rtc_url(&params);
        let event_capacity = self.event_capacity;
        let request_capacity = self.request_capacity;

        Box::pin(async move {
            debug!(room = %params.room, identity = %params.identity, "Opening WebSocket");
            let (mut ws, _resp) = connect_async(url.as_str()).await.map_err(JoinError::from_ws)?;

            let (local_identity, peers) = await_join(&mut ws).await?;
            info!(identity = %local_identity, peers = peers.len(), "Joined room");

            let (events_tx, mut events_rx) = mpsc::channel(event_capacity);
            let (outbound, requests) = mpsc::channel(request_capacity);
            tokio::spawn(pump(ws, events_tx, requests));

            let events = Box::pin(async_stream::stream! {
                while let Some(ev) = events_rx.recv().await {
                    yield ev;
                }
            });

            Ok(RoomConnection { local_identity, peers, events, outbound })
        })
    }

    fn transport_id(&self) -> &str {
        &self.id
    }
}

async fn await_join(ws: &mut Ws) -> Result<(String, Vec<PeerInfo>), JoinError> {
    loop {
        let msg = match ws.next().await {
            None => return Err(JoinError::Protocol("connection closed before join".into())),
            Some(Err(e)) => return Err(JoinError::from_ws(e)),
            Some(Ok(msg)) => msg,
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Joined { identity, peers }) => return Ok((identity, peers)),
                Ok(ServerMessage::Error { code, message }) => return Err(JoinError::from_code(code, message)),
                Ok(other) => debug!(?other, "Ignoring message before join"),
                Err(e) => return Err(JoinError::Protocol(format!("bad join reply: {e}"))),
            },
            Message::Close(frame) => {
                return Err(JoinError::Protocol(format!("closed before join: {frame:?}")));
            }
            _ => {}
        }
    }
}

fn to_client_message(req: RoomRequest) -> Option<ClientMessage> {
    let b64 = base64::engine::general_purpose::STANDARD;
    Some(match req {
        RoomRequest::PublishTrack { name, mime } => ClientMessage::PublishTrack { name, mime },
        RoomRequest::UnpublishTrack { name } => ClientMessage::UnpublishTrack { name },
        RoomRequest::Subscribe { sid } => ClientMessage::Subscribe { sid },
        RoomRequest::Data { topic, payload, reliable } =>
            ClientMessage::Data { topic, payload: b64.encode(payload), reliable },
        RoomRequest::Sample(_) | RoomRequest::Close => return None,
    })
}

fn to_room_event(msg: ServerMessage) -> Option<RoomEvent> {
    let b64 = base64::engine::general_purpose::STANDARD;
    Some(match msg {
        ServerMessage::PeerJoined { peer } => RoomEvent::PeerJoined(peer),
        ServerMessage::PeerLeft { identity } => RoomEvent::PeerLeft { identity },
        ServerMessage::TrackPublished { identity, track } => RoomEvent::TrackPublished { identity, track },
        ServerMessage::TrackUnpublished { identity, sid } => RoomEvent::TrackUnpublished { identity, sid },
        ServerMessage::Data { from, topic, payload } => match b64.decode(payload.as_bytes()) {
            Ok(bytes) => RoomEvent::Data { from, topic, payload: Bytes::from(bytes) },
            Err(e) => {
                debug!(%from, %topic, error = %e, "Dropping data message with invalid base64");
                return None;
            }
        },
        ServerMessage::Leave { reason } => RoomEvent::Disconnected(DisconnectReason::from_wire(&reason)),
        ServerMessage::Error { code, message } => {
            warn!(code, %message, "Server error after join");
            return None;
        }
        ServerMessage::Joined { .. } => return None,
    })
}

/// Shuttle requests to the socket and socket messages to the event channel
/// until either side goes away.
async fn pump(ws: Ws, events: mpsc::Sender<RoomEvent>, mut requests: mpsc::Receiver<RoomRequest>) {
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            req = requests.recv() => {
                let msg = match req {
                    None | Some(RoomRequest::Close) => {
                        let leave = serde_json::to_string(&ClientMessage::Leave).unwrap_or_default();
                        let _ = sink.send(Message::Text(leave)).await;
                        let _ = sink.close().await;
                        debug!("Room connection closed by bridge");
                        return;
                    }
                    Some(RoomRequest::Sample(sample)) => Message::Binary(encode_media(&sample)),
                    Some(other) => match to_client_message(other).map(|m| serde_json::to_string(&m)) {
                        Some(Ok(text)) => Message::Text(text),
                        Some(Err(e)) => {
                            warn!(error = %e, "Failed to encode signalling message");
                            continue;
                        }
                        None => continue,
                    },
                };
                if let Err(e) = sink.send(msg).await {
                    break DisconnectReason::NetworkLost(e.to_string());
                }
            }
            msg = stream.next() => match msg {
                None => break DisconnectReason::StreamEnded,
                Some(Err(e)) => break DisconnectReason::NetworkLost(e.to_string()),
                Some(Ok(Message::Text(text))) => {
                    let event = match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(m) => to_room_event(m),
                        Err(e) => {
                            debug!(error = %e, "Ignoring unknown signalling message");
                            None
                        }
                    };
                    if let Some(event) = event {
                        let leaving = matches!(event, RoomEvent::Disconnected(_));
                        if events.send(event).await.is_err() {
                            return;
                        }
                        if leaving {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server closed WebSocket");
                    break DisconnectReason::StreamEnded;
                }
                // Pongs are answered by tungstenite; inbound media is not consumed.
                Some(Ok(_)) => {}
            }
        }
    };

    let _ = events.send(RoomEvent::Disconnected(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http;

    fn params(url: String) -> JoinParams {
        JoinParams { url, room: "lab 1".into(), identity: "robot".into(), token: "t0k&n".into() }
    }

    #[test]
    fn url_carries_encoded_query() {
        let url = WsRoomTransport::rtc_url(&params("wss://rtc.example.net/".into()));
        assert_eq!(url, "wss://rtc.example.net/rtc?room=lab%201&identity=robot&access_token=t0k%26n");
    }

    #[test]
    fn media_header_layout() {
        let sample = MediaSample { data: Bytes::from_static(&[0, 0, 1, 9]), keyframe: true, pts_us: 0x0102 };
        let frame = encode_media(&sample);
        assert_eq!(&frame[..10], &[1, 0, 0, 0, 0, 0, 0, 1, 2, 1]);
        assert_eq!(decode_media(&frame), Some(sample));
        assert_eq!(decode_media(&frame[..5]), None);
    }

    #[tokio::test]
    async fn handshake_401_is_unauthorized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let reject = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                Err(http::Response::builder().status(401).body(None).unwrap())
            };
            let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
        });

        let transport = WsRoomTransport::new("test");
        let err = transport.connect(params(format!("ws://{addr}"))).await.err().unwrap();
        assert!(matches!(err, JoinError::Unauthorized(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn error_reply_403_is_unauthorized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"error","code":403,"message":"room locked"}"#.into()))
                .await
                .unwrap();
        });

        let transport = WsRoomTransport::new("test");
        let err = transport.connect(params(format!("ws://{addr}"))).await.err().unwrap();
        assert_eq!(err, JoinError::Unauthorized("403: room locked".into()));
    }

    #[tokio::test]
    async fn joins_exchanges_data_and_media() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::channel::<Message>(8);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"joined","identity":"robot","peers":[{"identity":"op","role":"controller"}]}"#.into(),
            ))
            .await
            .unwrap();
            // "{}" base64-encoded
            ws.send(Message::Text(r#"{"type":"data","from":"op","topic":"control","payload":"e30="}"#.into()))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if seen_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let transport = WsRoomTransport::new("test");
        let mut conn = transport.connect(params(format!("ws://{addr}"))).await.unwrap();
        assert_eq!(conn.local_identity, "robot");
        assert_eq!(conn.peers[0].identity, "op");

        let ev = conn.events.next().await.unwrap();
        assert_eq!(
            ev,
            RoomEvent::Data { from: "op".into(), topic: "control".into(), payload: Bytes::from_static(b"{}") }
        );

        conn.outbound
            .send(RoomRequest::PublishTrack { name: "camera".into(), mime: "video/h264".into() })
            .await
            .unwrap();
        let sample = MediaSample { data: Bytes::from_static(&[0, 0, 0, 1, 0x65]), keyframe: true, pts_us: 9 };
        conn.outbound.send(RoomRequest::Sample(sample.clone())).await.unwrap();

        match seen_rx.recv().await.unwrap() {
            Message::Text(t) => assert_eq!(
                serde_json::from_str::<ClientMessage>(&t).unwrap(),
                ClientMessage::PublishTrack { name: "camera".into(), mime: "video/h264".into() }
            ),
            other => panic!("unexpected {other:?}"),
        }
        match seen_rx.recv().await.unwrap() {
            Message::Binary(b) => assert_eq!(decode_media(&b), Some(sample)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_leave_maps_to_disconnect_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"joined","identity":"robot"}"#.into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"leave","reason":"kicked"}"#.into())).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let transport = WsRoomTransport::new("test");
        let mut conn = transport.connect(params(format!("ws://{addr}"))).await.unwrap();
        assert_eq!(conn.events.next().await, Some(RoomEvent::Disconnected(DisconnectReason::Kicked)));
        assert_eq!(conn.events.next().await, None);
    }
}
