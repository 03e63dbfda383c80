/// Spotify dealer websocket subscriber.
///
/// ```text
///   DealerSubscriber::run()
///         │
///         ├── ping tick (30s)   → {"type":"ping"} → socket
///         └── socket frames
///                ├── Spotify-Connection-Id header → register hidden device
///                ├── message with payloads       → DealerEvent → events channel
///                └── pong / other                → ignored
/// ```
///
/// One connection per run.  When the socket closes the subscriber returns and
/// nothing reconnects it.
use anyhow::Context;
use base64::prelude::*;
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::DealerEvent;
use crate::session::Session;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);

const PING_FRAME: &str = r#"{"type":"ping"}"#;
const DEVICE_PREFIX: &str = "hobs_";
const CONNECTION_ID_HEADER: &str = "Spotify-Connection-Id";

// ── frame decoding ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DealerFrame {
    /// First frame of a connection; carries the id needed to register a device.
    Connected { connection_id: String },
    Event(DealerEvent),
    Pong,
    Other,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    payloads: Vec<Value>,
}

pub fn parse_frame(text: &str) -> anyhow::Result<DealerFrame> {
    let raw: RawFrame = serde_json::from_str(text).context("dealer frame is not JSON")?;

    match raw.kind.as_str() {
        "pong" => Ok(DealerFrame::Pong),
        "message" => {
            if let Some(id) = raw.headers.get(CONNECTION_ID_HEADER) {
                return Ok(DealerFrame::Connected {
                    connection_id: id.clone(),
                });
            }
            if raw.payloads.is_empty() {
                return Ok(DealerFrame::Other);
            }

            let gzip = raw
                .headers
                .get("Transfer-Encoding")
                .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
            let payload = decode_payload(&raw.payloads, gzip)?;

            match payload.get("update_reason").and_then(Value::as_str) {
                Some(name) => Ok(DealerFrame::Event(DealerEvent {
                    name: name.to_string(),
                    payload,
                })),
                None => Ok(DealerFrame::Other),
            }
        }
        _ => Ok(DealerFrame::Other),
    }
}

/// Payloads arrive either as a JSON object or as base64 text split across
/// several strings, optionally gzipped.
fn decode_payload(payloads: &[Value], gzip: bool) -> anyhow::Result<Value> {
    if let Some(obj) = payloads.first().filter(|p| p.is_object()) {
        return Ok(obj.clone());
    }

    let mut encoded = String::new();
    for part in payloads {
        let text = part
            .as_str()
            .context("payload part is neither an object nor a string")?;
        encoded.push_str(text);
    }

    let mut bytes = BASE64_STANDARD
        .decode(encoded.as_bytes())
        .context("payload is not base64")?;
    if gzip {
        let mut inflated = Vec::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut inflated)
            .context("payload is not valid gzip")?;
        bytes = inflated;
    }

    serde_json::from_slice(&bytes).context("decoded payload is not JSON")
}

// ── subscriber ────────────────────────────────────────────────────────────────

pub struct DealerSubscriber {
    session: Arc<Session>,
    device_id: String,
}

impl DealerSubscriber {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            device_id: random_device_id(),
        }
    }

    /// Read the socket until it closes, `events` is dropped, or `cancel` fires.
    pub async fn run(
        self,
        events: mpsc::Sender<DealerEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let token = self.session.bearer().await?;
        let url = format!(
            "{}?access_token={}",
            self.session.endpoints().dealer_url,
            token
        );
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("dealer connect failed")?;
        info!("dealer: connected");

        let (mut sink, mut stream) = socket.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        // interval fires immediately; the first ping is due after one period
        ping.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("dealer: cancelled");
                    let _ = sink.close().await;
                    break;
                }
                _ = ping.tick() => {
                    sink.send(Message::Text(PING_FRAME.to_string()))
                        .await
                        .context("dealer ping failed")?;
                }
                frame = stream.next() => {
                    let Some(frame) = frame else {
                        info!("dealer: connection closed");
                        break;
                    };
                    match frame.context("dealer read failed")? {
                        Message::Text(text) => {
                            if !self.on_text(&text, &events).await {
                                break;
                            }
                        }
                        Message::Close(reason) => {
                            info!("dealer: closed by server: {:?}", reason);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        info!("dealer: subscriber exiting");
        Ok(())
    }

    /// False once nobody is listening for events any more.
    async fn on_text(&self, text: &str, events: &mpsc::Sender<DealerEvent>) -> bool {
        match parse_frame(text) {
            Ok(DealerFrame::Connected { connection_id }) => {
                match self.register_device(&connection_id).await {
                    Ok(()) => info!("dealer: registered device {}{}", DEVICE_PREFIX, self.device_id),
                    Err(e) => warn!("dealer: device registration failed: {:#}", e),
                }
            }
            Ok(DealerFrame::Event(event)) => {
                debug!("dealer: event {}", event.name);
                if events.send(event).await.is_err() {
                    debug!("dealer: event receiver gone");
                    return false;
                }
            }
            Ok(DealerFrame::Pong) | Ok(DealerFrame::Other) => {}
            Err(e) => warn!("dealer: dropping frame: {:#}", e),
        }
        true
    }

    async fn register_device(&self, connection_id: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/devices/{}{}",
            self.session.endpoints().connect_state_url.trim_end_matches('/'),
            DEVICE_PREFIX,
            self.device_id
        );
        let body = json!({
            "member_type": "CONNECT_STATE",
            "device": {
                "device_info": {
                    "capabilities": {
                        "can_be_player": false,
                        "hidden": true,
                        "needs_full_player_state": true
                    }
                }
            }
        });

        let response = self
            .session
            .http()
            .put(&url)
            .bearer_auth(self.session.bearer().await?)
            .header("x-spotify-connection-id", connection_id)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("connect-state returned {}", response.status());
        }
        Ok(())
    }
}

fn random_device_id() -> String {
    let bytes: [u8; 20] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn cluster_update(uri: &str) -> Value {
        json!({
            "update_reason": "DEVICE_STATE_CHANGED",
            "cluster": { "player_state": { "track": { "uri": uri } } }
        })
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn expect_event(frame: DealerFrame) -> DealerEvent {
        match frame {
            DealerFrame::Event(event) => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_plain_payload() {
        let frame = json!({
            "type": "message",
            "uri": "hm://connect-state/v1/cluster",
            "payloads": [cluster_update("spotify:track:abc")]
        });
        let event = expect_event(parse_frame(&frame.to_string()).unwrap());
        assert_eq!(event.name, "DEVICE_STATE_CHANGED");
        assert_eq!(
            event.payload.pointer("/cluster/player_state/track/uri"),
            Some(&json!("spotify:track:abc"))
        );
    }

    #[test]
    fn test_parse_base64_payload() {
        let encoded = BASE64_STANDARD.encode(cluster_update("spotify:track:b64").to_string());
        let frame = json!({
            "type": "message",
            "headers": { "Content-Type": "application/json" },
            "payloads": [encoded]
        });
        let event = expect_event(parse_frame(&frame.to_string()).unwrap());
        assert_eq!(event.payload, cluster_update("spotify:track:b64"));
    }

    #[test]
    fn test_parse_gzip_payload_split_across_parts() {
        let encoded =
            BASE64_STANDARD.encode(gzip(cluster_update("spotify:track:gz").to_string().as_bytes()));
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        let frame = json!({
            "type": "message",
            "headers": { "Transfer-Encoding": "gzip" },
            "payloads": [head, tail]
        });
        let event = expect_event(parse_frame(&frame.to_string()).unwrap());
        assert_eq!(event.payload, cluster_update("spotify:track:gz"));
    }

    #[test]
    fn test_connection_id_frame() {
        let frame = json!({
            "type": "message",
            "uri": "hm://pusher/v1/connections/abc",
            "headers": { "Spotify-Connection-Id": "conn-42" }
        });
        assert_eq!(
            parse_frame(&frame.to_string()).unwrap(),
            DealerFrame::Connected {
                connection_id: "conn-42".to_string()
            }
        );
    }

    #[test]
    fn test_pong_and_unknown_frames() {
        assert_eq!(parse_frame(r#"{"type":"pong"}"#).unwrap(), DealerFrame::Pong);
        assert_eq!(
            parse_frame(r#"{"type":"request","payloads":[]}"#).unwrap(),
            DealerFrame::Other
        );
        // payload without an update reason is not routable
        let frame = json!({ "type": "message", "payloads": [{ "foo": 1 }] });
        assert_eq!(parse_frame(&frame.to_string()).unwrap(), DealerFrame::Other);
    }

    #[test]
    fn test_bad_frames_are_errors() {
        assert!(parse_frame("not json").is_err());
        let frame = json!({ "type": "message", "payloads": ["@@not base64@@"] });
        assert!(parse_frame(&frame.to_string()).is_err());
        let frame = json!({
            "type": "message",
            "headers": { "Transfer-Encoding": "gzip" },
            "payloads": [BASE64_STANDARD.encode(b"{}")]
        });
        assert!(parse_frame(&frame.to_string()).is_err());
    }

    #[test]
    fn test_device_id_is_hex() {
        let id = random_device_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_device_id());
    }
}
