//! Live event stream client.
//!
//! Receives provider events over an outbound duplex session instead of
//! inbound HTTP — the deployment needs no public endpoint. The session is
//! authenticated with the account's secret key; the server announces the
//! signing secret on ready, delivers event envelopes, and expects an ack
//! per event. The client reconnects with exponential backoff until the
//! caller flips the stop flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use ssx_stripe::EventEnvelope;

/// Default event stream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://stream.stripe.com/v1/events";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Outcome the handler reports for one delivered event; written back on the
/// socket so the server can log and advance its delivery cursor.
#[derive(Debug, Clone, Serialize)]
pub struct EventAck {
    pub event_id: String,
    /// `"ok"` or `"failed"`; failed events are redelivered.
    pub status: String,
}

impl EventAck {
    pub fn ok(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            status: "ok".to_string(),
        }
    }

    pub fn failed(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            status: "failed".to_string(),
        }
    }
}

/// Callbacks for session lifecycle and event delivery.
pub trait StreamHandler: Send + Sync {
    /// The session is established; `secret` signs deliveries on this
    /// session (informational — the transport itself is authenticated).
    fn on_ready(&self, secret: &str);

    /// One delivered event; the returned ack is written back to the server.
    fn on_event(&self, envelope: EventEnvelope) -> impl Future<Output = EventAck> + Send;

    fn on_error(&self, error: &str);

    fn on_close(&self, code: u16, reason: &str);
}

/// Server → client frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Ready { secret: String },
    Event { event: EventEnvelope },
}

/// Client → server frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Ack(&'a EventAck),
}

pub struct LiveStreamClient {
    url: String,
    secret_key: String,
    stop: Arc<AtomicBool>,
}

impl LiveStreamClient {
    pub fn new(url: &str, secret_key: &str) -> Self {
        Self {
            url: url.to_string(),
            secret_key: secret_key.to_string(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag for cooperative shutdown; flip it and the client exits after
    /// the in-flight event is acked.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run the session until stopped. Reconnects with exponential backoff
    /// on any failure or server-side close.
    pub async fn run<H: StreamHandler>(&self, handler: &H) {
        let mut backoff = INITIAL_BACKOFF;

        while !self.stop.load(Ordering::Relaxed) {
            match self.session(handler).await {
                Ok(()) => {
                    // Clean close; reconnect promptly unless stopping.
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    handler.on_error(&e);
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "stream session failed");
                }
            }
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        info!("live stream client stopped");
    }

    /// One connect-read-ack session. `Ok(())` on an orderly close.
    async fn session<H: StreamHandler>(&self, handler: &H) -> Result<(), String> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| format!("bad stream url: {e}"))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.secret_key))
            .map_err(|e| format!("bad authorization header: {e}"))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _resp) = connect_async(request)
            .await
            .map_err(|e| format!("stream connect failed: {e}"))?;
        let (mut sink, mut stream) = ws.split();
        info!(url = %self.url, "live stream connected");

        while let Some(frame) = stream.next().await {
            if self.stop.load(Ordering::Relaxed) {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }

            let msg = frame.map_err(|e| format!("stream read failed: {e}"))?;
            match msg {
                Message::Text(text) => {
                    let frame: ServerFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "ignoring undecodable stream frame");
                            continue;
                        }
                    };
                    match frame {
                        ServerFrame::Ready { secret } => handler.on_ready(&secret),
                        ServerFrame::Event { event } => {
                            let ack = handler.on_event(event).await;
                            let payload = serde_json::to_string(&ClientFrame::Ack(&ack))
                                .map_err(|e| format!("ack encode failed: {e}"))?;
                            sink.send(Message::Text(payload))
                                .await
                                .map_err(|e| format!("ack send failed: {e}"))?;
                        }
                    }
                }
                Message::Ping(payload) => {
                    sink.send(Message::Pong(payload))
                        .await
                        .map_err(|e| format!("pong send failed: {e}"))?;
                }
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    handler.on_close(code, &reason);
                    return Ok(());
                }
                _ => {}
            }
        }

        handler.on_close(1006, "connection dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_frames_decode() {
        let ready: ServerFrame =
            serde_json::from_value(json!({"type": "ready", "secret": "whsec_x"})).unwrap();
        assert!(matches!(ready, ServerFrame::Ready { ref secret } if secret == "whsec_x"));

        let event: ServerFrame = serde_json::from_value(json!({
            "type": "event",
            "event": {
                "id": "evt_1",
                "type": "charge.updated",
                "created": 2000,
                "data": {"object": {"id": "ch_1", "object": "charge"}}
            }
        }))
        .unwrap();
        match event {
            ServerFrame::Event { event } => {
                assert_eq!(event.id, "evt_1");
                assert_eq!(event.created, 2000);
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn ack_frame_shape() {
        let ack = EventAck::ok("evt_9");
        let encoded = serde_json::to_value(ClientFrame::Ack(&ack)).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "ack", "event_id": "evt_9", "status": "ok"})
        );
    }
}
