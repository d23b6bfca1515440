//! Transparent WebSocket bridge between automation clients and the
//! browser's DevTools endpoint.
//!
//! The client side is an axum upgrade; the upstream side is dialed with
//! tungstenite using the URL the upstream manager last published — never
//! the path the client requested, which may point at a stale browser
//! instance. Frames are copied opcode-for-opcode until either side closes.

use std::sync::LazyLock;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

/// DevTools screenshots and heap snapshots produce very large frames.
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

static RE_METHOD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""method"\s*:\s*"([^"]+)""#).unwrap());
static RE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""id"\s*:\s*(\d+)"#).unwrap());
static RE_SESSION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""sessionId"\s*:\s*"([^"]+)""#).unwrap());
static RE_TARGET_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""targetId"\s*:\s*"([^"]+)""#).unwrap());
static RE_FRAME_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""frameId"\s*:\s*"([^"]+)""#).unwrap());

/// Dial the upstream and shuttle frames both ways until either peer closes,
/// errors, or `cancel` fires; then both sides are torn down together.
pub async fn bridge(client: WebSocket, upstream_url: String, log_messages: bool, cancel: CancellationToken) {
    // tungstenite has no permessage-deflate support, so both legs of the
    // bridge run uncompressed; only the size caps carry over to the dial.
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_BYTES))
        .max_frame_size(Some(MAX_MESSAGE_BYTES));

    let dial = connect_async_with_config(upstream_url.as_str(), Some(ws_config), false);
    let upstream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, dial).await {
        Ok(Ok((upstream, _response))) => upstream,
        Ok(Err(e)) => {
            tracing::warn!(url = %upstream_url, error = %e, "DevTools upstream dial failed");
            return;
        }
        Err(_) => {
            tracing::warn!(url = %upstream_url, "DevTools upstream handshake timed out");
            return;
        }
    };

    tracing::debug!(url = %upstream_url, "DevTools bridge established");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = client_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                if log_messages {
                    if let ClientMessage::Text(text) = &msg {
                        log_cdp_message("→", text.as_str(), text.len());
                    }
                }
                let Some(msg) = client_to_upstream(msg) else { continue };
                if upstream_tx.send(msg).await.is_err() {
                    break;
                }
            }

            msg = upstream_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                if log_messages {
                    if let UpstreamMessage::Text(text) = &msg {
                        log_cdp_message("←", text.as_str(), text.len());
                    }
                }
                let Some(msg) = upstream_to_client(msg) else { continue };
                if client_tx.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }

    // One-time cleanup: whichever direction ended, both sides go down.
    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;
    tracing::debug!(url = %upstream_url, "DevTools bridge closed");
}

fn client_to_upstream(msg: ClientMessage) -> Option<UpstreamMessage> {
    Some(match msg {
        ClientMessage::Text(text) => UpstreamMessage::text(text.as_str()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(frame) => UpstreamMessage::Close(frame.map(|f| {
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().to_owned().into(),
            }
        })),
    })
}

fn upstream_to_client(msg: UpstreamMessage) -> Option<ClientMessage> {
    Some(match msg {
        UpstreamMessage::Text(text) => ClientMessage::Text(text.as_str().into()),
        UpstreamMessage::Binary(data) => ClientMessage::Binary(data),
        UpstreamMessage::Ping(data) => ClientMessage::Ping(data),
        UpstreamMessage::Pong(data) => ClientMessage::Pong(data),
        UpstreamMessage::Close(frame) => ClientMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
        // Raw frames never surface from a configured read loop.
        UpstreamMessage::Frame(_) => return None,
    })
}

/// Best-effort extraction of CDP envelope fields for structured logging.
/// Never blocks or alters the forwarded bytes.
fn log_cdp_message(direction: &str, text: &str, len: usize) {
    let capture = |re: &Regex| re.captures(text).map(|c| c[1].to_owned());

    tracing::debug!(
        direction,
        bytes = len,
        method = ?capture(&RE_METHOD),
        id = ?capture(&RE_ID),
        session_id = ?capture(&RE_SESSION_ID),
        target_id = ?capture(&RE_TARGET_ID),
        frame_id = ?capture(&RE_FRAME_ID),
        "CDP message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frames_roundtrip_between_stacks() {
        let msg = ClientMessage::Text(r#"{"id":1,"method":"Page.enable"}"#.into());
        let upstream = client_to_upstream(msg).unwrap();
        assert!(matches!(&upstream, UpstreamMessage::Text(t) if t.as_str().contains("Page.enable")));

        let back = upstream_to_client(upstream).unwrap();
        assert!(matches!(&back, ClientMessage::Text(t) if t.as_str().contains("Page.enable")));
    }

    #[test]
    fn test_binary_opcode_is_preserved() {
        let payload = bytes::Bytes::from_static(&[1u8, 2, 3]);
        let upstream = client_to_upstream(ClientMessage::Binary(payload.clone())).unwrap();
        assert!(matches!(upstream, UpstreamMessage::Binary(ref b) if b == &payload));
    }

    #[test]
    fn test_raw_frames_are_not_forwarded() {
        let frame = UpstreamMessage::Frame(
            tokio_tungstenite::tungstenite::protocol::frame::Frame::pong(vec![]),
        );
        assert!(upstream_to_client(frame).is_none());
    }

    #[test]
    fn test_cdp_field_regexes_extract_envelope() {
        let text = r#"{"id":42,"method":"Target.attachToTarget","params":{"targetId":"T1"},"sessionId":"S9"}"#;
        assert_eq!(&RE_METHOD.captures(text).unwrap()[1], "Target.attachToTarget");
        assert_eq!(&RE_ID.captures(text).unwrap()[1], "42");
        assert_eq!(&RE_SESSION_ID.captures(text).unwrap()[1], "S9");
        assert_eq!(&RE_TARGET_ID.captures(text).unwrap()[1], "T1");
        assert!(RE_FRAME_ID.captures(text).is_none());
    }
}
