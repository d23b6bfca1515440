use axum::Json;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use crate::devtools::bridge;
use crate::error::ApiError;
use crate::state::AppState;

/// Routes are mounted twice: under `/cdp` on the API port and at the root
/// of the dedicated proxy port.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/json/version", get(json_version))
        .fallback(get(upgrade))
}

/// GET /json/version
///
/// Points automation clients back at this proxy: whatever host they used to
/// reach us is the host they should open the DevTools socket against.
async fn json_version(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let upstream_url = state.upstream.current();
    if upstream_url.is_empty() {
        return Err(ApiError::UpstreamNotReady);
    }
    let upstream_uri: Uri = upstream_url
        .parse()
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("published upstream URL is unparsable")))?;

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let path = upstream_uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Ok(Json(json!({
        "webSocketDebuggerUrl": format!("ws://{host}{path}"),
    })))
}

/// WebSocket upgrade for any other path: bridge to the current upstream.
/// The client's request path is deliberately ignored — it may name a
/// browser instance that no longer exists.
async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let upstream_url = state.upstream.current();
    if upstream_url.is_empty() {
        return ApiError::UpstreamNotReady.into_response();
    }
    if upstream_url.parse::<Uri>().is_err() {
        return ApiError::Internal(anyhow::anyhow!("published upstream URL is unparsable"))
            .into_response();
    }

    let log_messages = state.config.devtools.log_messages;
    let shutdown = state.shutdown.clone();
    // No permessage-deflate here: axum's WS layer (tungstenite underneath)
    // cannot negotiate it, so the upgrade is accepted uncompressed.
    ws.max_message_size(bridge::MAX_MESSAGE_BYTES)
        .max_frame_size(bridge::MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| bridge::bridge(socket, upstream_url, log_messages, shutdown))
}
