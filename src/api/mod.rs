pub mod devtools;
pub mod extensions;
pub mod recording;

use axum::Router;
use axum::response::IntoResponse;
use axum::routing::get;
use tower_http::catch_panic::CatchPanicLayer;

use crate::state::AppState;

/// API-port router. The idle middleware is the outermost layer here so a
/// lease covers the full request, with panics already converted to
/// responses underneath it.
pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .nest("/recording", recording::routes())
        .nest("/chromium", extensions::routes())
        .nest("/cdp", devtools::routes())
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::idle::middleware,
        ))
}

/// Proxy-port router: the DevTools surface only, mounted at the root so
/// automation clients can use the URLs Chromium hands out verbatim. Proxy
/// requests carry the same idle lease and panic conversion as API-port
/// requests; for a WS upgrade the lease covers the handshake.
pub fn proxy_router(state: &AppState) -> Router<AppState> {
    devtools::routes()
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::idle::middleware,
        ))
}

async fn health_check() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::config::{
        AppConfig, ChromiumConfig, DevtoolsConfig, IdleConfig, RecordingConfig, ServerConfig,
    };
    use crate::devtools::upstream::UpstreamManager;
    use crate::idle::{IdleController, NoopSink};
    use crate::recorder::registry::RecorderRegistry;
    use crate::state::AppState;

    /// State for handler tests: everything on temp paths, no-op idle sink,
    /// no tailer, and a restart command that exits cleanly.
    pub fn test_state() -> AppState {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));

        let config = AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                proxy_port: 0,
            },
            recording: RecordingConfig {
                output_dir: dir.path().join("recordings"),
                frame_rate: 30,
                display_num: 1,
                max_size_in_mb: 100,
                ffmpeg_path: "ffmpeg".into(),
            },
            chromium: ChromiumConfig {
                extensions_root: dir.path().join("extensions"),
                extensions_owner: String::new(),
                base_flags: String::new(),
                flags_path: dir.path().join("flags.json"),
                restart_command: "true".into(),
                supervisor_log: dir.path().join("chromium.log"),
            },
            devtools: DevtoolsConfig {
                log_messages: false,
            },
            idle: IdleConfig {
                control_file: String::new(),
            },
        };

        AppState {
            config: Arc::new(config),
            recordings: Arc::new(RecorderRegistry::new()),
            upstream: Arc::new(UpstreamManager::new()),
            idle: Arc::new(IdleController::new(Box::new(NoopSink))),
            shutdown: CancellationToken::new(),
        }
    }
}
