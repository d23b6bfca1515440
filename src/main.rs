mod api;
mod config;
mod devtools;
mod error;
mod idle;
mod recorder;
mod services;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::devtools::upstream::UpstreamManager;
use crate::idle::{FileSink, IdleController, IdleSink, NoopSink};
use crate::recorder::encoder::{self, RecordingParams};
use crate::recorder::registry::RecorderRegistry;
use crate::state::AppState;

/// The browser must announce its DevTools endpoint this quickly after boot
/// or the instance is considered broken.
const STARTUP_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = AppConfig::load()?;
    tracing::info!(
        port = config.server.port,
        proxy_port = config.server.proxy_port,
        "Starting chromebox agent"
    );

    // Fail fast on a broken recording setup
    encoder::probe(&config.recording.ffmpeg_path).await?;
    RecordingParams::from_config(&config.recording)
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid default recording parameters: {e}"))?;

    let sink: Box<dyn IdleSink> = if config.idle.control_file.is_empty() {
        tracing::warn!("No idle control file configured — scale-to-zero control disabled");
        Box::new(NoopSink)
    } else {
        Box::new(FileSink::new(config.idle.control_file.clone().into()))
    };

    let shutdown = CancellationToken::new();
    let upstream = Arc::new(UpstreamManager::new());
    let tailer = upstream.spawn_tailer(config.chromium.supervisor_log.clone());

    let state = AppState {
        config: Arc::new(config.clone()),
        recordings: Arc::new(RecorderRegistry::new()),
        upstream: Arc::clone(&upstream),
        idle: Arc::new(IdleController::new(sink)),
        shutdown: shutdown.clone(),
    };

    // Build routers
    let app = api::router(&state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let proxy = api::proxy_router(&state)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start servers
    let api_addr = format!("{}:{}", config.server.host, config.server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    tracing::info!(addr = %api_addr, "API listening");

    let proxy_addr = format!("{}:{}", config.server.host, config.server.proxy_port);
    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr).await?;
    tracing::info!(addr = %proxy_addr, "DevTools proxy listening");

    let api_shutdown = shutdown.clone();
    let api_server = tokio::spawn(async move {
        axum::serve(api_listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await
    });

    let proxy_shutdown = shutdown.clone();
    let proxy_server = tokio::spawn(async move {
        axum::serve(proxy_listener, proxy)
            .with_graceful_shutdown(async move { proxy_shutdown.cancelled().await })
            .await
    });

    // Both listeners already serve (503 until discovery), but the instance
    // only counts as up once the browser is reachable.
    if !upstream
        .wait_for_initial(STARTUP_UPSTREAM_TIMEOUT)
        .await
    {
        shutdown.cancel();
        upstream.stop();
        anyhow::bail!(
            "devtools upstream URL not discovered within {}s",
            STARTUP_UPSTREAM_TIMEOUT.as_secs()
        );
    }
    tracing::info!(url = %upstream.current(), "DevTools upstream discovered");

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    shutdown.cancel();

    // Drain: every running recorder gets a graceful stop so the container
    // files are finalized.
    if let Err(e) = state.recordings.stop_all().await {
        tracing::error!(error = %e, "Recording drain failed");
    }
    upstream.stop();
    let _ = tailer.await;

    api_server.await??;
    proxy_server.await??;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
