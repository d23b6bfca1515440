//! Browser restart orchestration.

use std::sync::Arc;
use std::time::Duration;

use crate::devtools::upstream::UpstreamManager;
use crate::error::ApiError;

/// Hard deadline on the supervisor restart command itself.
const RESTART_DEADLINE: Duration = Duration::from_secs(60);
/// How long a fresh DevTools URL may take to show up after the restart.
const DEVTOOLS_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Restart the browser via the process supervisor and block until the
/// upstream manager observes the restarted browser's DevTools URL.
pub async fn restart_and_wait(
    upstream: &Arc<UpstreamManager>,
    restart_command: &str,
) -> Result<String, ApiError> {
    let mut parts = restart_command.split_whitespace();
    let Some(program) = parts.next() else {
        return Err(ApiError::Internal(anyhow::anyhow!(
            "chromium restart command is not configured"
        )));
    };
    let program = program.to_owned();
    let args: Vec<String> = parts.map(str::to_owned).collect();

    // Subscribe before triggering the restart: the new URL can land in the
    // supervisor log before the restart command even returns, and a late
    // subscriber would wait forever on a change that already happened.
    let subscription = upstream.subscribe();

    let (err_tx, err_rx) = tokio::sync::oneshot::channel::<anyhow::Error>();
    tokio::spawn(async move {
        let run = async {
            let status = tokio::process::Command::new(&program)
                .args(&args)
                .status()
                .await
                .map_err(|e| anyhow::anyhow!("spawning restart command: {e}"))?;
            anyhow::ensure!(status.success(), "restart command exited with {status}");
            Ok(())
        };
        match tokio::time::timeout(RESTART_DEADLINE, run).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = err_tx.send(e);
            }
            Err(_) => {
                let _ = err_tx.send(anyhow::anyhow!("restart command deadline exceeded"));
            }
        }
    });

    // A cleanly finished command just drops its sender; only a real failure
    // resolves this future.
    let command_failed = async move {
        match err_rx.await {
            Ok(e) => e,
            Err(_) => std::future::pending().await,
        }
    };

    tokio::select! {
        url = subscription.changed() => match url {
            Some(url) => {
                tracing::info!(url = %url, "Browser restarted, DevTools ready");
                Ok(url)
            }
            None => Err(ApiError::Internal(anyhow::anyhow!(
                "upstream manager shut down during restart"
            ))),
        },
        e = command_failed => Err(ApiError::Internal(e.context("restarting browser"))),
        _ = tokio::time::sleep(DEVTOOLS_READY_TIMEOUT) => {
            Err(ApiError::Timeout("devtools not ready in time".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restart_resolves_on_next_published_url() {
        let upstream = Arc::new(UpstreamManager::new());
        upstream.publish("ws://127.0.0.1:9223/devtools/browser/old");

        let manager = Arc::clone(&upstream);
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            manager.publish("ws://127.0.0.1:9223/devtools/browser/new");
        });

        let url = restart_and_wait(&upstream, "true").await.unwrap();
        assert_eq!(url, "ws://127.0.0.1:9223/devtools/browser/new");
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_command_failure_is_reported() {
        let upstream = Arc::new(UpstreamManager::new());

        let err = restart_and_wait(&upstream, "false").await.unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
    }
}
