//! Discovery and republication of the browser's DevTools WebSocket URL.
//!
//! Chromium prints `DevTools listening on ws://…` to the supervisor log on
//! every (re)start. A background task tails that log, extracts the URL, and
//! publishes it through a watch channel: readers grab the latest value
//! without coordination, and restart flows subscribe to be woken by the
//! next change.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static DEVTOOLS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DevTools listening on (ws://\S+)").unwrap());

/// First retry delay after a failed/ended tail; doubles up to the cap until
/// a URL has been matched.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
/// Poll interval while sitting at end-of-file.
const EOF_POLL: Duration = Duration::from_millis(100);
const INITIAL_WAIT_POLL: Duration = Duration::from_millis(100);

pub struct UpstreamManager {
    current: watch::Sender<String>,
    cancel: CancellationToken,
}

/// One-shot subscription: resolves on the next URL change after it was
/// created. Dropping it unsubscribes.
pub struct UrlSubscription {
    rx: watch::Receiver<String>,
}

impl UrlSubscription {
    /// Wait for the next change. Returns `None` when the manager shut down
    /// before any change arrived.
    pub async fn changed(mut self) -> Option<String> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow().clone())
    }
}

impl UpstreamManager {
    pub fn new() -> Self {
        let (current, _) = watch::channel(String::new());
        Self {
            current,
            cancel: CancellationToken::new(),
        }
    }

    /// Latest known upstream URL; empty until first discovery.
    pub fn current(&self) -> String {
        self.current.borrow().clone()
    }

    /// Register for the next URL change. A receiver subscribed now has
    /// already "seen" the current value, so only a subsequent change wakes
    /// it — subscribe *before* triggering whatever causes the change.
    pub fn subscribe(&self) -> UrlSubscription {
        UrlSubscription {
            rx: self.current.subscribe(),
        }
    }

    /// Store a newly discovered URL; no-op when unchanged or empty.
    pub fn publish(&self, url: &str) {
        if url.is_empty() {
            return;
        }
        let updated = self.current.send_if_modified(|current| {
            if current == url {
                false
            } else {
                *current = url.to_owned();
                true
            }
        });
        if updated {
            tracing::info!(url = %url, "DevTools upstream updated");
        }
    }

    /// Poll until a URL is known or the deadline passes.
    pub async fn wait_for_initial(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.current().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(INITIAL_WAIT_POLL).await;
        }
    }

    /// Launch the background log tailer. Runs until [`stop`](Self::stop).
    pub fn spawn_tailer(self: &Arc<Self>, log_path: PathBuf) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                if manager.cancel.is_cancelled() {
                    return;
                }

                match manager.tail_once(&log_path).await {
                    TailOutcome::Cancelled => return,
                    TailOutcome::Matched => backoff = INITIAL_BACKOFF,
                    TailOutcome::NothingYet => {
                        tracing::debug!(
                            path = %log_path.display(),
                            backoff_ms = backoff.as_millis() as u64,
                            "Supervisor log not readable yet"
                        );
                    }
                }

                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
    }

    /// Idempotent shutdown of the tailer and all pending subscriptions.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Tail the log from the start, following appends, until the file is
    /// rotated away or the task is cancelled.
    async fn tail_once(&self, path: &Path) -> TailOutcome {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(_) => return TailOutcome::NothingYet,
        };

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut pos: u64 = 0;
        let mut matched = false;

        loop {
            line.clear();
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return TailOutcome::Cancelled,
                read = reader.read_line(&mut line) => read,
            };

            match read {
                Ok(0) => {
                    // At EOF: a shrinking file means rotation — reopen.
                    match tokio::fs::metadata(path).await {
                        Ok(meta) if meta.len() >= pos => {}
                        _ => {
                            return if matched {
                                TailOutcome::Matched
                            } else {
                                TailOutcome::NothingYet
                            };
                        }
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => return TailOutcome::Cancelled,
                        _ = tokio::time::sleep(EOF_POLL) => {}
                    }
                }
                Ok(n) => {
                    pos += n as u64;
                    if let Some(captures) = DEVTOOLS_LINE.captures(&line) {
                        self.publish(&captures[1]);
                        matched = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Supervisor log tail failed");
                    return if matched {
                        TailOutcome::Matched
                    } else {
                        TailOutcome::NothingYet
                    };
                }
            }
        }
    }
}

enum TailOutcome {
    Matched,
    NothingYet,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_publish_and_current() {
        let manager = UpstreamManager::new();
        assert!(manager.current().is_empty());

        manager.publish("ws://127.0.0.1:9223/devtools/browser/abc");
        assert_eq!(
            manager.current(),
            "ws://127.0.0.1:9223/devtools/browser/abc"
        );
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_the_next_change() {
        let manager = UpstreamManager::new();
        manager.publish("ws://host/devtools/browser/old");

        let subscription = manager.subscribe();
        manager.publish("ws://host/devtools/browser/new");

        let url = tokio::time::timeout(Duration::from_secs(1), subscription.changed())
            .await
            .unwrap();
        assert_eq!(url.as_deref(), Some("ws://host/devtools/browser/new"));
    }

    #[tokio::test]
    async fn test_republishing_same_url_does_not_notify() {
        let manager = UpstreamManager::new();
        manager.publish("ws://host/devtools/browser/abc");

        let subscription = manager.subscribe();
        manager.publish("ws://host/devtools/browser/abc");

        let result =
            tokio::time::timeout(Duration::from_millis(200), subscription.changed()).await;
        assert!(result.is_err(), "duplicate publish must not wake subscribers");
    }

    #[tokio::test]
    async fn test_tailer_discovers_url_from_appended_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("chromium.log");
        std::fs::write(&log_path, "starting browser\n").unwrap();

        let manager = Arc::new(UpstreamManager::new());
        let handle = manager.spawn_tailer(log_path.clone());

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        writeln!(
            file,
            "DevTools listening on ws://127.0.0.1:9223/devtools/browser/abc"
        )
        .unwrap();

        assert!(manager.wait_for_initial(Duration::from_secs(2)).await);
        assert_eq!(
            manager.current(),
            "ws://127.0.0.1:9223/devtools/browser/abc"
        );

        // A replacement line publishes exactly one change to a subscriber
        // registered in between.
        let subscription = manager.subscribe();
        writeln!(
            file,
            "DevTools listening on ws://127.0.0.1:9223/devtools/browser/xyz"
        )
        .unwrap();

        let url = tokio::time::timeout(Duration::from_secs(2), subscription.changed())
            .await
            .unwrap();
        assert_eq!(
            url.as_deref(),
            Some("ws://127.0.0.1:9223/devtools/browser/xyz")
        );

        manager.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tailer_waits_for_log_file_to_appear() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("late.log");

        let manager = Arc::new(UpstreamManager::new());
        let handle = manager.spawn_tailer(log_path.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(
            &log_path,
            "DevTools listening on ws://127.0.0.1:9223/devtools/browser/late\n",
        )
        .unwrap();

        assert!(manager.wait_for_initial(Duration::from_secs(5)).await);
        manager.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_initial_times_out_without_url() {
        let manager = UpstreamManager::new();
        assert!(!manager.wait_for_initial(Duration::from_millis(250)).await);
    }
}
