//! Screen-recording lifecycle.
//!
//! A [`Recorder`] owns exactly one encoder subprocess. The subprocess runs
//! in its own process group so shutdown signals reach any helpers it forks.
//! A waiter task observes the exit and publishes the terminal state through
//! a one-shot token; every other operation learns about the exit from that
//! token, never by polling.

pub mod encoder;
pub mod registry;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

use self::encoder::RecordingParams;

/// How long start() watches for an encoder that dies immediately.
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(500);
/// Grace given to a force-stopped encoder before we stop waiting.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);
/// Files at or below this size have no usable container data yet.
const MIN_DOWNLOADABLE_BYTES: u64 = 100;

/// Escalation ladder for graceful stop, run against the process group.
/// SIGCONT first in case the group was stopped; SIGINT lets ffmpeg finalize
/// the container trailer.
const STOP_PHASES: &[(&[Signal], Duration)] = &[
    (&[Signal::SIGCONT, Signal::SIGINT], Duration::from_secs(5)),
    (&[Signal::SIGTERM], Duration::from_secs(2)),
    (&[Signal::SIGKILL], Duration::from_secs(1)),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecorderState {
    Idle,
    Running,
    Exited,
}

struct RecorderInner {
    state: RecorderState,
    pid: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    failure: Option<String>,
}

pub struct Recorder {
    id: String,
    ffmpeg: String,
    params: RecordingParams,
    output_path: PathBuf,
    inner: Mutex<RecorderInner>,
    exited: CancellationToken,
}

/// Snapshot served by the list endpoint.
#[derive(Debug, Serialize)]
pub struct RecorderStatus {
    pub id: String,
    #[serde(rename = "isRecording")]
    pub is_recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// An open recording artifact plus the metadata the download headers need.
pub struct RecordingFile {
    pub file: tokio::fs::File,
    pub size: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Recorder {
    pub fn new(id: String, ffmpeg: String, params: RecordingParams) -> Self {
        let output_path = params.output_dir.join(format!("{id}.mp4"));
        Self {
            id,
            ffmpeg,
            params,
            output_path,
            inner: Mutex::new(RecorderInner {
                state: RecorderState::Idle,
                pid: None,
                started_at: None,
                finished_at: None,
                exit_code: None,
                failure: None,
            }),
            exited: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().unwrap().state == RecorderState::Running
    }

    /// Resolve once the encoder subprocess has exited. Resolves immediately
    /// for a recorder that is already terminal.
    pub async fn wait_exited(&self) {
        self.exited.cancelled().await;
    }

    pub fn status(&self) -> RecorderStatus {
        let inner = self.inner.lock().unwrap();
        RecorderStatus {
            id: self.id.clone(),
            is_recording: inner.state == RecorderState::Running,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }

    /// Spawn the encoder and watch it through the early-exit window.
    pub async fn start(self: &Arc<Self>) -> Result<(), ApiError> {
        tokio::fs::create_dir_all(&self.params.output_dir)
            .await
            .map_err(|e| {
                ApiError::Internal(anyhow::Error::new(e).context("creating output directory"))
            })?;

        let args = encoder::build_args(&self.params, &self.output_path);

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != RecorderState::Idle {
                return Err(ApiError::AlreadyRunning(self.id.clone()));
            }

            let mut command = tokio::process::Command::new(&self.ffmpeg);
            command
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            #[cfg(unix)]
            command.process_group(0);

            let child = command.spawn().map_err(|e| ApiError::StartupFailed {
                exit_code: None,
                reason: format!("spawning encoder: {e}"),
            })?;

            inner.pid = child.id().map(|pid| pid as i32);
            inner.started_at = Some(Utc::now());
            inner.state = RecorderState::Running;

            let recorder = Arc::clone(self);
            tokio::spawn(recorder.wait_for_exit(child));
        }

        // An encoder that dies this fast never produced a usable recording;
        // surface its exit as a start failure instead of a phantom success.
        if tokio::time::timeout(EARLY_EXIT_WINDOW, self.exited.cancelled())
            .await
            .is_ok()
        {
            let inner = self.inner.lock().unwrap();
            return Err(ApiError::StartupFailed {
                exit_code: inner.exit_code,
                reason: inner
                    .failure
                    .clone()
                    .unwrap_or_else(|| "encoder exited during startup".into()),
            });
        }

        tracing::info!(id = %self.id, output = %self.output_path.display(), "Recording started");
        Ok(())
    }

    /// Waiter task: owns the child, publishes the terminal state exactly
    /// once, then fires the exited token to unblock every waiter.
    async fn wait_for_exit(self: Arc<Self>, mut child: tokio::process::Child) {
        let result = child.wait().await;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.finished_at = Some(Utc::now());
            match result {
                Ok(status) => {
                    inner.exit_code = exit_code_of(&status);
                    if !status.success() {
                        inner.failure = Some(format!("encoder exited with {status}"));
                    }
                }
                Err(e) => {
                    inner.failure = Some(format!("waiting on encoder: {e}"));
                }
            }
            inner.state = RecorderState::Exited;
        }

        self.exited.cancel();

        let inner = self.inner.lock().unwrap();
        tracing::info!(
            id = %self.id,
            exit_code = ?inner.exit_code,
            failure = ?inner.failure,
            "Recording encoder exited"
        );
    }

    /// Escalating stop: each phase signals the whole process group and waits
    /// for the exited token before escalating. Signal delivery errors are
    /// swallowed; the final state decides the result.
    pub async fn stop(&self) -> Result<(), ApiError> {
        let pid = {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                RecorderState::Exited => return Ok(()),
                RecorderState::Idle => return Err(ApiError::NotRunning(self.id.clone())),
                RecorderState::Running => inner.pid,
            }
        };
        let Some(pid) = pid else {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "running recorder {} has no pid",
                self.id
            )));
        };

        let mut last_error = None;
        for (signals, wait) in STOP_PHASES {
            for signal in *signals {
                if let Err(e) = kill(Pid::from_raw(-pid), *signal) {
                    last_error = Some(e);
                }
            }
            if tokio::time::timeout(*wait, self.exited.cancelled())
                .await
                .is_ok()
            {
                tracing::info!(id = %self.id, signal = ?signals.last(), "Recording stopped");
                return Ok(());
            }
        }

        if self.exited.is_cancelled() {
            return Ok(());
        }
        match last_error {
            Some(e) => Err(ApiError::Internal(anyhow::anyhow!(
                "signalling encoder group: {e}"
            ))),
            // SIGKILL was delivered; the group cannot outlive it.
            None => Ok(()),
        }
    }

    /// Immediate SIGKILL of the process group.
    pub async fn force_stop(&self) -> Result<(), ApiError> {
        let pid = {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                RecorderState::Exited => return Ok(()),
                RecorderState::Idle => return Err(ApiError::NotRunning(self.id.clone())),
                RecorderState::Running => inner.pid,
            }
        };
        let Some(pid) = pid else {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "running recorder {} has no pid",
                self.id
            )));
        };

        let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
        let _ = tokio::time::timeout(FORCE_KILL_WAIT, self.exited.cancelled()).await;
        tracing::info!(id = %self.id, "Recording force-stopped");
        Ok(())
    }

    /// Open the finished artifact for download.
    pub async fn recording(&self) -> Result<RecordingFile, ApiError> {
        let (running, started_at, finished_at) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.state == RecorderState::Running,
                inner.started_at,
                inner.finished_at,
            )
        };

        if running {
            let written = tokio::fs::metadata(&self.output_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if written <= MIN_DOWNLOADABLE_BYTES {
                return Err(ApiError::TryAgainLater { retry_after_secs: 1 });
            }
            return Err(ApiError::InProgress(self.id.clone()));
        }

        let file = match tokio::fs::File::open(&self.output_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApiError::NotFound("Recording"));
            }
            Err(e) => {
                return Err(ApiError::Internal(
                    anyhow::Error::new(e).context("opening recording"),
                ));
            }
        };

        let size = file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("recording metadata")))?;

        Ok(RecordingFile {
            file,
            size,
            started_at,
            finished_at,
        })
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    // Conventional shell encoding for signal deaths: 128 + signal.
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dir: &std::path::Path) -> RecordingParams {
        RecordingParams {
            output_dir: dir.to_path_buf(),
            frame_rate: 30,
            display_num: 1,
            max_size_in_mb: 10,
            max_duration_in_seconds: None,
        }
    }

    fn idle_recorder(dir: &std::path::Path) -> Arc<Recorder> {
        Arc::new(Recorder::new("r1".into(), "ffmpeg".into(), params(dir)))
    }

    #[tokio::test]
    async fn test_stop_on_idle_recorder_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = idle_recorder(dir.path());

        assert!(matches!(
            recorder.stop().await,
            Err(ApiError::NotRunning(_))
        ));
        assert!(matches!(
            recorder.force_stop().await,
            Err(ApiError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_startup_failure_when_binary_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::new(
            "r1".into(),
            "/nonexistent/encoder-binary".into(),
            params(dir.path()),
        ));

        let err = recorder.start().await.unwrap_err();
        assert!(matches!(err, ApiError::StartupFailed { .. }));
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_exited_state_published_through_token() {
        let dir = tempfile::tempdir().unwrap();
        // `true` exits immediately, which the early-exit window reports as a
        // startup failure; afterwards the recorder is terminal.
        let recorder = Arc::new(Recorder::new(
            "r1".into(),
            "true".into(),
            params(dir.path()),
        ));

        let err = recorder.start().await.unwrap_err();
        assert!(matches!(err, ApiError::StartupFailed { .. }));

        recorder.exited.cancelled().await;
        let status = recorder.status();
        assert!(!status.is_recording);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_some());

        // Exited is terminal and stop is now a no-op success.
        recorder.stop().await.unwrap();
        recorder.force_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_of_missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = idle_recorder(dir.path());

        assert!(matches!(
            recorder.recording().await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_after_exit_returns_artifact_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = idle_recorder(dir.path());
        tokio::fs::write(dir.path().join("r1.mp4"), vec![0u8; 4096])
            .await
            .unwrap();

        let artifact = recorder.recording().await.unwrap();
        assert_eq!(artifact.size, 4096);
    }
}
