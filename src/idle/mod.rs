//! Scale-to-zero suppression.
//!
//! The platform watches a control file: `"+"` disables idle shutdown, `"-"`
//! re-enables it. Long operations (recordings, browser restarts, live
//! bridges) take a lease so the instance is never reclaimed mid-flight. The
//! controller reference-counts leases and only touches the file on 0→1 and
//! 1→0 transitions, skipping writes that would repeat the last value.

use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Writes the platform control state. Implementations must be cheap; the
/// controller holds its lock across the call.
pub trait IdleSink: Send + Sync {
    fn set_suppressed(&self, suppressed: bool) -> io::Result<()>;
}

/// Writes `"+"` / `"-"` to the platform control file.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl IdleSink for FileSink {
    fn set_suppressed(&self, suppressed: bool) -> io::Result<()> {
        std::fs::write(&self.path, if suppressed { "+" } else { "-" })
    }
}

/// For environments without the control file (development, tests).
pub struct NoopSink;

impl IdleSink for NoopSink {
    fn set_suppressed(&self, _suppressed: bool) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct IdleState {
    holds: u64,
    last_written: Option<bool>,
}

pub struct IdleController {
    sink: Box<dyn IdleSink>,
    state: Mutex<IdleState>,
}

impl IdleController {
    pub fn new(sink: Box<dyn IdleSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(IdleState::default()),
        }
    }

    /// Take a lease. The 0→1 transition writes `"+"`; a write failure rolls
    /// the count back so the next caller retries.
    pub fn disable(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.holds += 1;
        if state.holds == 1 && state.last_written != Some(true) {
            if let Err(e) = self.sink.set_suppressed(true) {
                state.holds -= 1;
                return Err(e);
            }
            state.last_written = Some(true);
        }
        Ok(())
    }

    /// Release a lease. The 1→0 transition writes `"-"`. On a write failure
    /// the count stays at zero and the last-written state is left stale, so
    /// the next 1→0 transition retries the write.
    pub fn enable(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.holds == 0 {
            return Ok(());
        }
        state.holds -= 1;
        if state.holds == 0 && state.last_written != Some(false) {
            self.sink.set_suppressed(false)?;
            state.last_written = Some(false);
        }
        Ok(())
    }

    #[cfg(test)]
    fn holds(&self) -> u64 {
        self.state.lock().unwrap().holds
    }
}

/// Request middleware: every inbound request holds a lease for its whole
/// lifetime. Panics are converted to responses by the catch-panic layer
/// beneath this one, so the release always runs.
pub async fn middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Err(e) = state.idle.disable() {
        return ApiError::Internal(anyhow::Error::new(e).context("suppressing idle shutdown"))
            .into_response();
    }

    let response = next.run(req).await;

    if let Err(e) = state.idle.enable() {
        tracing::warn!(error = %e, "Failed to re-enable idle shutdown");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingSink {
        writes: Mutex<Vec<bool>>,
        fail_next: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
            }
        }
    }

    impl IdleSink for &RecordingSink {
        fn set_suppressed(&self, suppressed: bool) -> io::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(io::Error::other("control file unavailable"));
            }
            self.writes.lock().unwrap().push(suppressed);
            Ok(())
        }
    }

    fn controller(sink: &'static RecordingSink) -> IdleController {
        IdleController::new(Box::new(sink))
    }

    fn leak_sink() -> &'static RecordingSink {
        Box::leak(Box::new(RecordingSink::new()))
    }

    #[test]
    fn test_nested_leases_write_once_each_way() {
        let sink = leak_sink();
        let idle = controller(sink);

        for _ in 0..4 {
            idle.disable().unwrap();
        }
        for _ in 0..4 {
            idle.enable().unwrap();
        }

        assert_eq!(*sink.writes.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_enable_without_lease_is_noop() {
        let sink = leak_sink();
        let idle = controller(sink);

        idle.enable().unwrap();
        assert!(sink.writes.lock().unwrap().is_empty());
        assert_eq!(idle.holds(), 0);
    }

    #[test]
    fn test_disable_write_error_rolls_back_count() {
        let sink = leak_sink();
        let idle = controller(sink);

        sink.fail_next.store(true, Ordering::SeqCst);
        assert!(idle.disable().is_err());
        assert_eq!(idle.holds(), 0);

        // The retry transition writes.
        idle.disable().unwrap();
        assert_eq!(*sink.writes.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_enable_write_error_leaves_state_retryable() {
        let sink = leak_sink();
        let idle = controller(sink);

        idle.disable().unwrap();
        sink.fail_next.store(true, Ordering::SeqCst);
        assert!(idle.enable().is_err());
        assert_eq!(idle.holds(), 0);

        // Re-acquire: still suppressed per last write, so no "+" repeat.
        idle.disable().unwrap();
        idle.enable().unwrap();
        assert_eq!(*sink.writes.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_sequential_pairs_each_transition_writes() {
        let sink = leak_sink();
        let idle = controller(sink);

        idle.disable().unwrap();
        idle.enable().unwrap();
        idle.disable().unwrap();
        idle.enable().unwrap();

        assert_eq!(*sink.writes.lock().unwrap(), vec![true, false, true, false]);
    }
}
