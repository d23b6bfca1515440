//! Recorder registry: one entry per recording id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::ApiError;

use super::Recorder;

/// Process-wide map of live recorders. All mutation happens under the one
/// lock; recorders themselves guard their own state.
#[derive(Default)]
pub struct RecorderRegistry {
    recorders: Mutex<HashMap<String, Arc<Recorder>>>,
}

impl RecorderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a recorder. Fails when the id is already taken.
    pub fn register(&self, recorder: Arc<Recorder>) -> Result<(), ApiError> {
        let mut recorders = self.recorders.lock().unwrap();
        if recorders.contains_key(recorder.id()) {
            return Err(ApiError::Conflict(format!(
                "recording already in progress for id {}",
                recorder.id()
            )));
        }
        recorders.insert(recorder.id().to_owned(), recorder);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Recorder>> {
        self.recorders.lock().unwrap().get(id).cloned()
    }

    /// Remove an entry without stopping it.
    pub fn deregister(&self, id: &str) -> Option<Arc<Recorder>> {
        self.recorders.lock().unwrap().remove(id)
    }

    /// Snapshot of every registered recorder.
    pub fn list(&self) -> Vec<Arc<Recorder>> {
        self.recorders.lock().unwrap().values().cloned().collect()
    }

    /// Snapshot of recorders that are currently capturing.
    pub fn list_active(&self) -> Vec<Arc<Recorder>> {
        self.recorders
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.is_recording())
            .cloned()
            .collect()
    }

    /// Gracefully stop every active recorder. Failures do not short-circuit;
    /// they are joined into one error after every recorder has been tried.
    pub async fn stop_all(&self) -> anyhow::Result<()> {
        let active = self.list_active();
        let mut failures = Vec::new();

        for recorder in active {
            if let Err(e) = recorder.stop().await {
                tracing::error!(id = %recorder.id(), error = %e, "Failed to stop recording");
                failures.push(format!("{}: {e}", recorder.id()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "stopping recordings failed: {}",
                failures.join("; ")
            ))
        }
    }
}
