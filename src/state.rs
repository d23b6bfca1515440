use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::devtools::upstream::UpstreamManager;
use crate::idle::IdleController;
use crate::recorder::registry::RecorderRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub recordings: Arc<RecorderRegistry>,
    pub upstream: Arc<UpstreamManager>,
    pub idle: Arc<IdleController>,
    /// Fires on service shutdown; live DevTools bridges tear down on it.
    pub shutdown: CancellationToken,
}
