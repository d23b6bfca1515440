use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("recording already in progress for id {0}")]
    AlreadyRunning(String),

    #[error("no recording in progress for id {0}")]
    NotRunning(String),

    #[error("recording still in progress for id {0}")]
    InProgress(String),

    #[error("recording not ready yet")]
    TryAgainLater { retry_after_secs: u64 },

    #[error("encoder failed to start: {reason}")]
    StartupFailed { exit_code: Option<i32>, reason: String },

    #[error("invalid zip archive: {0}")]
    BadZip(String),

    #[error("devtools upstream not ready")]
    UpstreamNotReady,

    #[error("{0}")]
    Timeout(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(_)
            | ApiError::NotRunning(_)
            | ApiError::BadZip(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Conflict(_)
            | ApiError::AlreadyRunning(_)
            | ApiError::InProgress(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::TryAgainLater { retry_after_secs } => {
                let body = json!({ "message": self.to_string() });
                let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from_str(&retry_after_secs.to_string())
                        .unwrap_or(HeaderValue::from_static("1")),
                );
                return response;
            }
            ApiError::UpstreamNotReady => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::StartupFailed { exit_code, reason } => {
                tracing::error!(exit_code = ?exit_code, reason = %reason, "Encoder startup failed");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            ApiError::Timeout(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        let body = json!({ "message": message });

        (status, Json(body)).into_response()
    }
}
