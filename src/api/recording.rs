use std::sync::{Arc, LazyLock};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::recorder::Recorder;
use crate::recorder::encoder::{RecordingOverrides, RecordingParams};
use crate::state::AppState;

static RECORDER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").unwrap());

const DEFAULT_RECORDER_ID: &str = "main";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_recording))
        .route("/stop", post(stop_recording))
        .route("/download", get(download_recording))
        .route("/list", get(list_recordings))
}

fn validate_id(id: Option<&str>) -> Result<String, ApiError> {
    let id = id.unwrap_or(DEFAULT_RECORDER_ID);
    if !RECORDER_ID.is_match(id) {
        return Err(ApiError::BadRequest(
            "id must match [A-Za-z0-9-]{1,64}".into(),
        ));
    }
    Ok(id.to_owned())
}

#[derive(Debug, Default, Deserialize)]
struct StartRecordingRequest {
    id: Option<String>,
    #[serde(flatten)]
    overrides: RecordingOverrides,
}

/// POST /recording/start
async fn start_recording(
    State(state): State<AppState>,
    body: Option<Json<StartRecordingRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let id = validate_id(body.id.as_deref())?;

    let params = RecordingParams::from_config(&state.config.recording).merged(&body.overrides);
    params.validate()?;

    if let Some(existing) = state.recordings.get(&id) {
        if existing.is_recording() {
            return Err(ApiError::AlreadyRunning(id));
        }
        // Exited entry: the id is reusable, the old artifact gets overwritten.
        state.recordings.deregister(&id);
    }

    let recorder = Arc::new(Recorder::new(
        id.clone(),
        state.config.recording.ffmpeg_path.clone(),
        params,
    ));
    state.recordings.register(Arc::clone(&recorder))?;

    // The recording itself holds an idle lease until its encoder exits, on
    // top of the per-request lease the middleware takes.
    state
        .idle
        .disable()
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("taking idle lease")))?;

    match recorder.start().await {
        Ok(()) => {
            let idle = Arc::clone(&state.idle);
            let lease_holder = Arc::clone(&recorder);
            tokio::spawn(async move {
                lease_holder.wait_exited().await;
                if let Err(e) = idle.enable() {
                    tracing::warn!(id = %lease_holder.id(), error = %e, "Failed to release idle lease");
                }
            });
            Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
        }
        Err(e) => {
            state.recordings.deregister(&id);
            if let Err(enable_err) = state.idle.enable() {
                tracing::warn!(id = %id, error = %enable_err, "Failed to release idle lease");
            }
            Err(e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct StopRecordingRequest {
    id: Option<String>,
    #[serde(rename = "forceStop", default)]
    force_stop: bool,
}

/// POST /recording/stop
async fn stop_recording(
    State(state): State<AppState>,
    body: Option<Json<StopRecordingRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let (id, force_stop) = match body {
        Some(Json(body)) => (validate_id(body.id.as_deref())?, body.force_stop),
        None => (DEFAULT_RECORDER_ID.to_owned(), false),
    };

    let recorder = state
        .recordings
        .get(&id)
        .ok_or_else(|| ApiError::NotRunning(id.clone()))?;

    if force_stop {
        recorder.force_stop().await?;
    } else {
        recorder.stop().await?;
    }

    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    id: Option<String>,
}

/// GET /recording/download?id=…
async fn download_recording(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let id = validate_id(query.id.as_deref())?;

    let recorder = state.recordings.get(&id).ok_or(ApiError::NotFound("Recording"))?;
    let artifact = recorder.recording().await?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, artifact.size);

    if let Some(started_at) = artifact.started_at {
        builder = builder.header("X-Recording-Started-At", started_at.to_rfc3339());
    }
    if let Some(finished_at) = artifact.finished_at {
        builder = builder.header("X-Recording-Finished-At", finished_at.to_rfc3339());
    }

    builder
        .body(Body::from_stream(ReaderStream::new(artifact.file)))
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("building download response")))
}

/// GET /recording/list
async fn list_recordings(State(state): State<AppState>) -> impl IntoResponse {
    let mut statuses: Vec<_> = state
        .recordings
        .list()
        .iter()
        .map(|recorder| recorder.status())
        .collect();
    statuses.sort_by(|a, b| a.id.cmp(&b.id));
    Json(statuses)
}
