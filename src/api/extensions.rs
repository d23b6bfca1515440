use std::io::Write;
use std::sync::LazyLock;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use regex::Regex;
use tempfile::NamedTempFile;

use crate::error::ApiError;
use crate::services::{extensions, flags, restart};
use crate::state::AppState;

static EXTENSION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,255}$").unwrap());

const NAME_FIELD: &str = "extensions.name";
const ZIP_FIELD: &str = "extensions.zip_file";

/// Extension bundles routinely exceed axum's default 2 MB body cap.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/extensions", post(upload_extensions))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

/// POST /chromium/extensions
///
/// Installs each uploaded (name, zip) pair, merges the unpacked paths into
/// the launch flag overlay, and restarts the browser. Succeeds only once
/// the restarted browser's DevTools endpoint is live again.
async fn upload_extensions(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    // The upload-to-restart window must never be interrupted by a
    // scale-to-zero reclaim, on top of the per-request middleware lease.
    state
        .idle
        .disable()
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("taking idle lease")))?;

    let result = install_and_restart(&state, multipart).await;

    if let Err(e) = state.idle.enable() {
        tracing::warn!(error = %e, "Failed to release idle lease");
    }
    result
}

async fn install_and_restart(
    state: &AppState,
    multipart: Multipart,
) -> Result<impl IntoResponse + use<>, ApiError> {
    let uploads = collect_pairs(multipart).await?;
    if uploads.is_empty() {
        return Err(ApiError::BadRequest("no extensions in upload".into()));
    }

    let owner = extensions::resolve_owner(&state.config.chromium.extensions_owner);
    let extensions_root = state.config.chromium.extensions_root.clone();

    let mut installed = Vec::with_capacity(uploads.len());
    for (name, zip) in uploads {
        let root = extensions_root.clone();
        let dest = tokio::task::spawn_blocking(move || {
            extensions::install(&root, &name, zip.path(), owner)
        })
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("extension install task: {e}")))??;
        installed.push(dest);
    }

    let mut base = flags::parse_tokens(&state.config.chromium.base_flags);
    base.extend(flags::read(&state.config.chromium.flags_path)?);
    let overlay = vec![format!(
        "--load-extension={}",
        installed
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    )];
    flags::write(
        &state.config.chromium.flags_path,
        flags::merge(&base, &overlay),
    )?;

    restart::restart_and_wait(&state.upstream, &state.config.chromium.restart_command).await?;

    Ok(StatusCode::CREATED)
}

/// Drain the multipart body into complete (name, zip) pairs. Fields may
/// arrive in either order, but each pair must be whole before the next
/// begins and a field may not repeat within a pair.
async fn collect_pairs(
    mut multipart: Multipart,
) -> Result<Vec<(String, NamedTempFile)>, ApiError> {
    let mut pairs = Vec::new();
    let mut pending_name: Option<String> = None;
    let mut pending_zip: Option<NamedTempFile> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("reading multipart body: {e}")))?
    {
        match field.name() {
            Some(NAME_FIELD) => {
                if pending_name.is_some() {
                    return Err(ApiError::BadRequest(format!(
                        "duplicate {NAME_FIELD} field in pair"
                    )));
                }
                let name = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("reading extension name: {e}")))?;
                validate_extension_name(&name)?;
                pending_name = Some(name);
            }
            Some(ZIP_FIELD) => {
                if pending_zip.is_some() {
                    return Err(ApiError::BadRequest(format!(
                        "duplicate {ZIP_FIELD} field in pair"
                    )));
                }
                let mut tmp = NamedTempFile::new().map_err(|e| {
                    ApiError::Internal(anyhow::Error::new(e).context("buffering upload"))
                })?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("reading zip upload: {e}")))?
                {
                    tmp.write_all(&chunk).map_err(|e| {
                        ApiError::Internal(anyhow::Error::new(e).context("buffering upload"))
                    })?;
                }
                pending_zip = Some(tmp);
            }
            other => {
                return Err(ApiError::BadRequest(format!(
                    "unexpected multipart field {other:?}"
                )));
            }
        }

        if pending_name.is_some() && pending_zip.is_some() {
            if let (Some(name), Some(zip)) = (pending_name.take(), pending_zip.take()) {
                pairs.push((name, zip));
            }
        }
    }

    if pending_name.is_some() || pending_zip.is_some() {
        return Err(ApiError::BadRequest(
            "incomplete extension pair in upload".into(),
        ));
    }

    Ok(pairs)
}

fn validate_extension_name(name: &str) -> Result<(), ApiError> {
    // The charset admits "." and ".." which would land the unpack outside
    // the extensions root.
    if name == "." || name == ".." || !EXTENSION_NAME.is_match(name) {
        return Err(ApiError::BadRequest(
            "extension name must match [A-Za-z0-9._-]{1,255}".into(),
        ));
    }
    Ok(())
}
