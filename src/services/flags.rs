//! Runtime flag overlay for the browser launch wrapper.
//!
//! The overlay is a JSON file `{"flags":["--foo","--bar=1",…]}` that the
//! launch wrapper appends to the browser command line. Extension uploads
//! rewrite it by merging the currently effective flags with the freshly
//! installed extension paths.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

const LOAD_EXTENSION: &str = "--load-extension=";
const DISABLE_EXCEPT: &str = "--disable-extensions-except=";
const DISABLE_EXTENSIONS: &str = "--disable-extensions";

#[derive(Debug, Default, Serialize, Deserialize)]
struct FlagsFile {
    flags: Vec<String>,
}

/// Read overlay tokens from `path`. A missing file is an empty overlay.
pub fn read(path: &Path) -> Result<Vec<String>, ApiError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(anyhow::Error::new(e).context("reading flags overlay").into()),
    };

    let file: FlagsFile = serde_json::from_str(&raw)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("flags overlay is not valid JSON: {e}")))?;
    Ok(file.flags.into_iter().filter(|t| !t.is_empty()).collect())
}

/// Persist overlay tokens to `path` as `{"flags":[...]}`.
pub fn write(path: &Path, flags: Vec<String>) -> Result<(), ApiError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::Error::new(e).context("creating flags overlay directory"))?;
    }
    let body = serde_json::to_string_pretty(&FlagsFile { flags })
        .map_err(anyhow::Error::new)?;
    std::fs::write(path, body)
        .map_err(|e| anyhow::Error::new(e).context("writing flags overlay").into())
}

/// Split a space-separated flag string into tokens, dropping empties.
pub fn parse_tokens(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}

#[derive(Debug, Default)]
struct ExtensionGroups {
    load: Vec<String>,
    except: Vec<String>,
    disable: bool,
    rest: Vec<String>,
}

fn split_groups(tokens: &[String]) -> ExtensionGroups {
    let mut groups = ExtensionGroups::default();
    for token in tokens {
        if let Some(csv) = token.strip_prefix(LOAD_EXTENSION) {
            groups
                .load
                .extend(csv.split(',').filter(|v| !v.is_empty()).map(str::to_owned));
        } else if let Some(csv) = token.strip_prefix(DISABLE_EXCEPT) {
            groups
                .except
                .extend(csv.split(',').filter(|v| !v.is_empty()).map(str::to_owned));
        } else if token == DISABLE_EXTENSIONS {
            groups.disable = true;
        } else {
            groups.rest.push(token.clone());
        }
    }
    groups
}

fn dedup_preserving(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Merge `overlay` flags over `base` flags.
///
/// Extension directives are unioned csv-wise; an overlay
/// `--disable-extensions` wins outright, and a base `--disable-extensions`
/// survives only while the overlay loads nothing. All other tokens are
/// concatenated base-then-overlay with first-occurrence dedup.
pub fn merge(base: &[String], overlay: &[String]) -> Vec<String> {
    let b = split_groups(base);
    let o = split_groups(overlay);

    let mut out = dedup_preserving(b.rest.into_iter().chain(o.rest));

    if o.disable || (b.disable && o.load.is_empty()) {
        out.push(DISABLE_EXTENSIONS.to_owned());
        return out;
    }

    let load = dedup_preserving(b.load.into_iter().chain(o.load));
    let except = dedup_preserving(b.except.into_iter().chain(o.except));
    if !load.is_empty() {
        out.push(format!("{LOAD_EXTENSION}{}", load.join(",")));
    }
    if !except.is_empty() {
        out.push(format!("{DISABLE_EXCEPT}{}", except.join(",")));
    }
    out
}
