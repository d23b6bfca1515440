//! Encoder invocation: parameter merging and ffmpeg argv construction.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;

use crate::config::RecordingConfig;
use crate::error::ApiError;

/// Fully resolved recording parameters, after overrides mask defaults.
#[derive(Debug, Clone)]
pub struct RecordingParams {
    pub output_dir: PathBuf,
    pub frame_rate: u32,
    pub display_num: u32,
    pub max_size_in_mb: u64,
    pub max_duration_in_seconds: Option<u64>,
}

/// Caller-supplied per-recording overrides. Unset fields inherit defaults.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RecordingOverrides {
    #[serde(rename = "framerate")]
    pub frame_rate: Option<u32>,
    #[serde(rename = "maxFileSizeInMB")]
    pub max_size_in_mb: Option<u64>,
    #[serde(rename = "maxDurationInSeconds")]
    pub max_duration_in_seconds: Option<u64>,
}

impl RecordingParams {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            frame_rate: config.frame_rate,
            display_num: config.display_num,
            max_size_in_mb: config.max_size_in_mb,
            max_duration_in_seconds: None,
        }
    }

    pub fn merged(&self, overrides: &RecordingOverrides) -> Self {
        Self {
            output_dir: self.output_dir.clone(),
            frame_rate: overrides.frame_rate.unwrap_or(self.frame_rate),
            display_num: self.display_num,
            max_size_in_mb: overrides.max_size_in_mb.unwrap_or(self.max_size_in_mb),
            max_duration_in_seconds: overrides
                .max_duration_in_seconds
                .or(self.max_duration_in_seconds),
        }
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ApiError::BadRequest("output directory must be set".into()));
        }
        if self.frame_rate == 0 {
            return Err(ApiError::BadRequest("framerate must be positive".into()));
        }
        if self.max_size_in_mb == 0 {
            return Err(ApiError::BadRequest("max file size must be positive".into()));
        }
        Ok(())
    }
}

/// Verify the encoder binary exists and runs. Called once at startup.
pub async fn probe(ffmpeg: &str) -> anyhow::Result<()> {
    let status = tokio::process::Command::new(ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("encoder binary `{ffmpeg}` is not runnable: {e}"))?;

    anyhow::ensure!(
        status.success(),
        "encoder binary `{ffmpeg}` exited with {status}"
    );
    Ok(())
}

/// Build the encoder argv for this platform.
///
/// The output is a fragmented MP4 with 2-second fragments so a recording
/// killed mid-file still has playable container metadata up to the last
/// completed fragment. Timestamps are wall-clock, shifted to start at zero,
/// with negatives clamped. `-xerror` makes the encoder exit on any error
/// instead of limping along, and `-fs` enforces the size cap in-process.
pub fn build_args(params: &RecordingParams, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-xerror".into()];

    args.extend(capture_input_args(params));

    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-pix_fmt",
            "yuv420p",
            "-start_at_zero",
            "-avoid_negative_ts",
            "make_zero",
            "-movflags",
            "+frag_keyframe+empty_moov+default_base_moof",
            "-frag_duration",
            "2000000",
        ]
        .map(String::from),
    );

    args.push("-fs".into());
    args.push((params.max_size_in_mb * 1024 * 1024).to_string());

    if let Some(secs) = params.max_duration_in_seconds {
        args.push("-t".into());
        args.push(secs.to_string());
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

#[cfg(not(target_os = "macos"))]
fn capture_input_args(params: &RecordingParams) -> Vec<String> {
    vec![
        "-f".into(),
        "x11grab".into(),
        "-framerate".into(),
        params.frame_rate.to_string(),
        "-use_wallclock_as_timestamps".into(),
        "1".into(),
        "-i".into(),
        format!(":{}", params.display_num),
    ]
}

// Development on macOS captures via AVFoundation; the display number is the
// avfoundation device index.
#[cfg(target_os = "macos")]
fn capture_input_args(params: &RecordingParams) -> Vec<String> {
    vec![
        "-f".into(),
        "avfoundation".into(),
        "-framerate".into(),
        params.frame_rate.to_string(),
        "-use_wallclock_as_timestamps".into(),
        "1".into(),
        "-capture_cursor".into(),
        "1".into(),
        "-i".into(),
        format!("{}:none", params.display_num),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RecordingParams {
        RecordingParams {
            output_dir: "/recordings".into(),
            frame_rate: 30,
            display_num: 1,
            max_size_in_mb: 500,
            max_duration_in_seconds: None,
        }
    }

    #[test]
    fn test_overrides_mask_defaults_field_by_field() {
        let merged = defaults().merged(&RecordingOverrides {
            frame_rate: Some(10),
            max_size_in_mb: None,
            max_duration_in_seconds: Some(60),
        });

        assert_eq!(merged.frame_rate, 10);
        assert_eq!(merged.max_size_in_mb, 500);
        assert_eq!(merged.max_duration_in_seconds, Some(60));
    }

    #[test]
    fn test_empty_overrides_inherit_everything() {
        let merged = defaults().merged(&RecordingOverrides::default());
        assert_eq!(merged.frame_rate, 30);
        assert_eq!(merged.max_size_in_mb, 500);
        assert_eq!(merged.max_duration_in_seconds, None);
    }

    #[test]
    fn test_validate_rejects_zero_framerate() {
        let mut params = defaults();
        params.frame_rate = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_output_dir() {
        let mut params = defaults();
        params.output_dir = PathBuf::new();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_args_emit_fragmented_container_and_size_cap() {
        let args = build_args(&defaults(), Path::new("/recordings/main.mp4"));

        let movflags = args.iter().position(|a| a == "-movflags").unwrap();
        assert!(args[movflags + 1].contains("frag_keyframe"));

        let frag = args.iter().position(|a| a == "-frag_duration").unwrap();
        assert_eq!(args[frag + 1], "2000000");

        let fs = args.iter().position(|a| a == "-fs").unwrap();
        assert_eq!(args[fs + 1], (500u64 * 1024 * 1024).to_string());

        assert_eq!(args.last().unwrap(), "/recordings/main.mp4");
        assert!(!args.contains(&"-t".to_string()));
    }

    #[test]
    fn test_args_cap_duration_when_set() {
        let mut params = defaults();
        params.max_duration_in_seconds = Some(90);
        let args = build_args(&params, Path::new("/recordings/a.mp4"));

        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "90");
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_args_grab_the_configured_display() {
        let args = build_args(&defaults(), Path::new("/recordings/a.mp4"));
        assert!(args.contains(&"x11grab".to_string()));
        assert!(args.contains(&":1".to_string()));
    }
}
