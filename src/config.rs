use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub recording: RecordingConfig,
    pub chromium: ChromiumConfig,
    pub devtools: DevtoolsConfig,
    pub idle: IdleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Port the DevTools proxy listens on, separate from the API port.
    pub proxy_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub frame_rate: u32,
    pub display_num: u32,
    pub max_size_in_mb: u64,
    /// Encoder binary; resolved against PATH when not absolute.
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumConfig {
    pub extensions_root: PathBuf,
    /// Unprivileged user that owns unpacked extensions. Empty = leave as-is.
    pub extensions_owner: String,
    /// Space-separated launch flags the environment always passes.
    pub base_flags: String,
    pub flags_path: PathBuf,
    /// Process-supervisor command that restarts the browser, e.g.
    /// "supervisorctl restart chromium".
    pub restart_command: String,
    /// Supervisor log file the DevTools URL is discovered from.
    pub supervisor_log: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevtoolsConfig {
    /// Log every proxied CDP message (method/id/session) at debug level.
    pub log_messages: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdleConfig {
    /// Platform scale-to-zero control file. Empty = no-op sink.
    pub control_file: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 10001)?
            .set_default("server.proxy_port", 9222)?
            .set_default("recording.output_dir", "/recordings")?
            .set_default("recording.frame_rate", 30)?
            .set_default("recording.display_num", 1)?
            .set_default("recording.max_size_in_mb", 500)?
            .set_default("recording.ffmpeg_path", "ffmpeg")?
            .set_default("chromium.extensions_root", "/chromium/extensions")?
            .set_default("chromium.extensions_owner", "chromium")?
            .set_default("chromium.base_flags", "")?
            .set_default("chromium.flags_path", "/chromium/flags.json")?
            .set_default("chromium.restart_command", "supervisorctl restart chromium")?
            .set_default("chromium.supervisor_log", "/var/log/chromium/chromium.log")?
            .set_default("devtools.log_messages", false)?
            .set_default("idle.control_file", "")?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("CHROMEBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
