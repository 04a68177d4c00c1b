use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Configuration for the remux repair pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxConfig {
    /// Path to the ffmpeg binary used for remuxing
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary used for stream inspection
    pub ffprobe_bin: PathBuf,
    /// Extensions (without the dot) that mark a file as a candidate video
    pub video_extensions: Vec<String>,
    /// Codec names that can never live inside the target container
    pub blocked_codecs: Vec<String>,
    /// Interval in milliseconds between output size polls while ffmpeg runs
    pub monitor_interval_ms: u64,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl RemuxConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            video_extensions: vec!["mp4".to_string(), "m4v".to_string()],
            blocked_codecs: vec!["eia_608".to_string()],
            monitor_interval_ms: 1000,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                config = if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?
                } else {
                    serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?
                };
            } else {
                warn!("Config file {} does not exist, using defaults", config_path.display());
            }
        }

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// - `REMUX_FFMPEG_BIN` -> `ffmpeg_bin`
    /// - `REMUX_FFPROBE_BIN` -> `ffprobe_bin`
    /// - `REMUX_MONITOR_INTERVAL_MS` -> `monitor_interval_ms`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bin) = lookup("REMUX_FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Some(bin) = lookup("REMUX_FFPROBE_BIN") {
            self.ffprobe_bin = PathBuf::from(bin);
        }
        if let Some(raw) = lookup("REMUX_MONITOR_INTERVAL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.monitor_interval_ms = ms,
                Err(_) => warn!("Ignoring REMUX_MONITOR_INTERVAL_MS={:?}: not a number", raw),
            }
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_ms == 0 {
            bail!("monitor_interval_ms must be greater than zero");
        }
        if self.video_extensions.iter().all(|ext| ext.trim().is_empty()) {
            bail!("video_extensions must list at least one extension");
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.monitor_interval_ms)
    }
}
