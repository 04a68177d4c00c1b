use std::path::{Path, PathBuf};
use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::describe_exit;

/// Codec names that can never be carried by an mp4 container.
///
/// `eia_608` closed-caption tracks are the usual culprit.
pub const DEFAULT_BLOCKED_CODECS: &[&str] = &["eia_608"];

/// Errors from probing; every one of them aborts the run
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to execute ffprobe at {}: {source}", .bin.display())]
    Spawn { bin: PathBuf, source: std::io::Error },

    #[error("ffprobe failed (exit code {}) for {}:\nSTDERR: {stderr}", describe_exit(.exit_code), .path.display())]
    Failed {
        path: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to parse ffprobe JSON for {}: {source}", .path.display())]
    InvalidOutput {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Blocked {codec} stream in {} has no index and cannot be excluded", .path.display())]
    MissingIndex { path: PathBuf, codec: String },
}

/// The subset of `ffprobe -show_streams -of json` output the pipeline needs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FFProbeStream {
    pub index: Option<u32>,
    pub codec_name: Option<String>,
    pub codec_type: Option<String>,
}

impl FFProbeStream {
    pub fn is_blocked(&self, blocked_codecs: &[String]) -> bool {
        self.codec_name
            .as_deref()
            .map(|name| blocked_codecs.iter().any(|blocked| blocked == name))
            .unwrap_or(false)
    }
}

/// Build `<ffprobe> -show_streams -of json <input>`
pub fn build_probe_command(ffprobe_bin: &Path, file_path: &Path) -> Command {
    let mut cmd = Command::new(ffprobe_bin);
    cmd.arg("-show_streams")
        .arg("-of")
        .arg("json")
        .arg(file_path);
    cmd
}

/// Run ffprobe and parse its JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData, ProbeError> {
    info!(
        "command: {} -show_streams -of json {}",
        ffprobe_bin.display(),
        file_path.display()
    );

    let output = build_probe_command(ffprobe_bin, file_path)
        .output()
        .await
        .map_err(|source| ProbeError::Spawn {
            bin: ffprobe_bin.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProbeError::Failed {
            path: file_path.to_path_buf(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe_output(&output.stdout).map_err(|source| ProbeError::InvalidOutput {
        path: file_path.to_path_buf(),
        source,
    })
}

pub fn parse_probe_output(stdout: &[u8]) -> Result<FFProbeData, serde_json::Error> {
    serde_json::from_slice(stdout)
}

/// Turn blocked streams into `-map` exclusion selectors (`0:<index>`), in stream order
pub fn blocked_selectors(
    file_path: &Path,
    data: &FFProbeData,
    blocked_codecs: &[String],
) -> Result<Vec<String>, ProbeError> {
    data.streams
        .iter()
        .filter(|stream| stream.is_blocked(blocked_codecs))
        .map(|stream| match stream.index {
            Some(index) => Ok(format!("0:{}", index)),
            None => Err(ProbeError::MissingIndex {
                path: file_path.to_path_buf(),
                codec: stream.codec_name.clone().unwrap_or_default(),
            }),
        })
        .collect()
}

/// Probe `file_path` and return the selectors of every stream that must be dropped
pub async fn blocked_streams(
    ffprobe_bin: &Path,
    file_path: &Path,
    blocked_codecs: &[String],
) -> Result<Vec<String>, ProbeError> {
    let data = probe_file(ffprobe_bin, file_path).await?;
    debug!("ffprobe found {} streams in {}", data.streams.len(), file_path.display());
    blocked_selectors(file_path, &data, blocked_codecs)
}
