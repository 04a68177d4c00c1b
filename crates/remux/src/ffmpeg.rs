use std::ffi::OsString;
use std::path::Path;
use log::{info, warn};
use tokio::process::Command;

/// Arguments for a stream-copy remux of `input` into `output`.
///
/// Every stream is mapped, then each selector in `exclude` is subtracted again:
/// `-v warning -i <input> -c copy -map 0 [-map -<selector>]... <output>`
pub fn remux_args(input: &Path, output: &Path, exclude: &[String]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-v".into(),
        "warning".into(),
        "-i".into(),
        input.as_os_str().to_owned(),
        "-c".into(),
        "copy".into(),
        "-map".into(),
        "0".into(),
    ];

    for selector in exclude {
        args.push("-map".into());
        args.push(format!("-{}", selector).into());
    }

    args.push(output.as_os_str().to_owned());
    args
}

/// Build the remux command for the configured ffmpeg binary
pub fn build_remux_command(
    ffmpeg_bin: &Path,
    input: &Path,
    output: &Path,
    exclude: &[String],
) -> Command {
    let args = remux_args(input, output, exclude);
    info!(
        "command: {} {}",
        ffmpeg_bin.display(),
        args.iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let mut cmd = Command::new(ffmpeg_bin);
    cmd.args(&args);
    cmd
}

/// Ask ffmpeg which build it is, for the item record.
///
/// Returns the first line of `ffmpeg -version`, or `None` when it cannot be run.
pub async fn detect_tool_version(ffmpeg_bin: &Path) -> Option<String> {
    info!("command: {} -version", ffmpeg_bin.display());

    let output = match Command::new(ffmpeg_bin).arg("-version").output().await {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to execute {} -version: {}", ffmpeg_bin.display(), e);
            return None;
        }
    };

    if !output.status.success() {
        warn!(
            "{} -version exited with {}",
            ffmpeg_bin.display(),
            crate::describe_exit(&output.status.code())
        );
        return None;
    }

    parse_version_line(&String::from_utf8_lossy(&output.stdout))
}

pub fn parse_version_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(String::from)
}
