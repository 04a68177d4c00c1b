//! Runs ffmpeg as a child process while a monitor loop watches the output file grow.
//!
//! The child and the monitor share nothing but the filesystem: the monitor stats the
//! output path on a fixed interval and reports growth as progress, and the loop ends
//! when the child's exit status becomes available. Output size is never used as a
//! completion signal.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use log::{debug, warn, Level};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{interval, MissedTickBehavior};

use crate::ffmpeg::build_remux_command;
use crate::progress::{ProgressReporter, ProgressTask, ProgressUnit};

/// Default wall-clock granularity of the output monitor.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// How many trailing stderr lines are kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("Failed to spawn {program}: {source}. Ensure it is installed and accessible.")]
    Spawn { program: String, source: io::Error },

    #[error("Failed to wait for {program}: {source}")]
    Wait { program: String, source: io::Error },
}

/// How a supervised child finished
#[derive(Debug)]
pub struct ConversionOutcome {
    pub status: ExitStatus,
    /// Last lines the child wrote to stderr
    pub stderr_tail: Vec<String>,
    /// Output size at the final poll
    pub observed_bytes: u64,
}

impl ConversionOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Progress observed from a size change, never negative.
#[inline]
pub fn size_delta(last_size: u64, current_size: u64) -> u64 {
    current_size.saturating_sub(last_size)
}

/// Watches a file that another process is writing
#[derive(Debug)]
pub struct OutputMonitor {
    path: PathBuf,
    last_size: u64,
}

impl OutputMonitor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_size: 0,
        }
    }

    /// Stat the file and return the growth since the largest size seen so far.
    ///
    /// A file that does not exist yet has grown by zero.
    pub fn poll(&mut self) -> io::Result<u64> {
        let current = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let delta = size_delta(self.last_size, current);
        self.last_size = self.last_size.max(current);
        Ok(delta)
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    fn observe(&mut self, task: &mut dyn ProgressTask) {
        match self.poll() {
            Ok(0) => {}
            Ok(delta) => task.advance(delta),
            Err(e) => warn!("Failed to stat {}: {}", self.path.display(), e),
        }
    }
}

/// Launches conversions and monitors them until they exit
#[derive(Debug, Clone)]
pub struct ConversionSupervisor {
    poll_interval: Duration,
}

impl Default for ConversionSupervisor {
    fn default() -> Self {
        Self::new(MONITOR_INTERVAL)
    }
}

impl ConversionSupervisor {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Remux `input` into `output` without the `exclude` streams.
    ///
    /// A non-zero exit is returned as an outcome, not an error; the caller decides
    /// what a failed conversion means.
    pub async fn convert(
        &self,
        ffmpeg_bin: &Path,
        input: &Path,
        output: &Path,
        exclude: &[String],
        reporter: &dyn ProgressReporter,
        label: &str,
    ) -> Result<ConversionOutcome, SuperviseError> {
        let total = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
        let mut task = reporter.start(label, total, ProgressUnit::Bytes);
        let cmd = build_remux_command(ffmpeg_bin, input, output, exclude);
        self.supervise(cmd, output, task.as_mut()).await
    }

    /// Spawn `cmd` and poll `output` every interval until the child exits.
    pub async fn supervise(
        &self,
        mut cmd: Command,
        output: &Path,
        task: &mut dyn ProgressTask,
    ) -> Result<ConversionOutcome, SuperviseError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        let tool = Path::new(&program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SuperviseError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!("Spawned {} (pid {:?})", program, child.id());

        let stdout_handle = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, tool.clone(), Level::Info, 0)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, tool.clone(), Level::Warn, STDERR_TAIL_LINES)));

        let mut monitor = OutputMonitor::new(output);
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                result = child.wait() => {
                    break result.map_err(|source| SuperviseError::Wait {
                        program: program.clone(),
                        source,
                    })?;
                }
                _ = ticker.tick() => monitor.observe(task),
            }
        };

        // Pick up whatever was flushed between the last tick and exit.
        monitor.observe(task);
        task.finish();

        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        let stderr_tail = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        debug!("{} exited with {}", program, crate::describe_exit(&status.code()));

        Ok(ConversionOutcome {
            status,
            stderr_tail,
            observed_bytes: monitor.last_size(),
        })
    }
}

/// Relay a child's output stream to the log, keeping its last `keep` lines.
///
/// Lines are read as raw bytes so that non-UTF-8 output never ends the relay early;
/// the pipe has to stay drained until the child closes it.
async fn forward_lines<R>(reader: R, tool: String, level: Level, keep: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(keep);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read {} output: {}", tool, e);
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        log::log!(level, "{}: {}", tool, line);
        if keep > 0 {
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    tail.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::testing::RecordingReporter;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn shell(script: &str, output: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).arg("sh").arg(output);
        cmd
    }

    #[test]
    fn test_monitor_missing_file_reports_nothing() {
        let dir = TempDir::new().unwrap();
        let mut monitor = OutputMonitor::new(dir.path().join("out.mp4"));
        assert_eq!(monitor.poll().unwrap(), 0);
        assert_eq!(monitor.last_size(), 0);
    }

    #[test]
    fn test_monitor_reports_growth_since_last_poll() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.mp4");
        let mut monitor = OutputMonitor::new(&path);

        std::fs::write(&path, vec![0u8; 10]).unwrap();
        assert_eq!(monitor.poll().unwrap(), 10);

        std::fs::write(&path, vec![0u8; 25]).unwrap();
        assert_eq!(monitor.poll().unwrap(), 15);
        assert_eq!(monitor.poll().unwrap(), 0);

        // Truncation does not rewind progress, and regrowth is only counted past the old peak.
        std::fs::write(&path, vec![0u8; 5]).unwrap();
        assert_eq!(monitor.poll().unwrap(), 0);
        std::fs::write(&path, vec![0u8; 30]).unwrap();
        assert_eq!(monitor.poll().unwrap(), 5);
        assert_eq!(monitor.last_size(), 30);
    }

    #[tokio::test]
    async fn test_supervise_reports_output_growth_until_exit() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join(".remux-test.mp4");
        let reporter = RecordingReporter::default();
        let mut task = reporter.start("ffmpeg clip.mp4", 8, ProgressUnit::Bytes);

        let supervisor = ConversionSupervisor::new(Duration::from_millis(20));
        let outcome = supervisor
            .supervise(
                shell("printf abc > \"$1\"; sleep 0.2; printf defgh >> \"$1\"", &output),
                &output,
                task.as_mut(),
            )
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.exit_code(), Some(0));
        assert_eq!(outcome.observed_bytes, 8);

        let tasks = reporter.snapshot();
        assert_eq!(tasks[0].position(), 8);
        assert!(tasks[0].deltas.iter().all(|d| *d > 0));
        assert!(tasks[0].finished);
    }

    #[tokio::test]
    async fn test_supervise_surfaces_nonzero_exit_and_stderr() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mp4");
        let reporter = RecordingReporter::default();
        let mut task = reporter.start("ffmpeg", 0, ProgressUnit::Bytes);

        let outcome = ConversionSupervisor::new(Duration::from_millis(20))
            .supervise(
                shell("echo 'Invalid data found when processing input' >&2; exit 3", &output),
                &output,
                task.as_mut(),
            )
            .await
            .unwrap();

        assert!(!outcome.success());
        assert_eq!(outcome.exit_code(), Some(3));
        assert_eq!(outcome.observed_bytes, 0);
        assert_eq!(outcome.stderr_tail, vec!["Invalid data found when processing input"]);
    }

    #[tokio::test]
    async fn test_supervise_keeps_only_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mp4");
        let reporter = RecordingReporter::default();
        let mut task = reporter.start("ffmpeg", 0, ProgressUnit::Bytes);

        let outcome = ConversionSupervisor::new(Duration::from_millis(20))
            .supervise(
                shell("i=0; while [ $i -lt 30 ]; do echo \"line $i\" >&2; i=$((i+1)); done", &output),
                &output,
                task.as_mut(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stderr_tail.len(), STDERR_TAIL_LINES);
        assert_eq!(outcome.stderr_tail.first().map(String::as_str), Some("line 10"));
        assert_eq!(outcome.stderr_tail.last().map(String::as_str), Some("line 29"));
    }

    #[tokio::test]
    async fn test_non_utf8_output_does_not_break_the_pipe() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mp4");
        let reporter = RecordingReporter::default();
        let mut task = reporter.start("ffmpeg", 0, ProgressUnit::Bytes);

        let script = "printf 'title: caf\\351\\n' >&2; \
                      i=0; while [ $i -lt 50 ]; do echo \"warning $i\" >&2; i=$((i+1)); done; \
                      printf remuxed > \"$1\"; exit 0";
        let outcome = ConversionSupervisor::new(Duration::from_millis(20))
            .supervise(shell(script, &output), &output, task.as_mut())
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(std::fs::read(&output).unwrap(), b"remuxed");
        assert_eq!(outcome.stderr_tail.len(), STDERR_TAIL_LINES);
        assert_eq!(outcome.stderr_tail.last().map(String::as_str), Some("warning 49"));
    }

    #[tokio::test]
    async fn test_forward_lines_replaces_invalid_bytes() {
        let input: &[u8] = b"caf\xe9\r\nplain\nno newline";
        let tail = forward_lines(input, "ffmpeg".to_string(), Level::Warn, 5).await;
        assert_eq!(tail, vec!["caf\u{FFFD}", "plain", "no newline"]);
    }

    #[tokio::test]
    async fn test_supervise_missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mp4");
        let reporter = RecordingReporter::default();
        let mut task = reporter.start("ffmpeg", 0, ProgressUnit::Bytes);

        let err = ConversionSupervisor::default()
            .supervise(Command::new("/nonexistent/ffmpeg"), &output, task.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(err, SuperviseError::Spawn { ref program, .. } if program == "/nonexistent/ffmpeg"));
    }

    proptest! {
        /// Summed deltas equal the largest size ever observed, whatever the sequence.
        #[test]
        fn prop_deltas_sum_to_peak(sizes in prop::collection::vec(0u64..1_000_000, 1..50)) {
            let mut last = 0u64;
            let mut total = 0u64;
            for size in &sizes {
                total += size_delta(last, *size);
                last = last.max(*size);
            }
            prop_assert_eq!(total, *sizes.iter().max().unwrap());
        }
    }
}
