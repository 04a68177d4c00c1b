pub mod commit;
pub mod config;
pub mod digest;
pub mod ffmpeg;
pub mod ffprobe;
pub mod pipeline;
pub mod progress;
pub mod scan;
pub mod state;
pub mod supervisor;

pub use commit::{CommitError, CommittedNames};
pub use config::RemuxConfig;
pub use ffprobe::{FFProbeData, FFProbeStream, ProbeError};
pub use pipeline::{ItemOutcome, PipelineDriver, PipelineError, RunSummary};
pub use progress::{LogProgress, NoProgress, ProgressReporter, ProgressTask, ProgressUnit};
pub use state::{ItemRecord, ItemStage, ItemStatus, StateStore};
pub use supervisor::{ConversionOutcome, ConversionSupervisor};

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prefix of in-flight conversion outputs. Files carrying it are never originals.
pub const TEMP_OUTPUT_PREFIX: &str = ".remux-";

/// Suffix appended to the original once it has been replaced
pub const ORIGINAL_SUFFIX: &str = ".orig";

/// Container extension of every converted output
pub const OUTPUT_EXTENSION: &str = "mp4";

/// Name of the item directory, which names its record and final output
pub fn item_basename(item_dir: &Path) -> Option<String> {
    item_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// `<item_dir>/<basename>.json`
pub fn state_file_path(item_dir: &Path, basename: &str) -> PathBuf {
    item_dir.join(format!("{}.json", basename))
}

/// `<item_dir>/<basename>.mp4`
pub fn final_output_path(item_dir: &Path, basename: &str) -> PathBuf {
    item_dir.join(format!("{}.{}", basename, OUTPUT_EXTENSION))
}

/// The original's path with `.orig` appended in place (`clip.mp4` -> `clip.mp4.orig`)
pub fn archived_original_path(original: &Path) -> PathBuf {
    let mut archived = original.as_os_str().to_owned();
    archived.push(ORIGINAL_SUFFIX);
    PathBuf::from(archived)
}

/// A fresh, unique name for a conversion output
pub fn temp_output_name() -> String {
    format!("{}{}.{}", TEMP_OUTPUT_PREFIX, Uuid::new_v4(), OUTPUT_EXTENSION)
}

pub fn is_temp_output(file_name: &str) -> bool {
    file_name.starts_with(TEMP_OUTPUT_PREFIX)
}

/// Render a process exit code for messages; `None` means killed by a signal.
pub(crate) fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}
