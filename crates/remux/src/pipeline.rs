//! Per-item state machine and the run loop over a scan root.
//!
//! Each item moves `NotStarted -> OriginalHashed -> Converting -> Converted -> Verified
//! -> Committed`, saving its record after every milestone. A run that dies anywhere
//! picks the item up again from the last saved milestone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use chrono::Utc;
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use thiserror::Error;

use crate::commit::{commit, finish_interrupted_commit, CommitError, CommittedNames};
use crate::config::RemuxConfig;
use crate::describe_exit;
use crate::digest::{digest_file, DigestError};
use crate::ffmpeg::detect_tool_version;
use crate::ffprobe::{blocked_streams, ProbeError};
use crate::progress::{ProgressReporter, ProgressUnit};
use crate::scan::{find_temp_outputs, find_video_candidates, list_item_dirs, ScanError};
use crate::state::{ItemRecord, ItemStage, StateError, StateStore};
use crate::supervisor::{ConversionSupervisor, SuperviseError};
use crate::{item_basename, temp_output_name};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cannot scan root: {0}")]
    Root(#[source] ScanError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Supervise(#[from] SuperviseError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("Conversion error - output file {} is 0 bytes", .path.display())]
    EmptyOutput { path: PathBuf },

    #[error(
        "Conversion of {} failed (exit code {}): {}",
        .input.display(),
        describe_exit(.exit_code),
        .stderr_tail.join(" | ")
    )]
    ConversionFailed {
        input: PathBuf,
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    #[error("Failed to remove leftover output {}: {source}", .path.display())]
    Cleanup { path: PathBuf, source: io::Error },

    #[error("Failed to stat output {}: {source}", .path.display())]
    OutputStat { path: PathBuf, source: io::Error },

    #[error("Item directory {} has no usable name", .path.display())]
    InvalidItemDir { path: PathBuf },
}

impl PipelineError {
    /// Errors that point at the environment rather than one item, and so end the run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Root(_)
                | PipelineError::Probe(_)
                | PipelineError::Supervise(SuperviseError::Spawn { .. })
                | PipelineError::EmptyOutput { .. }
        )
    }

    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// What happened to an item that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    AlreadyComplete,
    NoVideo,
    AmbiguousVideos(Vec<String>),
    Completed(CommittedNames),
}

/// Counts for one run over a root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub already_complete: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed(_) => self.completed += 1,
            ItemOutcome::AlreadyComplete => self.already_complete += 1,
            ItemOutcome::NoVideo | ItemOutcome::AmbiguousVideos(_) => self.skipped += 1,
        }
    }
}

pub struct PipelineDriver {
    cfg: RemuxConfig,
    supervisor: ConversionSupervisor,
    reporter: Arc<dyn ProgressReporter>,
    /// Detected on the first conversion of a run
    tool_version: Option<Option<String>>,
}

impl PipelineDriver {
    pub fn new(cfg: RemuxConfig, reporter: Arc<dyn ProgressReporter>) -> Self {
        let supervisor = ConversionSupervisor::new(cfg.monitor_interval());
        Self {
            cfg,
            supervisor,
            reporter,
            tool_version: None,
        }
    }

    /// Process every subdirectory of `root` in sorted order.
    ///
    /// Per-item failures are logged and counted; a fatal error stops the run.
    pub async fn run(&mut self, root: &Path) -> Result<RunSummary, PipelineError> {
        let dirs = list_item_dirs(root).map_err(PipelineError::Root)?;
        info!("working in directory {}", root.display());

        let mut total = self
            .reporter
            .start("Total Progress", dirs.len() as u64, ProgressUnit::Items);
        let mut summary = RunSummary::default();

        for dir in &dirs {
            match self.process_item(dir).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) if e.is_fatal() => {
                    total.finish();
                    return Err(e);
                }
                Err(e) => {
                    error!("{}: {}", dir.display(), e);
                    summary.failed += 1;
                }
            }
            total.advance(1);
        }
        total.finish();

        info!(
            "Run complete: {} converted, {} already complete, {} skipped, {} failed",
            summary.completed, summary.already_complete, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Drive one item as far as it can go
    pub async fn process_item(&mut self, dir: &Path) -> Result<ItemOutcome, PipelineError> {
        info!("processing: {}", dir.display());

        let basename = item_basename(dir).ok_or_else(|| PipelineError::InvalidItemDir {
            path: dir.to_path_buf(),
        })?;
        let store = StateStore::for_item(dir, &basename);
        let record = store.load()?;

        if record.is_complete() {
            info!("{} is complete", dir.display());
            return Ok(ItemOutcome::AlreadyComplete);
        }

        if record.stage() == ItemStage::Verified {
            if let Some(names) = resume_commit(dir, &record)? {
                stamp_complete(&store, record, &names)?;
                return Ok(ItemOutcome::Completed(names));
            }
        }

        let mut candidates = find_video_candidates(dir, &self.cfg.video_extensions)?;
        if candidates.is_empty() {
            warn!("no video files present in {}", dir.display());
            return Ok(ItemOutcome::NoVideo);
        }
        if candidates.len() > 1 {
            warn!("multiple video files in {}: {:?}", dir.display(), candidates);
            return Ok(ItemOutcome::AmbiguousVideos(candidates));
        }
        let video = candidates.remove(0);
        let original = dir.join(&video);
        info!("working on {}", video);

        if let Some(names) = commit_verified_output(dir, &video, &record)? {
            stamp_complete(&store, record, &names)?;
            return Ok(ItemOutcome::Completed(names));
        }

        let record = if record.original_digest_for(&video).is_some() {
            info!("original digest of {} already recorded", video);
            record
        } else {
            if let Some(previous) = &record.original {
                warn!(
                    "record in {} describes {} but the directory holds {}; hashing again",
                    store.path().display(),
                    previous.filename,
                    video
                );
            }
            let digest = digest_file(
                &original,
                &format!("original md5 {}", video),
                self.reporter.as_ref(),
            )?;
            let record = record.with_original(video.as_str(), digest);
            store.save(&record)?;
            record
        };

        remove_leftover_outputs(dir)?;

        let exclude = blocked_streams(&self.cfg.ffprobe_bin, &original, &self.cfg.blocked_codecs).await?;
        info!("blocked streams in {}: {:?}", video, exclude);

        let tool_version = self.tool_version().await;
        let record = record.conversion_started(tool_version);
        store.save(&record)?;

        let output_name = temp_output_name();
        let output = dir.join(&output_name);
        info!("writing remuxed file to: {}", output.display());

        let outcome = self
            .supervisor
            .convert(
                &self.cfg.ffmpeg_bin,
                &original,
                &output,
                &exclude,
                self.reporter.as_ref(),
                &format!("ffmpeg {}", video),
            )
            .await?;

        if !outcome.success() {
            remove_if_present(&output);
            return Err(PipelineError::ConversionFailed {
                input: original,
                exit_code: outcome.exit_code(),
                stderr_tail: outcome.stderr_tail,
            });
        }

        let size = output_size(&output)?;
        if size == 0 {
            remove_if_present(&output);
            return Err(PipelineError::EmptyOutput { path: output });
        }
        info!("exit code 0, {} is {}", output.display(), format_size(size, DECIMAL));

        let record = record.with_converted_output(output_name.as_str());
        store.save(&record)?;

        info!("calculating remuxed md5");
        let digest = digest_file(
            &output,
            &format!("converted md5 {}", video),
            self.reporter.as_ref(),
        )?;
        let record = record.with_output_digest(digest);
        store.save(&record)?;

        let names = commit(&original, &output, dir)?;
        stamp_complete(&store, record, &names)?;
        Ok(ItemOutcome::Completed(names))
    }

    async fn tool_version(&mut self) -> Option<String> {
        if self.tool_version.is_none() {
            let detected = detect_tool_version(&self.cfg.ffmpeg_bin).await;
            match &detected {
                Some(version) => info!("transcoder: {}", version),
                None => warn!("Could not determine the transcoder version"),
            }
            self.tool_version = Some(detected);
        }
        self.tool_version.clone().flatten()
    }
}

/// Finish an item whose renames were cut short, if that is what the directory shows.
fn resume_commit(dir: &Path, record: &ItemRecord) -> Result<Option<CommittedNames>, PipelineError> {
    let (Some(original), Some(output)) = (&record.original, &record.output) else {
        return Ok(None);
    };
    let names = finish_interrupted_commit(
        &dir.join(&original.filename),
        &dir.join(&output.filename),
        dir,
    )?;
    Ok(names)
}

/// Commit an output verified by an earlier run, if the original it was made from and
/// the output itself are both still in place.
fn commit_verified_output(
    dir: &Path,
    video: &str,
    record: &ItemRecord,
) -> Result<Option<CommittedNames>, PipelineError> {
    if record.stage() != ItemStage::Verified || record.original_digest_for(video).is_none() {
        return Ok(None);
    }
    let Some(output) = &record.output else {
        return Ok(None);
    };
    let output = dir.join(&output.filename);
    if !output.is_file() {
        return Ok(None);
    }
    info!("{} was verified by an earlier run, committing it", output.display());
    Ok(Some(commit(&dir.join(video), &output, dir)?))
}

fn stamp_complete(
    store: &StateStore,
    record: ItemRecord,
    names: &CommittedNames,
) -> Result<(), PipelineError> {
    let record = record.committed(
        names.original_target.as_str(),
        names.output_target.as_str(),
        Utc::now(),
    );
    store.save(&record)?;
    info!("{} is complete", store.path().display());
    Ok(())
}

fn remove_leftover_outputs(dir: &Path) -> Result<(), PipelineError> {
    for stale in find_temp_outputs(dir)? {
        warn!("removing leftover conversion output {}", stale.display());
        fs::remove_file(&stale).map_err(|source| PipelineError::Cleanup {
            path: stale.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Size of a finished output; a missing file counts as empty.
fn output_size(path: &Path) -> Result<u64, PipelineError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(PipelineError::OutputStat {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
