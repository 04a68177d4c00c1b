//! Durable per-item record, the single source of truth for resuming.
//!
//! The record is an owned value: each pipeline milestone consumes it, returns the
//! updated record, and the driver saves the whole document before moving on.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state_file_path;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read item record {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Item record {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize item record {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write item record {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to move {} into place as {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Recorded as `tool-version` when the transcoder would not report its version
pub const UNKNOWN_TOOL_VERSION: &str = "unknown";

/// Overall progress of an item. `Absent` is never written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    #[default]
    Absent,
    InProgress,
    Complete,
}

impl ItemStatus {
    pub fn is_absent(&self) -> bool {
        matches!(self, ItemStatus::Absent)
    }
}

/// One side of the conversion: the original or the new output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    #[serde(default, alias = "md5", skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Name after commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl FileEntry {
    pub fn named(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }
}

/// Where an item stands, derived from which milestones its record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemStage {
    NotStarted,
    OriginalHashed,
    Converting,
    Converted,
    Verified,
    Committed,
}

/// Contents of `<basename>.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    #[serde(default, skip_serializing_if = "ItemStatus::is_absent")]
    pub status: ItemStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<FileEntry>,

    #[serde(rename = "new", default, skip_serializing_if = "Option::is_none")]
    pub output: Option<FileEntry>,

    #[serde(
        rename = "tool-version",
        alias = "ffmpeg",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_version: Option<String>,

    /// Completion time, seconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Completion time as local ISO-8601 with offset
    #[serde(
        rename = "iso-timestamp",
        alias = "isotimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub iso_timestamp: Option<String>,
}

impl ItemRecord {
    pub fn is_complete(&self) -> bool {
        self.status == ItemStatus::Complete
    }

    pub fn stage(&self) -> ItemStage {
        if self.is_complete() {
            return ItemStage::Committed;
        }
        if self.original.as_ref().and_then(|o| o.digest.as_ref()).is_none() {
            return ItemStage::NotStarted;
        }
        match &self.output {
            Some(output) if output.digest.is_some() => ItemStage::Verified,
            Some(_) => ItemStage::Converted,
            None if self.tool_version.is_some() => ItemStage::Converting,
            None => ItemStage::OriginalHashed,
        }
    }

    /// The recorded digest of `filename`, if the record describes that file
    pub fn original_digest_for(&self, filename: &str) -> Option<&str> {
        self.original
            .as_ref()
            .filter(|original| original.filename == filename)
            .and_then(|original| original.digest.as_deref())
    }

    /// Original hashed. Starts the item over if the record described another file.
    pub fn with_original(self, filename: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::InProgress,
            original: Some(FileEntry {
                filename: filename.into(),
                digest: Some(digest.into()),
                target: None,
            }),
            ..Default::default()
        }
    }

    /// Conversion launched; anything recorded about an earlier output is void.
    ///
    /// The tool version doubles as the marker of this milestone, so an undetectable
    /// version is still recorded, as [`UNKNOWN_TOOL_VERSION`].
    pub fn conversion_started(mut self, tool_version: Option<String>) -> Self {
        self.status = ItemStatus::InProgress;
        self.output = None;
        self.tool_version = Some(tool_version.unwrap_or_else(|| UNKNOWN_TOOL_VERSION.to_string()));
        self
    }

    /// Conversion exited cleanly with a non-empty output
    pub fn with_converted_output(mut self, filename: impl Into<String>) -> Self {
        self.output = Some(FileEntry::named(filename));
        self
    }

    pub fn with_output_digest(mut self, digest: impl Into<String>) -> Self {
        if let Some(output) = self.output.as_mut() {
            output.digest = Some(digest.into());
        }
        self
    }

    /// Both renames done: stamp targets and completion time
    pub fn committed(
        mut self,
        original_target: impl Into<String>,
        output_target: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        if let Some(original) = self.original.as_mut() {
            original.target = Some(original_target.into());
        }
        if let Some(output) = self.output.as_mut() {
            output.target = Some(output_target.into());
        }
        self.status = ItemStatus::Complete;
        self.timestamp = Some(at.timestamp());
        self.iso_timestamp = Some(
            at.with_timezone(&Local)
                .to_rfc3339_opts(SecondsFormat::Secs, false),
        );
        self
    }
}

/// Loads and atomically replaces one item's record
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn for_item(item_dir: &Path, basename: &str) -> Self {
        Self {
            path: state_file_path(item_dir, basename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record; a missing file is an empty record.
    pub fn load(&self) -> Result<ItemRecord, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ItemRecord::default()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the record wholesale: write a sibling temp file, fsync, rename over.
    pub fn save(&self, record: &ItemRecord) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(record).map_err(|source| StateError::Serialize {
            path: self.path.clone(),
            source,
        })?;

        let temp_path = self.temp_path();
        if let Err(source) = write_synced(&temp_path, &json) {
            let _ = fs::remove_file(&temp_path);
            return Err(StateError::Write {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StateError::Rename {
                from: temp_path,
                to: self.path.clone(),
                source,
            });
        }

        debug!("Saved item record {} ({:?})", self.path.display(), record.stage());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
