//! Final renames that make a converted item visible under its permanent names.
//!
//! `clip.mp4` becomes `clip.mp4.orig` and the temporary output becomes
//! `<basename>.mp4`, both inside the item directory. Neither rename may replace an
//! existing file, and a failed second rename puts the original back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use log::{error, info, warn};
use thiserror::Error;

use crate::{archived_original_path, final_output_path, item_basename};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Refusing to overwrite existing {}", .path.display())]
    DestinationExists { path: PathBuf },

    #[error("Failed to rename {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("Item directory {} has no usable name", .path.display())]
    InvalidItemDir { path: PathBuf },
}

/// File names (not paths) the original and output ended up under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedNames {
    pub original_target: String,
    pub output_target: String,
}

struct CommitPaths {
    archive: PathBuf,
    final_output: PathBuf,
    names: CommittedNames,
}

fn commit_paths(original: &Path, item_dir: &Path) -> Result<CommitPaths, CommitError> {
    let basename = item_basename(item_dir).ok_or_else(|| CommitError::InvalidItemDir {
        path: item_dir.to_path_buf(),
    })?;
    let archive = archived_original_path(original);
    let final_output = final_output_path(item_dir, &basename);
    let names = CommittedNames {
        original_target: file_name_of(&archive),
        output_target: file_name_of(&final_output),
    };
    Ok(CommitPaths {
        archive,
        final_output,
        names,
    })
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn ensure_vacant(path: &Path) -> Result<(), CommitError> {
    if fs::symlink_metadata(path).is_ok() {
        return Err(CommitError::DestinationExists {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn rename(from: &Path, to: &Path) -> Result<(), CommitError> {
    fs::rename(from, to).map_err(|source| CommitError::Rename {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

/// Archive the original and move the output into its final name.
pub fn commit(original: &Path, output: &Path, item_dir: &Path) -> Result<CommittedNames, CommitError> {
    let paths = commit_paths(original, item_dir)?;

    ensure_vacant(&paths.archive)?;
    rename(original, &paths.archive)?;
    info!("renamed {} to {}", original.display(), paths.archive.display());

    // Checked after the first rename: the final name may be the original's own name.
    if let Err(e) = ensure_vacant(&paths.final_output).and_then(|_| rename(output, &paths.final_output)) {
        roll_back(&paths.archive, original);
        return Err(e);
    }
    info!("renamed {} to {}", output.display(), paths.final_output.display());

    Ok(paths.names)
}

fn roll_back(archive: &Path, original: &Path) {
    match fs::rename(archive, original) {
        Ok(()) => warn!("restored {} after failed commit", original.display()),
        Err(e) => error!(
            "Failed to restore {} from {}: {}",
            original.display(),
            archive.display(),
            e
        ),
    }
}

/// Finish a commit that was cut short after the original was archived.
///
/// Returns `None` when the directory does not look like an interrupted commit of
/// `original` and `output`, leaving the caller to treat the item normally.
pub fn finish_interrupted_commit(
    original: &Path,
    output: &Path,
    item_dir: &Path,
) -> Result<Option<CommittedNames>, CommitError> {
    let paths = commit_paths(original, item_dir)?;

    if !paths.archive.exists() {
        return Ok(None);
    }

    if output.exists() && !original.exists() {
        ensure_vacant(&paths.final_output)?;
        rename(output, &paths.final_output)?;
        info!(
            "finished interrupted commit: renamed {} to {}",
            output.display(),
            paths.final_output.display()
        );
        return Ok(Some(paths.names));
    }

    // Both renames happened but the record was never stamped.
    let original_free = !original.exists() || original == paths.final_output.as_path();
    if !output.exists() && paths.final_output.exists() && original_free {
        info!(
            "commit of {} already done, only the record is missing it",
            paths.final_output.display()
        );
        return Ok(Some(paths.names));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Item {
        _root: TempDir,
        dir: PathBuf,
    }

    impl Item {
        fn new(name: &str) -> Self {
            let root = TempDir::new().unwrap();
            let dir = root.path().join(name);
            fs::create_dir(&dir).unwrap();
            Self { _root: root, dir }
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.dir.join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        fn read(&self, name: &str) -> String {
            fs::read_to_string(self.dir.join(name)).unwrap()
        }

        fn exists(&self, name: &str) -> bool {
            self.dir.join(name).exists()
        }
    }

    #[test]
    fn test_commit_renames_both_files() {
        let item = Item::new("movie");
        let original = item.write("clip.mp4", "original");
        let output = item.write(".remux-1.mp4", "converted");

        let names = commit(&original, &output, &item.dir).unwrap();
        assert_eq!(
            names,
            CommittedNames {
                original_target: "clip.mp4.orig".to_string(),
                output_target: "movie.mp4".to_string(),
            }
        );
        assert_eq!(item.read("clip.mp4.orig"), "original");
        assert_eq!(item.read("movie.mp4"), "converted");
        assert!(!item.exists("clip.mp4"));
        assert!(!item.exists(".remux-1.mp4"));
    }

    #[test]
    fn test_commit_when_original_already_has_final_name() {
        let item = Item::new("movie");
        let original = item.write("movie.mp4", "original");
        let output = item.write(".remux-1.mp4", "converted");

        commit(&original, &output, &item.dir).unwrap();
        assert_eq!(item.read("movie.mp4.orig"), "original");
        assert_eq!(item.read("movie.mp4"), "converted");
    }

    #[test]
    fn test_existing_archive_blocks_commit() {
        let item = Item::new("movie");
        let original = item.write("clip.mp4", "original");
        let output = item.write(".remux-1.mp4", "converted");
        item.write("clip.mp4.orig", "older backup");

        let err = commit(&original, &output, &item.dir).unwrap_err();
        assert!(matches!(err, CommitError::DestinationExists { .. }));
        assert_eq!(item.read("clip.mp4"), "original");
        assert_eq!(item.read("clip.mp4.orig"), "older backup");
        assert!(item.exists(".remux-1.mp4"));
    }

    #[test]
    fn test_existing_final_output_rolls_back_original() {
        let item = Item::new("movie");
        let original = item.write("clip.mp4", "original");
        let output = item.write(".remux-1.mp4", "converted");
        item.write("movie.mp4", "someone else's file");

        let err = commit(&original, &output, &item.dir).unwrap_err();
        assert!(matches!(err, CommitError::DestinationExists { ref path } if path.ends_with("movie.mp4")));
        assert_eq!(item.read("clip.mp4"), "original");
        assert!(!item.exists("clip.mp4.orig"));
        assert_eq!(item.read("movie.mp4"), "someone else's file");
    }

    #[test]
    fn test_missing_output_rolls_back_original() {
        let item = Item::new("movie");
        let original = item.write("clip.mp4", "original");
        let output = item.dir.join(".remux-gone.mp4");

        let err = commit(&original, &output, &item.dir).unwrap_err();
        assert!(matches!(err, CommitError::Rename { .. }));
        assert_eq!(item.read("clip.mp4"), "original");
        assert!(!item.exists("clip.mp4.orig"));
    }

    #[test]
    fn test_finish_after_first_rename() {
        let item = Item::new("movie");
        item.write("clip.mp4.orig", "original");
        let output = item.write(".remux-1.mp4", "converted");

        let names = finish_interrupted_commit(&item.dir.join("clip.mp4"), &output, &item.dir)
            .unwrap()
            .unwrap();
        assert_eq!(names.output_target, "movie.mp4");
        assert_eq!(item.read("movie.mp4"), "converted");
        assert!(!item.exists(".remux-1.mp4"));
    }

    #[test]
    fn test_finish_after_both_renames() {
        let item = Item::new("movie");
        item.write("clip.mp4.orig", "original");
        item.write("movie.mp4", "converted");

        let names = finish_interrupted_commit(
            &item.dir.join("clip.mp4"),
            &item.dir.join(".remux-1.mp4"),
            &item.dir,
        )
        .unwrap()
        .unwrap();
        assert_eq!(names.original_target, "clip.mp4.orig");
    }

    #[test]
    fn test_same_name_commit_completed_before_record() {
        let item = Item::new("movie");
        item.write("movie.mp4.orig", "original");
        item.write("movie.mp4", "converted");

        let names = finish_interrupted_commit(
            &item.dir.join("movie.mp4"),
            &item.dir.join(".remux-1.mp4"),
            &item.dir,
        )
        .unwrap();
        assert!(names.is_some());
    }

    #[test]
    fn test_untouched_item_is_not_an_interrupted_commit() {
        let item = Item::new("movie");
        let original = item.write("clip.mp4", "original");
        let output = item.write(".remux-1.mp4", "converted");

        assert_eq!(finish_interrupted_commit(&original, &output, &item.dir).unwrap(), None);
        assert!(item.exists("clip.mp4"));
        assert!(item.exists(".remux-1.mp4"));
    }

    #[test]
    fn test_archive_next_to_live_original_is_not_an_interrupted_commit() {
        let item = Item::new("movie");
        let original = item.write("clip.mp4", "original");
        item.write("clip.mp4.orig", "older backup");
        let output = item.write(".remux-1.mp4", "converted");

        assert_eq!(finish_interrupted_commit(&original, &output, &item.dir).unwrap(), None);
    }
}
