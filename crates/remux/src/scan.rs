use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::is_temp_output;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{} is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("Failed to list {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        source: walkdir::Error,
    },
}

/// Immediate entries of `dir`, sorted by name, following symlinks
fn entries(dir: &Path) -> impl Iterator<Item = Result<walkdir::DirEntry, walkdir::Error>> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
}

/// Every subdirectory of `root`, in sorted order. Each one is an item.
pub fn list_item_dirs(root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::NotADirectory {
            path: root.to_path_buf(),
        });
    }

    info!("Scanning directory: {}", root.display());

    let mut dirs = Vec::new();
    for entry in entries(root) {
        let entry = match entry {
            Ok(e) => e,
            // Depth 0 is the root itself: nothing can be listed.
            Err(e) if e.depth() == 0 => {
                return Err(ScanError::ReadDir {
                    path: root.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }

    info!("Found {} item directories in {}", dirs.len(), root.display());
    Ok(dirs)
}

/// Whether `file_name` carries one of `extensions`, compared case-insensitively
pub fn is_video_file(file_name: &str, extensions: &[String]) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Names of the files in `item_dir` that could be the item's original video.
///
/// In-flight conversion outputs are never candidates.
pub fn find_video_candidates(item_dir: &Path, extensions: &[String]) -> Result<Vec<String>, ScanError> {
    let mut videos = Vec::new();
    for name in file_names(item_dir)? {
        if is_temp_output(&name) {
            debug!("Ignoring conversion output {}", name);
            continue;
        }
        if is_video_file(&name, extensions) {
            videos.push(name);
        }
    }
    Ok(videos)
}

/// Leftover conversion outputs in `item_dir`
pub fn find_temp_outputs(item_dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
    Ok(file_names(item_dir)?
        .into_iter()
        .filter(|name| is_temp_output(name))
        .map(|name| item_dir.join(name))
        .collect())
}

fn file_names(dir: &Path) -> Result<Vec<String>, ScanError> {
    let mut names = Vec::new();
    for entry in entries(dir) {
        let entry = entry.map_err(|source| ScanError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
