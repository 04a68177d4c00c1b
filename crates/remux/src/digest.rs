//! Streaming MD5 digests of (possibly multi-gigabyte) media files.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::progress::{ProgressReporter, ProgressUnit};

/// Bytes read per step; keeps memory flat regardless of file size.
pub const DIGEST_BLOCK_SIZE: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("Failed to open {} for hashing: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to read {} while hashing: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
}

/// Compute the lowercase hex MD5 of a file, reporting bytes consumed to `reporter`.
pub fn digest_file(
    path: &Path,
    label: &str,
    reporter: &dyn ProgressReporter,
) -> Result<String, DigestError> {
    let mut file = File::open(path).map_err(|source| DigestError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let total = file
        .metadata()
        .map_err(|source| DigestError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    let mut task = reporter.start(label, total, ProgressUnit::Bytes);
    let mut context = md5::Context::new();
    let mut buf = [0u8; DIGEST_BLOCK_SIZE];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                task.finish();
                return Err(DigestError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        context.consume(&buf[..n]);
        task.advance(n as u64);
    }
    task.finish();

    Ok(format!("{:x}", context.compute()))
}
