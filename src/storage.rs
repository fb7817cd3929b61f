//! Disk I/O for the distributed file.
//!
//! Each peer works inside `peer_<id>/` under the working directory: a seed
//! reads the file from there at startup and a downloader writes it there
//! once its piece store completes.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("seed file {path} is missing")]
    SeedMissing { path: String },

    #[error("seed file {path} is {actual} bytes, expected {expected}")]
    SeedLength {
        path: String,
        expected: u64,
        actual: u64,
    },
}

/// `<base>/peer_<id>`.
pub fn peer_dir(base: &Path, peer_id: u32) -> PathBuf {
    base.join(format!("peer_{peer_id}"))
}

/// Reads the seed copy of the file, validating its length against the
/// configured file size.
pub async fn load_seed(
    base: &Path,
    peer_id: u32,
    file_name: &str,
    expected_size: u64,
) -> Result<Bytes, StorageError> {
    let path = peer_dir(base, peer_id).join(file_name);

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::SeedMissing {
                path: path.display().to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if data.len() as u64 != expected_size {
        return Err(StorageError::SeedLength {
            path: path.display().to_string(),
            expected: expected_size,
            actual: data.len() as u64,
        });
    }

    Ok(Bytes::from(data))
}

/// Writes the assembled file, creating `peer_<id>/` if needed. Returns the
/// written path.
pub async fn persist(
    base: &Path,
    peer_id: u32,
    file_name: &str,
    data: &[u8],
) -> Result<PathBuf, StorageError> {
    let dir = peer_dir(base, peer_id);
    tokio::fs::create_dir_all(&dir).await?;

    let path = dir.join(file_name);
    tokio::fs::write(&path, data).await?;
    Ok(path)
}
