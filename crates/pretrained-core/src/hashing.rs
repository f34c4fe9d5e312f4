//! Streaming SHA-256 computation for artifact files.
//!
//! Provides:
//! - A rolling checksum fed chunk by chunk while bytes arrive
//! - Whole-file hashing in a blocking task
//! - Normalization of checksum strings coming from registry indexes

use crate::error::{PretrainedError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Chunk size for reading files (8MB, optimal for SSDs).
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Incremental SHA-256 over a byte stream.
#[derive(Clone, Default)]
pub struct RollingChecksum {
    hasher: Sha256,
    bytes: u64,
}

impl RollingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    /// Feed the full contents of an existing file (a resumed prefix).
    pub async fn update_from_file(&mut self, path: &Path) -> Result<()> {
        use tokio::io::AsyncReadExt;

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| PretrainedError::disk_with_path(e, path))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| PretrainedError::disk_with_path(e, path))?;
            if read == 0 {
                break;
            }
            self.update(&buffer[..read]);
        }
        Ok(())
    }
}

/// Compute the SHA-256 of a file.
pub fn compute_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| PretrainedError::disk_with_path(e, path))?;

    let mut checksum = RollingChecksum::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| PretrainedError::disk_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        checksum.update(&buffer[..bytes_read]);
    }

    Ok(checksum.finalize_hex())
}

/// Normalize a checksum string to lowercase hex without an algorithm prefix.
///
/// Accepts `sha256:<hex>` and bare hex. Returns `None` for anything that is
/// not a 64-character hex digest.
pub fn normalize_checksum(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let hex_part = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex_part.to_ascii_lowercase())
    } else {
        None
    }
}

/// Hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
