//! Atomic file operations for the cache index.
//!
//! Implements atomic writes using:
//! 1. Write to temp file with unique PID+TID suffix
//! 2. fsync to ensure data reaches disk
//! 3. Atomic rename to target path
//!
//! Readers therefore observe either the previous or the new index, never a
//! torn write.

use crate::error::{PretrainedError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use tracing::debug;

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PretrainedError::disk(
                format!("Failed to open {}", path.display()),
                path,
                e,
            ))
        }
    };

    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(|e| {
        PretrainedError::disk(format!("Failed to read {}", path.display()), path, e)
    })?;

    let data: T = serde_json::from_str(&contents).map_err(|e| PretrainedError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(std::sync::Arc::new(e)),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PretrainedError::disk(
                format!("Failed to create directory {}", parent.display()),
                parent,
                e,
            )
        })?;
    }

    let serialized = serde_json::to_string_pretty(data)?;
    let temp_path = temp_path_for(path);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| {
                PretrainedError::disk(
                    format!("Failed to create temp file {}", temp_path.display()),
                    &temp_path,
                    e,
                )
            })?;

        file.write_all(serialized.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                PretrainedError::disk(
                    format!("Failed to write temp file {}", temp_path.display()),
                    &temp_path,
                    e,
                )
            })?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        PretrainedError::disk(
            format!("Failed to rename {} to {}", temp_path.display(), path.display()),
            path,
            e,
        )
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Temp file next to `path`, unique per process and thread.
fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}.{}.tmp", file_name, process::id(), thread_id()))
}

/// Get a unique thread identifier.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn test_atomic_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");

        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        atomic_write_json(&path, &data).unwrap();
        assert!(path.exists());

        let read_data: Option<TestData> = atomic_read_json(&path).unwrap();
        assert_eq!(read_data, Some(data));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");

        for value in 0..3 {
            let data = TestData {
                name: "v".to_string(),
                value,
            };
            atomic_write_json(&path, &data).unwrap();
        }

        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_atomic_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nonexistent");

        let result: Option<TestData> = atomic_read_json(&path).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_atomic_read_malformed_is_json_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        fs::write(&path, "{ truncated").unwrap();

        let err = atomic_read_json::<TestData>(&path).unwrap_err();
        assert!(matches!(err, PretrainedError::Json { .. }));
    }

    #[test]
    fn test_atomic_write_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("index");

        let data = TestData {
            name: "nested".to_string(),
            value: 99,
        };

        atomic_write_json(&path, &data).unwrap();
        assert!(path.exists());
    }
}
