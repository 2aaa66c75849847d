//! Atomic JSON persistence.
//!
//! Writes go to a temp file with a PID + random suffix next to the target,
//! are fsynced, then renamed over the target, so readers only ever see a
//! complete previous or complete new file.

use crate::error::{CacheError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Read and parse a JSON file.
///
/// Parse failures are reported as `InvalidData` so callers can treat "missing"
/// and "unreadable" alike.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let contents = fs::read(path).await?;
    serde_json::from_slice(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write data to a JSON file atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = serde_json::to_vec(data).map_err(|e| CacheError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    let temp_path = temp_path_for(path);
    if let Err(e) = write_synced(&temp_path, &serialized).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::io(
            format!("Failed to write temp file {}", temp_path.display()),
            temp_path,
            e,
        ));
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::io(
            format!("Failed to rename {} to {}", temp_path.display(), path.display()),
            path,
            e,
        ));
    }

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

async fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_all().await
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.{:08x}.tmp", process::id(), rand::random::<u32>()));
    PathBuf::from(name)
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

    #[tokio::test]
    async fn test_atomic_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("123.json");

        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };
        write_json_atomic(&path, &data).await.unwrap();

        let read_back: TestData = read_json(&path).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_and_leaves_no_temp() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1.json");

        for value in [1, 2] {
            let data = TestData {
                name: "v".to_string(),
                value,
            };
            write_json_atomic(&path, &data).await.unwrap();
        }

        let read_back: TestData = read_json(&path).await.unwrap();
        assert_eq!(read_back.value, 2);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = read_json::<TestData>(&temp_dir.path().join("nope.json")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_read_garbage_is_invalid_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, b"{\"name\":").unwrap();

        let err = read_json::<TestData>(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_into_missing_directory_fails_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing").join("1.json");
        let err = write_json_atomic(&path, &1).await.unwrap_err();
        assert!(err.is_persistence());
    }
}
