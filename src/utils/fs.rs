//! JSON files that are replaced atomically on every write.

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

use crate::core::error::StorageError;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A sibling temp name unique to this write, even among writers in one process.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}.{}.tmp", std::process::id(), seq));
    path.with_file_name(name)
}

/// Serialize `value` to `path` via a temp file, fsync and rename.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// `Ok(None)` when the file is missing or empty.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&content)?))
}

pub async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");

        assert!(read_json::<Vec<u32>>(&path).await.unwrap().is_none());

        write_json_atomic(&path, &vec![1u32, 2, 3]).await.unwrap();
        let back: Vec<u32> = read_json(&path).await.unwrap().unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        remove_if_exists(&path).await.unwrap();
        remove_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(matches!(
            read_json::<Vec<u32>>(&path).await,
            Err(StorageError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_a_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        assert_ne!(temp_path(&path), temp_path(&path));

        let writes = (0..16u32).map(|i| {
            let path = path.clone();
            tokio::spawn(async move { write_json_atomic(&path, &vec![i; 256]).await })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }

        let back: Vec<u32> = read_json(&path).await.unwrap().unwrap();
        assert_eq!(back.len(), 256);
        assert!(back.iter().all(|v| *v == back[0]));

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("shared.json")]);
    }
}
