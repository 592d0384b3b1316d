//! Durable run state on disk.
//!
//! - [`ArtifactStore`]: per-cycle outputs, append-only
//! - [`CheckpointStore`]: the one value that is ever overwritten, atomically
//! - [`RunLock`]: one orchestrator per run directory

pub mod artifact;
pub mod checkpoint;

pub use artifact::{ArtifactStore, CycleRecord, ManifestEntry};
pub use checkpoint::{Checkpoint, CheckpointStore};

use crate::errors::StoreError;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Replace `path` with `bytes` so readers see either the old or the new
/// content, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(|source| StoreError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|source| StoreError::WriteFailed {
                path: tmp.clone(),
                source,
            })?;
    }
    fs::rename(&tmp, path).map_err(|source| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        what: "json document",
        source,
    })?;
    write_atomic(path, &json)
}

/// Append one JSON line. Used for logs that only ever grow.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).map_err(|source| StoreError::Serialize {
        what: "jsonl record",
        source,
    })?;
    line.push('\n');
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(line.as_bytes()))
        .map_err(|source| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

/// Read every parsable line of a JSONL file. A missing file is empty;
/// unparsable lines (e.g. a torn final line after a crash) are skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(|source| StoreError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Exclusive advisory lock on `<run dir>/.soak.lock`, released on drop.
pub struct RunLock {
    file: fs::File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;
        let path = run_dir.join(".soak.lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| StoreError::Locked {
            path: run_dir.to_path_buf(),
        })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Line {
        n: u32,
    }

    #[test]
    fn test_write_atomic_replaces_content_and_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("value.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("value.json.tmp").exists());
    }

    #[test]
    fn test_jsonl_round_trip_skips_torn_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &Line { n: 1 }).unwrap();
        append_jsonl(&path, &Line { n: 2 }).unwrap();
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"n\": 3").unwrap();

        let lines: Vec<Line> = read_jsonl(&path).unwrap();
        assert_eq!(lines, vec![Line { n: 1 }, Line { n: 2 }]);
    }

    #[test]
    fn test_read_jsonl_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let lines: Vec<Line> = read_jsonl(&dir.path().join("nope.jsonl")).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_run_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
        let err = RunLock::acquire(dir.path()).err().unwrap();
        assert!(err.downcast_ref::<StoreError>().is_some());
        drop(lock);
        RunLock::acquire(dir.path()).unwrap();
    }
}
