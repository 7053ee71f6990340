//! Persisted state files with atomic replace semantics.
//!
//! A reader never observes a half-written file: data goes to a sibling temp
//! file, is fsynced, then renamed over the target.

use crate::error::{Result, VigilError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Write data to a file atomically using temp file + rename
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    // Same directory so the rename never crosses filesystems
    let temp_path = temp_path_for(path);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(VigilError::StateEncode)?;
    atomic_write(path, &data).map_err(|source| VigilError::StateIo {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Persisted {} bytes to {}", data.len(), path.display());
    Ok(())
}

/// Load a JSON state file. `Ok(None)` when the file does not exist; a file
/// that exists but does not parse is `StateCorrupted`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(VigilError::StateIo {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| VigilError::StateCorrupted {
            path: path.to_path_buf(),
            source,
        })
}

/// Delete a state file (no error if it doesn't exist)
pub fn safe_delete(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(VigilError::StateIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parent_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");

        atomic_write(&path, b"[1,2,3]").unwrap();
        atomic_write(&path, b"[4]").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[4]");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Vec<u32>> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_garbage_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let result: Result<Option<Vec<u32>>> = load_json(&path);
        assert!(matches!(result, Err(VigilError::StateCorrupted { .. })));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        save_json(&path, &vec![7u32, 8]).unwrap();
        let loaded: Option<Vec<u32>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![7, 8]));

        safe_delete(&path).unwrap();
        safe_delete(&path).unwrap();
        assert!(!path.exists());
    }
}
