//! Atomic file operations for markers and generated serving config.
//!
//! Writes go to a temp file with a unique PID+TID suffix, are fsynced, and
//! then renamed over the target so readers never observe a partial file.

use crate::{Result, SyncError};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
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
        Err(e) => return Err(SyncError::io_with_path(e, path)),
    };

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| SyncError::io_with_path(e, path))?;

    let data: T = serde_json::from_str(&contents).map_err(|e| SyncError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Serialize `data` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(data).map_err(|e| SyncError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;
    atomic_write_bytes(path, serialized.as_bytes())
}

/// Write bytes to `path` atomically.
///
/// 1. Write to `<name>.<pid>.<tid>.tmp` next to the target
/// 2. fsync the temp file
/// 3. Rename over the target
pub fn atomic_write_bytes(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| SyncError::io_with_path(e, parent))?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SyncError::Other(format!("Not a file path: {}", path.display())))?;
    let temp_path = path.with_file_name(format!(
        "{}.{}.{}.tmp",
        file_name,
        process::id(),
        thread_id()
    ));

    let written = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(contents)?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(SyncError::io_with_path(e, &temp_path));
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        SyncError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Get a unique thread identifier.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    format!("{:?}", thread::current().id()).hash(&mut hasher);
    hasher.finish()
}
