//! `file://` remote store over a mounted filesystem.

use super::{file_name, ByteStream, EntryKind, RemoteEntry, RemoteStore};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_CHUNK_SIZE: usize = 256 * 1024;

/// Remote store backed by a local or mounted directory tree.
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> Self {
        Self
    }
}

fn map_io(err: std::io::Error, path: &str) -> SyncError {
    match err.kind() {
        ErrorKind::NotFound => SyncError::RemoteNotFound(path.to_string()),
        ErrorKind::PermissionDenied => SyncError::RemotePermissionDenied(path.to_string()),
        _ => SyncError::io_with_path(err, path),
    }
}

fn entry_from_metadata(path: &str, metadata: &std::fs::Metadata) -> RemoteEntry {
    let kind = if metadata.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    RemoteEntry {
        path: path.to_string(),
        name: file_name(path).to_string(),
        kind,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        checksum: None,
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    fn describe(&self) -> String {
        "local filesystem".to_string()
    }

    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| map_io(e, path))?;

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await.map_err(|e| map_io(e, path))? {
            let child = super::join_path(path, &item.file_name().to_string_lossy());
            // Follows symlinks so mounted trees behave like the real store.
            let metadata = match tokio::fs::metadata(item.path()).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(e, &child)),
            };
            entries.push(entry_from_metadata(&child, &metadata));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry> {
        let metadata = tokio::fs::metadata(Path::new(path))
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(entry_from_metadata(path, &metadata))
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| map_io(e, path))?;
        let owned_path = path.to_string();

        let chunks = stream::try_unfold(
            (file, owned_path, vec![0u8; READ_CHUNK_SIZE]),
            |(mut file, path, mut buffer)| async move {
                let read = match file.read(&mut buffer).await {
                    Ok(read) => read,
                    Err(e) => return Err(map_io(e, &path)),
                };
                if read == 0 {
                    return Ok(None);
                }
                let chunk = Bytes::copy_from_slice(&buffer[..read]);
                Ok(Some((chunk, (file, path, buffer))))
            },
        );
        Ok(Box::pin(chunks))
    }
}
