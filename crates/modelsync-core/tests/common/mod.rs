//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use modelsync_core::remote::{normalize_path, ByteStream, EntryKind, RemoteEntry, RemoteStore};
use modelsync_core::{RemoteLocation, Result, SyncConfig, SyncDaemon, SyncError};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REMOTE_ROOT: &str = "hdfs://ns1/models";
const CHUNK_SIZE: usize = 16;

/// In-memory remote store with failure injection.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, Bytes>>,
    dirs: Mutex<BTreeSet<String>>,
    reads: Mutex<HashMap<String, usize>>,
    fail_after: Mutex<HashMap<String, usize>>,
    read_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let store = Self::default();
        store.mkdir("/models");
        Arc::new(store)
    }

    pub fn mkdir(&self, path: &str) {
        let path = normalize_path(path);
        let mut dirs = self.dirs.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            dirs.insert(current.clone());
        }
    }

    pub fn put(&self, path: &str, content: impl Into<Bytes>) {
        let path = normalize_path(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.mkdir(parent);
        }
        self.files.lock().unwrap().insert(path, content.into());
    }

    pub fn remove(&self, path: &str) {
        let path = normalize_path(path);
        let prefix = format!("{}/", path);
        self.files
            .lock()
            .unwrap()
            .retain(|p, _| p != &path && !p.starts_with(&prefix));
        self.dirs
            .lock()
            .unwrap()
            .retain(|p| p != &path && !p.starts_with(&prefix));
    }

    /// Reads of `path` deliver `bytes` bytes and then fail.
    pub fn fail_read_after(&self, path: &str, bytes: usize) {
        self.fail_after.lock().unwrap().insert(normalize_path(path), bytes);
    }

    pub fn clear_failures(&self) {
        self.fail_after.lock().unwrap().clear();
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    pub fn reads(&self, path: &str) -> usize {
        self.reads
            .lock()
            .unwrap()
            .get(&normalize_path(path))
            .copied()
            .unwrap_or(0)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = normalize_path(path);
        if !self.is_dir(&path) {
            return Err(SyncError::RemoteNotFound(path));
        }
        let prefix = format!("{}/", path);

        let mut children: BTreeMap<String, RemoteEntry> = BTreeMap::new();
        for dir in self.dirs.lock().unwrap().iter() {
            if let Some(name) = dir.strip_prefix(&prefix).filter(|n| !n.contains('/')) {
                children.insert(name.to_string(), entry(dir, EntryKind::Directory, 0));
            }
        }
        for (file, content) in self.files.lock().unwrap().iter() {
            if let Some(name) = file.strip_prefix(&prefix).filter(|n| !n.contains('/')) {
                children.insert(
                    name.to_string(),
                    entry(file, EntryKind::File, content.len() as u64),
                );
            }
        }
        Ok(children.into_values().collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry> {
        let path = normalize_path(path);
        if self.is_dir(&path) {
            return Ok(entry(&path, EntryKind::Directory, 0));
        }
        match self.files.lock().unwrap().get(&path) {
            Some(content) => Ok(entry(&path, EntryKind::File, content.len() as u64)),
            None => Err(SyncError::RemoteNotFound(path)),
        }
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        let path = normalize_path(path);
        let content = self
            .files
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or_else(|| SyncError::RemoteNotFound(path.clone()))?;
        *self.reads.lock().unwrap().entry(path.clone()).or_default() += 1;

        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail_after = self.fail_after.lock().unwrap().get(&path).copied();
        let mut chunks: Vec<Result<Bytes>> = Vec::new();
        let limit = fail_after.unwrap_or(content.len()).min(content.len());
        let mut offset = 0;
        while offset < limit {
            let end = (offset + CHUNK_SIZE).min(limit);
            chunks.push(Ok(content.slice(offset..end)));
            offset = end;
        }
        if fail_after.is_some() {
            chunks.push(Err(SyncError::Remote {
                message: format!("connection reset while reading {}", path),
                source: None,
            }));
        }
        Ok(Box::pin(stream::iter(chunks)))
    }
}

fn entry(path: &str, kind: EntryKind, size: u64) -> RemoteEntry {
    RemoteEntry {
        path: path.to_string(),
        name: path.rsplit('/').next().unwrap_or("").to_string(),
        kind,
        size,
        modified: None,
        checksum: None,
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Publish `<root>/<model>/<version>/` with the given files.
pub fn publish(store: &MemoryStore, model: &str, version: u64, files: &[(&str, &str)]) {
    let dir = format!("/models/{}/{}", model, version);
    store.mkdir(&dir);
    for (name, content) in files {
        store.put(&format!("{}/{}", dir, name), content.to_string());
    }
}

/// Publish a small SavedModel-shaped version.
pub fn publish_saved_model(store: &MemoryStore, model: &str, version: u64) {
    let graph = format!("graph {} v{}", model, version);
    let weights = format!("weights for {} version {} ............", model, version);
    publish(
        store,
        model,
        version,
        &[
            ("saved_model.pb", graph.as_str()),
            ("variables/variables.data-00000-of-00001", weights.as_str()),
            ("variables/variables.index", "index"),
        ],
    );
}

pub fn test_config(local_root: &Path) -> SyncConfig {
    SyncConfig {
        remote_root: Some(REMOTE_ROOT.to_string()),
        local_model_root: local_root.to_path_buf(),
        min_free_space_bytes: 0,
        retention: 2,
        max_fetch_per_model: 1,
        ..SyncConfig::default()
    }
}

pub fn daemon_with(store: Arc<MemoryStore>, config: SyncConfig) -> SyncDaemon {
    let location = RemoteLocation::parse(REMOTE_ROOT).unwrap();
    SyncDaemon::new(config, location, store)
}

/// Paths of all regular files under `dir`, relative to it.
pub fn files_under(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut files: Vec<String> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(dir)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}
