//! On-disk layout of the local serving directory.
//!
//! ```text
//! LOCAL_ROOT/
//!   models.config                      (optional, generated)
//!   .modelsync.lock                    (held while a daemon owns the root)
//!   .modelsync-staging/
//!     <model>/<version>.<uuid>/        (one directory per fetch attempt)
//!     trash/<uuid>/                    (replaced versions awaiting removal)
//!   <model>/<version>/
//!     .modelsync-complete.json         (completion marker)
//!     saved_model.pb ...
//! ```
//!
//! A version directory without a marker is never treated as complete.

use crate::config::SyncDefaults;
use crate::error::{Result, SyncError};
use crate::metadata::{atomic_read_json, atomic_write_json};
use crate::model::{parse_version, validate_model_name, ManifestEntry, Version, VersionKey};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Written into a version directory after it is promoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub model: String,
    pub version: Version,
    /// Etag of the remote listing the version was fetched from.
    pub etag: String,
    pub total_bytes: u64,
    pub file_count: usize,
    pub source_path: String,
    pub promoted_at: DateTime<Utc>,
}

impl CompletionMarker {
    pub fn for_entry(entry: &ManifestEntry) -> Self {
        Self {
            model: entry.model.clone(),
            version: entry.version,
            etag: entry.etag.clone(),
            total_bytes: entry.size,
            file_count: entry.files.len(),
            source_path: entry.source_path.clone(),
            promoted_at: Utc::now(),
        }
    }
}

/// A version directory found at its final path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersion {
    pub version: Version,
    pub path: PathBuf,
    /// `None` for directories without a readable marker.
    pub marker: Option<CompletionMarker>,
}

impl LocalVersion {
    pub fn is_complete(&self) -> bool {
        self.marker.is_some()
    }
}

/// All version directories of one model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalModel {
    pub name: String,
    pub versions: BTreeMap<Version, LocalVersion>,
}

impl LocalModel {
    /// Versions with a completion marker, ascending.
    pub fn complete_versions(&self) -> impl DoubleEndedIterator<Item = Version> + '_ {
        self.versions
            .values()
            .filter(|v| v.is_complete())
            .map(|v| v.version)
    }

    pub fn newest_complete(&self) -> Option<Version> {
        self.complete_versions().next_back()
    }
}

/// Snapshot of the local serving directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    pub models: BTreeMap<String, LocalModel>,
}

impl LocalState {
    pub fn version(&self, key: &VersionKey) -> Option<&LocalVersion> {
        self.models
            .get(&key.model)
            .and_then(|m| m.versions.get(&key.version))
    }

    pub fn is_complete(&self, key: &VersionKey) -> bool {
        self.version(key).is_some_and(LocalVersion::is_complete)
    }
}

/// Exclusive ownership of a local root. Released on drop.
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release root lock");
        }
    }
}

/// Path arithmetic and filesystem operations on the local root.
#[derive(Debug, Clone)]
pub struct LocalLayout {
    root: PathBuf,
}

impl LocalLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, model: &str) -> Result<PathBuf> {
        validate_model_name(model)?;
        Ok(self.root.join(model))
    }

    pub fn version_dir(&self, model: &str, version: Version) -> Result<PathBuf> {
        Ok(self.model_dir(model)?.join(version.to_string()))
    }

    pub fn marker_path(&self, model: &str, version: Version) -> Result<PathBuf> {
        Ok(self
            .version_dir(model, version)?
            .join(SyncDefaults::MARKER_FILENAME))
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(SyncDefaults::STAGING_DIR_NAME)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.staging_root().join(SyncDefaults::TRASH_DIR_NAME)
    }

    /// Create the root and staging directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.staging_root()] {
            std::fs::create_dir_all(&dir).map_err(|e| SyncError::io_with_path(e, &dir))?;
        }
        Ok(())
    }

    /// Take the exclusive lock on this root. Fails if another process holds it.
    pub fn lock(&self) -> Result<RootLock> {
        std::fs::create_dir_all(&self.root).map_err(|e| SyncError::io_with_path(e, &self.root))?;
        let path = self.root.join(SyncDefaults::LOCK_FILENAME);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| SyncError::io_with_path(e, &path))?;
        file.try_lock_exclusive()
            .map_err(|_| SyncError::RootLocked(self.root.clone()))?;
        debug!(path = %path.display(), "Acquired root lock");
        Ok(RootLock { file, path })
    }

    /// Fresh, unique staging directory for one fetch attempt.
    pub fn new_staging_dir(&self, model: &str, version: Version) -> Result<PathBuf> {
        validate_model_name(model)?;
        let dir = self
            .staging_root()
            .join(model)
            .join(format!("{}.{}", version, Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).map_err(|e| SyncError::io_with_path(e, &dir))?;
        Ok(dir)
    }

    /// Move a directory into the trash and return its new location.
    pub fn move_to_trash(&self, path: &Path) -> Result<PathBuf> {
        let trash = self.trash_dir();
        std::fs::create_dir_all(&trash).map_err(|e| SyncError::io_with_path(e, &trash))?;
        let target = trash.join(Uuid::new_v4().simple().to_string());
        std::fs::rename(path, &target).map_err(|e| SyncError::io_with_path(e, path))?;
        Ok(target)
    }

    /// Remove everything left in staging by an earlier process.
    ///
    /// Returns the number of entries removed. Nothing here is ever promoted.
    pub fn cleanup_staging(&self) -> Result<usize> {
        let staging = self.staging_root();
        let entries = match std::fs::read_dir(&staging) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SyncError::io_with_path(e, &staging)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::io_with_path(e, &staging))?;
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove leftover staging entry"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed leftover staging entries from a previous run");
        }
        Ok(removed)
    }

    pub fn read_marker(&self, model: &str, version: Version) -> Result<Option<CompletionMarker>> {
        atomic_read_json(&self.marker_path(model, version)?)
    }

    pub fn write_marker(&self, marker: &CompletionMarker) -> Result<()> {
        atomic_write_json(&self.marker_path(&marker.model, marker.version)?, marker)
    }

    /// Scan models and versions at their final paths.
    pub fn scan(&self) -> Result<LocalState> {
        let mut state = LocalState::default();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
            Err(e) => return Err(SyncError::io_with_path(e, &self.root)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| SyncError::io_with_path(e, &self.root))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() || validate_model_name(&name).is_err() {
                continue;
            }
            let model = self.scan_model(&name, &entry.path())?;
            state.models.insert(name, model);
        }
        Ok(state)
    }

    fn scan_model(&self, name: &str, dir: &Path) -> Result<LocalModel> {
        let mut model = LocalModel {
            name: name.to_string(),
            versions: BTreeMap::new(),
        };
        let entries = std::fs::read_dir(dir).map_err(|e| SyncError::io_with_path(e, dir))?;
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::io_with_path(e, dir))?;
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let Some(version) = parse_version(&dir_name) else {
                continue;
            };
            if !entry.path().is_dir() {
                continue;
            }
            // "007" and "7" would both map to 7; only the canonical name is ours.
            if dir_name != version.to_string() {
                warn!(model = %name, dir = %dir_name, "Ignoring non-canonical version directory");
                continue;
            }

            let marker = match self.read_marker(name, version) {
                Ok(marker) => marker.filter(|m| m.model == name && m.version == version),
                Err(e) => {
                    warn!(model = %name, version, error = %e, "Unreadable completion marker");
                    None
                }
            };
            model.versions.insert(
                version,
                LocalVersion {
                    version,
                    path: entry.path(),
                    marker,
                },
            );
        }
        Ok(model)
    }
}

/// Join a `/`-separated relative path under `base`, rejecting anything that
/// could escape it.
pub fn resolve_relative(base: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    let mut out = base.to_path_buf();
    let mut depth = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => return Err(SyncError::UnsafePath(relative.to_string())),
        }
    }
    if depth == 0 || relative.contains('\\') {
        return Err(SyncError::UnsafePath(relative.to_string()));
    }
    Ok(out)
}
