//! Model, version, and manifest types.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer revision of a model. Directory names like `"7"` or `"0007"` both
/// parse to version 7.
pub type Version = u64;

/// Parse a version directory name.
pub fn parse_version(name: &str) -> Option<Version> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Check that a model name is a single safe path component.
pub fn validate_model_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name == "..";
    if bad {
        return Err(SyncError::InvalidModelName(name.to_string()));
    }
    Ok(())
}

/// Key identifying one version of one model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionKey {
    pub model: String,
    pub version: Version,
}

impl VersionKey {
    pub fn new(model: impl Into<String>, version: Version) -> Self {
        Self {
            model: model.into(),
            version,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.version)
    }
}

/// Where a version is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    /// Exists upstream only.
    Remote,
    /// Partially fetched, not visible to the server.
    Staging,
    /// Fully present and visible.
    Local,
    /// Superseded and pending cleanup.
    Stale,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionState::Remote => "remote",
            VersionState::Staging => "staging",
            VersionState::Local => "local",
            VersionState::Stale => "stale",
        }
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file inside a remote version directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the version directory, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Lowercase hex SHA-256 when the upstream publishes one.
    pub checksum: Option<String>,
}

/// A remote model version as seen in one listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub model: String,
    pub version: Version,
    /// Remote path of the version directory.
    pub source_path: String,
    /// Total bytes across all files.
    pub size: u64,
    /// Fingerprint over the file list; changes when any file changes.
    pub etag: String,
    pub files: Vec<ManifestFile>,
}

impl ManifestEntry {
    /// Build an entry, sorting files and computing size and etag.
    pub fn new(
        model: impl Into<String>,
        version: Version,
        source_path: impl Into<String>,
        mut files: Vec<ManifestFile>,
    ) -> Self {
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let size = files.iter().map(|f| f.size).sum();
        let etag = compute_etag(&files);
        Self {
            model: model.into(),
            version,
            source_path: source_path.into(),
            size,
            etag,
            files,
        }
    }

    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.model.clone(), self.version)
    }
}

/// BLAKE3 fingerprint of a sorted file list.
fn compute_etag(files: &[ManifestFile]) -> String {
    let mut hasher = blake3::Hasher::new();
    for file in files {
        hasher.update(file.relative_path.as_bytes());
        hasher.update(&[0]);
        hasher.update(&file.size.to_le_bytes());
        if let Some(modified) = file.modified {
            hasher.update(&modified.timestamp_millis().to_le_bytes());
        }
        if let Some(checksum) = &file.checksum {
            hasher.update(checksum.as_bytes());
        }
        hasher.update(&[0xff]);
    }
    hasher.finalize().to_hex()[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> ManifestFile {
        ManifestFile {
            relative_path: path.to_string(),
            size,
            modified: None,
            checksum: None,
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1"), Some(1));
        assert_eq!(parse_version("0007"), Some(7));
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("v1"), None);
        assert_eq!(parse_version("-1"), None);
        assert_eq!(parse_version("1.tmp"), None);
    }

    #[test]
    fn test_validate_model_name() {
        assert!(validate_model_name("resnet_50").is_ok());
        assert!(validate_model_name("model-a.v2").is_ok());
        assert!(validate_model_name("").is_err());
        assert!(validate_model_name("..").is_err());
        assert!(validate_model_name(".hidden").is_err());
        assert!(validate_model_name("a/b").is_err());
    }

    #[test]
    fn test_manifest_entry_totals_and_order() {
        let entry = ManifestEntry::new(
            "model_a",
            1,
            "/models/model_a/1",
            vec![file("variables/variables.index", 10), file("saved_model.pb", 5)],
        );
        assert_eq!(entry.size, 15);
        assert_eq!(entry.files[0].relative_path, "saved_model.pb");
        assert_eq!(entry.key(), VersionKey::new("model_a", 1));
    }

    #[test]
    fn test_etag_tracks_changes() {
        let a = ManifestEntry::new("m", 1, "/m/1", vec![file("a", 1), file("b", 2)]);
        let reordered = ManifestEntry::new("m", 1, "/m/1", vec![file("b", 2), file("a", 1)]);
        let resized = ManifestEntry::new("m", 1, "/m/1", vec![file("a", 1), file("b", 3)]);
        assert_eq!(a.etag, reordered.etag);
        assert_ne!(a.etag, resized.etag);
    }
}
