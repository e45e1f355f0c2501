//! Builds the remote manifest for one sync pass.
//!
//! Layout upstream is `<root>/<model>/<version>/...`, or a model list file
//! naming each model's base path. Version directories are numeric. Versions
//! still being written upstream are skipped until the next pass.

use super::{join_path, read_to_bytes, RemoteEntry, RemoteLocation, RemoteStore};
use crate::config::SyncDefaults;
use crate::error::{Result, SyncError};
use crate::model::{parse_version, validate_model_name, ManifestEntry, ManifestFile, Version, VersionKey};
use crate::serving::{ModelConfigEntry, ModelConfigList};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Upper bound for small control files read from the store.
const CONTROL_FILE_LIMIT: usize = 4 * 1024 * 1024;

/// Options controlling the remote scan.
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Only scan this model.
    pub model_filter: Option<String>,
    /// Require a `_SUCCESS` file before a version counts as published.
    pub require_success_marker: bool,
    /// Remote YAML model list; replaces root discovery.
    pub model_config_path: Option<String>,
    /// How many models are scanned concurrently.
    pub concurrency: usize,
    /// Platform used for discovered models.
    pub default_platform: String,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            model_filter: None,
            require_success_marker: false,
            model_config_path: None,
            concurrency: SyncDefaults::FETCH_CONCURRENCY,
            default_platform: SyncDefaults::MODEL_PLATFORM.to_string(),
        }
    }
}

/// Remote state of one model.
#[derive(Debug, Clone)]
pub struct RemoteModel {
    pub name: String,
    pub source_path: String,
    /// Serving settings carried into the generated `models.config`.
    pub config: ModelConfigEntry,
    pub versions: BTreeMap<Version, ManifestEntry>,
}

/// Everything learned from the remote store in one pass.
#[derive(Debug, Clone, Default)]
pub struct RemoteManifest {
    pub models: BTreeMap<String, RemoteModel>,
    /// Models whose listing failed this pass; nothing is known about them.
    pub unavailable: BTreeMap<String, String>,
    /// Versions present upstream but not yet complete.
    pub incomplete: BTreeMap<VersionKey, String>,
    /// Conflicts resolved by tie-break rules.
    pub conflicts: Vec<String>,
}

impl RemoteManifest {
    pub fn entry(&self, key: &VersionKey) -> Option<&ManifestEntry> {
        self.models
            .get(&key.model)
            .and_then(|m| m.versions.get(&key.version))
    }
}

/// Scans a remote store into a [`RemoteManifest`].
pub struct Catalog<'a> {
    store: &'a dyn RemoteStore,
    root: &'a RemoteLocation,
    options: CatalogOptions,
}

struct ModelSource {
    config: ModelConfigEntry,
    path: String,
}

enum VersionScan {
    Ready(ManifestEntry),
    Incomplete(String),
}

impl<'a> Catalog<'a> {
    pub fn new(store: &'a dyn RemoteStore, root: &'a RemoteLocation, options: CatalogOptions) -> Self {
        Self { store, root, options }
    }

    /// Scan the store. Fails only if the model set itself cannot be determined.
    pub async fn scan(&self) -> Result<RemoteManifest> {
        let sources = self.model_sources().await?;
        let mut manifest = RemoteManifest::default();

        let scans: Vec<(ModelSource, Result<(RemoteModel, Vec<String>, BTreeMap<VersionKey, String>)>)> =
            stream::iter(sources)
                .map(|source| async move {
                    let result = self.scan_model(&source).await;
                    (source, result)
                })
                .buffer_unordered(self.options.concurrency.max(1))
                .collect()
                .await;

        for (source, result) in scans {
            match result {
                Ok((model, conflicts, incomplete)) => {
                    manifest.conflicts.extend(conflicts);
                    manifest.incomplete.extend(incomplete);
                    manifest.models.insert(model.name.clone(), model);
                }
                Err(e) => {
                    warn!(model = %source.config.name, error = %e, "Remote model listing failed");
                    manifest
                        .unavailable
                        .insert(source.config.name.clone(), e.to_string());
                }
            }
        }

        debug!(
            models = manifest.models.len(),
            unavailable = manifest.unavailable.len(),
            "Remote manifest built"
        );
        Ok(manifest)
    }

    /// Determine which models exist upstream.
    async fn model_sources(&self) -> Result<Vec<ModelSource>> {
        let mut sources = match &self.options.model_config_path {
            Some(config_path) => self.sources_from_model_list(config_path).await?,
            None => self.sources_from_root().await?,
        };

        if let Some(filter) = &self.options.model_filter {
            sources.retain(|s| &s.config.name == filter);
            if sources.is_empty() {
                warn!(model = %filter, "Configured model not found upstream");
            }
        }
        Ok(sources)
    }

    async fn sources_from_root(&self) -> Result<Vec<ModelSource>> {
        let entries = self.store.list(&self.root.path).await?;
        Ok(entries
            .into_iter()
            .filter(RemoteEntry::is_dir)
            .filter(|e| !is_hidden(&e.name))
            .filter_map(|e| match validate_model_name(&e.name) {
                Ok(()) => Some(ModelSource {
                    config: ModelConfigEntry::new(&e.name, &self.options.default_platform),
                    path: e.path,
                }),
                Err(_) => {
                    warn!(name = %e.name, "Skipping remote directory with unsafe model name");
                    None
                }
            })
            .collect())
    }

    async fn sources_from_model_list(&self, config_path: &str) -> Result<Vec<ModelSource>> {
        let path = match RemoteLocation::parse(config_path) {
            Some(location) => location.path,
            None => config_path.to_string(),
        };
        let content = read_to_bytes(self.store, &path, CONTROL_FILE_LIMIT).await?;
        let text = String::from_utf8(content.to_vec())
            .map_err(|e| SyncError::Other(format!("Model list {} is not UTF-8: {}", path, e)))?;
        let list = ModelConfigList::from_yaml(&text)?;
        info!(path = %path, models = list.model_config.len(), "Loaded remote model list");

        let mut sources = Vec::new();
        for entry in list.model_config {
            if validate_model_name(&entry.name).is_err() {
                warn!(name = %entry.name, "Skipping model list entry with unsafe name");
                continue;
            }
            let model_path = match RemoteLocation::parse(&entry.base_path) {
                Some(location) => location.path,
                None if entry.base_path.starts_with('/') => entry.base_path.clone(),
                None => join_path(&self.root.path, &entry.base_path),
            };
            sources.push(ModelSource {
                config: entry,
                path: model_path,
            });
        }
        Ok(sources)
    }

    async fn scan_model(
        &self,
        source: &ModelSource,
    ) -> Result<(RemoteModel, Vec<String>, BTreeMap<VersionKey, String>)> {
        let name = &source.config.name;
        let entries = self.store.list(&source.path).await?;

        let mut conflicts = Vec::new();
        let mut chosen: BTreeMap<Version, RemoteEntry> = BTreeMap::new();
        for entry in entries.into_iter().filter(RemoteEntry::is_dir) {
            let Some(version) = parse_version(&entry.name) else {
                debug!(model = %name, dir = %entry.name, "Ignoring non-version directory");
                continue;
            };
            match chosen.get(&version) {
                Some(existing) => {
                    let (winner, loser) = if entry.path > existing.path {
                        (entry.path.clone(), existing.path.clone())
                    } else {
                        (existing.path.clone(), entry.path.clone())
                    };
                    let message = format!(
                        "duplicate version {} for model {}: using {}, ignoring {}",
                        version, name, winner, loser
                    );
                    warn!(model = %name, version, "Conflict: {}", message);
                    conflicts.push(message);
                    if entry.path > existing.path {
                        chosen.insert(version, entry);
                    }
                }
                None => {
                    chosen.insert(version, entry);
                }
            }
        }

        let mut versions = BTreeMap::new();
        let mut incomplete = BTreeMap::new();
        for (version, entry) in chosen {
            let key = VersionKey::new(name.clone(), version);
            match self.scan_version(name, version, &entry.path).await {
                Ok(VersionScan::Ready(manifest)) => {
                    versions.insert(version, manifest);
                }
                Ok(VersionScan::Incomplete(reason)) => {
                    info!(model = %name, version, reason = %reason, "Upstream version not complete yet");
                    incomplete.insert(key, reason);
                }
                Err(e) => {
                    warn!(model = %name, version, error = %e, "Failed to scan remote version");
                    incomplete.insert(key, e.to_string());
                }
            }
        }

        Ok((
            RemoteModel {
                name: name.clone(),
                source_path: source.path.clone(),
                config: source.config.clone(),
                versions,
            },
            conflicts,
            incomplete,
        ))
    }

    /// Walk a version directory recursively.
    async fn scan_version(&self, model: &str, version: Version, path: &str) -> Result<VersionScan> {
        let mut files: Vec<ManifestFile> = Vec::new();
        let mut saw_success = false;
        let mut checksum_file: Option<String> = None;
        let mut pending: Vec<(String, String)> = vec![(path.to_string(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            for entry in self.store.list(&dir).await? {
                let relative = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", prefix, entry.name)
                };

                if entry.name.ends_with(SyncDefaults::COPYING_SUFFIX) {
                    return Ok(VersionScan::Incomplete(format!("{} is still being copied", relative)));
                }
                if prefix.is_empty() && entry.name == SyncDefaults::SUCCESS_MARKER {
                    saw_success = true;
                    continue;
                }
                if is_hidden(&entry.name) {
                    continue;
                }
                if entry.is_dir() {
                    pending.push((entry.path.clone(), relative));
                    continue;
                }
                if prefix.is_empty() && entry.name == SyncDefaults::CHECKSUM_SIDECAR {
                    checksum_file = Some(entry.path.clone());
                }
                files.push(ManifestFile {
                    relative_path: relative,
                    size: entry.size,
                    modified: entry.modified,
                    checksum: entry.checksum.clone(),
                });
            }
        }

        if self.options.require_success_marker && !saw_success {
            return Ok(VersionScan::Incomplete(format!(
                "no {} marker",
                SyncDefaults::SUCCESS_MARKER
            )));
        }
        if files.is_empty() {
            return Ok(VersionScan::Incomplete("version directory is empty".to_string()));
        }

        if let Some(sidecar) = checksum_file {
            let content = read_to_bytes(self.store, &sidecar, CONTROL_FILE_LIMIT).await?;
            let sums = parse_checksums(&String::from_utf8_lossy(&content));
            for file in files.iter_mut() {
                if file.checksum.is_none() {
                    file.checksum = sums.get(&file.relative_path).cloned();
                }
            }
        }

        Ok(VersionScan::Ready(ManifestEntry::new(model, version, path, files)))
    }
}

/// Hadoop convention: names starting with `.` or `_` are hidden.
fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

/// Parse `sha256sum` output: `<hex>  <path>` or `<hex> *<path>`.
pub(crate) fn parse_checksums(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let (hash, rest) = line.split_once(char::is_whitespace)?;
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            let path = rest.trim_start().trim_start_matches('*').trim_start_matches("./");
            if path.is_empty() {
                return None;
            }
            Some((path.to_string(), hash.to_ascii_lowercase()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checksums() {
        let sha = "a".repeat(64);
        let other = "B".repeat(64);
        let content = format!(
            "{}  saved_model.pb\n{} *./variables/variables.index\nnot a line\n",
            sha, other
        );
        let sums = parse_checksums(&content);
        assert_eq!(sums.get("saved_model.pb"), Some(&sha));
        assert_eq!(
            sums.get("variables/variables.index"),
            Some(&"b".repeat(64))
        );
        assert_eq!(sums.len(), 2);
    }

    #[test]
    fn test_is_hidden() {
        assert!(is_hidden(".crc"));
        assert!(is_hidden("_logs"));
        assert!(!is_hidden("saved_model.pb"));
    }
}
