//! Executes sync plans against the local root.
//!
//! Fetches stream every file of a version into a fresh staging directory and
//! verify size and checksum on the fly. Any failure discards the attempt.
//! Promotion is a single `rename` into the final path followed by the
//! completion marker. Every action ends in an [`ActionReport`]; errors never
//! escape a pass.

use crate::cancel::CancellationToken;
use crate::config::SyncConfig;
use crate::error::{ErrorClass, Result, SyncError};
use crate::hashing::{digests_match, StreamingHash};
use crate::layout::{resolve_relative, CompletionMarker, LocalLayout};
use crate::model::{ManifestEntry, ManifestFile, Version, VersionKey};
use crate::planner::{Action, SyncPlan};
use crate::remote::{join_path, RemoteManifest, RemoteStore};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A fetched version sitting in staging, not yet visible.
#[derive(Debug, Clone)]
pub struct StagedVersion {
    pub key: VersionKey,
    pub dir: PathBuf,
    pub entry: ManifestEntry,
}

/// Failure of one action, cheap to clone so every waiter of a shared fetch
/// gets its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&SyncError> for ActionError {
    fn from(err: &SyncError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

pub type FetchResult = std::result::Result<StagedVersion, ActionError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Nothing to do, or a prerequisite did not happen.
    Skipped { reason: String },
    Failed { error: ActionError },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed { .. } => "failed",
        }
    }
}

/// What happened to one planned action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub action: &'static str,
    pub model: String,
    pub version: Version,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub bytes: u64,
    pub duration_ms: u64,
}

impl ActionReport {
    fn new(action: &Action, outcome: Outcome, bytes: u64, started: Instant) -> Self {
        let key = action.key();
        let report = Self {
            action: action.name(),
            model: key.model.clone(),
            version: key.version,
            outcome,
            bytes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        report.log();
        report
    }

    fn log(&self) {
        match &self.outcome {
            Outcome::Failed { error } => warn!(
                model = %self.model,
                version = self.version,
                action = self.action,
                outcome = self.outcome.as_str(),
                class = %error.class,
                duration_ms = self.duration_ms,
                "{}",
                error.message
            ),
            Outcome::Skipped { reason } => info!(
                model = %self.model,
                version = self.version,
                action = self.action,
                outcome = self.outcome.as_str(),
                "{}",
                reason
            ),
            Outcome::Succeeded => info!(
                model = %self.model,
                version = self.version,
                action = self.action,
                outcome = self.outcome.as_str(),
                bytes = self.bytes,
                duration_ms = self.duration_ms,
                "Action completed"
            ),
        }
    }
}

/// Reports for every action of a plan, in plan order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub actions: Vec<ActionReport>,
}

impl ExecutionReport {
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Succeeded))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.actions.iter().filter(|a| f(&a.outcome)).count()
    }
}

/// What a promote did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteResult {
    Promoted,
    /// Replaced a previous directory at the final path.
    Replaced,
    /// A marker for the same content was already there.
    AlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub verify_checksums: bool,
    pub min_free_space_bytes: u64,
    pub fetch_concurrency: usize,
}

impl From<&SyncConfig> for ExecutorOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            verify_checksums: config.verify_checksums,
            min_free_space_bytes: config.min_free_space_bytes,
            fetch_concurrency: config.fetch_concurrency.max(1),
        }
    }
}

struct ExecutorInner {
    layout: LocalLayout,
    store: Arc<dyn RemoteStore>,
    options: ExecutorOptions,
    inflight: Mutex<HashMap<VersionKey, SharedFetch>>,
}

/// Applies plans to one local root. Clones share the in-flight table.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(layout: LocalLayout, store: Arc<dyn RemoteStore>, options: ExecutorOptions) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                layout,
                store,
                options,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn layout(&self) -> &LocalLayout {
        &self.inner.layout
    }

    /// Keys with a fetch currently running.
    pub fn in_flight(&self) -> HashSet<VersionKey> {
        self.inner.lock_inflight().keys().cloned().collect()
    }

    /// Fetch a version into staging.
    ///
    /// A second call for a key that is already being fetched waits for the
    /// first and receives the same result. The running download listens only
    /// to the first caller's `abort` token: a joining caller's token is
    /// ignored, and it receives `Aborted` if the first caller aborts. All
    /// callers inside one daemon share its abort token, so this only matters
    /// for direct users of the executor.
    pub async fn fetch(&self, entry: ManifestEntry, abort: CancellationToken) -> FetchResult {
        let key = entry.key();
        let shared = {
            let mut inflight = self.inner.lock_inflight();
            match inflight.get(&key) {
                Some(existing) => {
                    debug!(model = %key.model, version = key.version, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let task_key = key.clone();
                    let fut = async move {
                        let result = inner
                            .fetch_uncached(&entry, &abort)
                            .await
                            .map_err(|e| ActionError::from(&e));
                        inner.lock_inflight().remove(&task_key);
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    /// Make a staged version visible at its final path.
    pub async fn promote(&self, staged: StagedVersion, replace: bool) -> Result<PromoteResult> {
        let layout = self.inner.layout.clone();
        tokio::task::spawn_blocking(move || promote_blocking(&layout, &staged, replace))
            .await
            .map_err(|e| SyncError::Other(format!("Promote task failed: {}", e)))?
    }

    /// Remove a version from its final path. Returns `false` if it was not there.
    pub async fn evict(&self, key: &VersionKey) -> Result<bool> {
        let layout = self.inner.layout.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || evict_blocking(&layout, &key))
            .await
            .map_err(|e| SyncError::Other(format!("Evict task failed: {}", e)))?
    }

    /// Run a plan: all fetches first (bounded concurrency), then promotes and
    /// evictions in plan order.
    pub async fn execute(
        &self,
        plan: &SyncPlan,
        manifest: &RemoteManifest,
        abort: &CancellationToken,
    ) -> ExecutionReport {
        let fetches: Vec<(Action, Option<ManifestEntry>)> = plan
            .fetches()
            .map(|action| (action.clone(), manifest.entry(action.key()).cloned()))
            .collect();

        let fetched: HashMap<VersionKey, (FetchResult, Instant)> = stream::iter(fetches)
            .map(|(action, entry)| {
                let abort = abort.clone();
                async move {
                    let started = Instant::now();
                    let key = action.key().clone();
                    let result = match entry {
                        Some(entry) => self.fetch(entry, abort).await,
                        None => Err(ActionError {
                            class: ErrorClass::Conflict,
                            message: format!("{} is not in the remote manifest", key),
                        }),
                    };
                    (key, (result, started))
                }
            })
            .buffer_unordered(self.inner.options.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut report = ExecutionReport::default();
        let mut staged: HashMap<VersionKey, StagedVersion> = HashMap::new();
        let mut promoted: HashSet<VersionKey> = HashSet::new();

        for action in &plan.actions {
            match action {
                Action::Fetch { key, .. } => {
                    let (outcome, bytes, started) = match fetched.get(key) {
                        Some((Ok(version), started)) => {
                            staged.insert(key.clone(), version.clone());
                            (Outcome::Succeeded, version.entry.size, *started)
                        }
                        Some((Err(error), started)) => (
                            Outcome::Failed {
                                error: error.clone(),
                            },
                            0,
                            *started,
                        ),
                        None => (
                            Outcome::Skipped {
                                reason: "fetch was not run".to_string(),
                            },
                            0,
                            Instant::now(),
                        ),
                    };
                    report.actions.push(ActionReport::new(action, outcome, bytes, started));
                }
                Action::Promote { key, replace } => {
                    let started = Instant::now();
                    let (outcome, bytes) = if abort.is_cancelled() {
                        (skipped("shutting down"), 0)
                    } else {
                        match staged.remove(key) {
                            None => (skipped("fetch did not succeed"), 0),
                            Some(version) => {
                                let bytes = version.entry.size;
                                match self.promote(version, *replace).await {
                                    Ok(PromoteResult::AlreadyPresent) => {
                                        promoted.insert(key.clone());
                                        (skipped("already promoted"), 0)
                                    }
                                    Ok(_) => {
                                        promoted.insert(key.clone());
                                        (Outcome::Succeeded, bytes)
                                    }
                                    Err(e) => (failed(&e), 0),
                                }
                            }
                        }
                    };
                    report.actions.push(ActionReport::new(action, outcome, bytes, started));
                }
                Action::Evict {
                    key, after_promote, ..
                } => {
                    let started = Instant::now();
                    let prerequisite = after_promote.map(|v| VersionKey::new(key.model.clone(), v));
                    let outcome = if abort.is_cancelled() {
                        skipped("shutting down")
                    } else if prerequisite.as_ref().is_some_and(|p| !promoted.contains(p)) {
                        skipped(&format!(
                            "waiting for version {} to be promoted",
                            after_promote.unwrap_or_default()
                        ))
                    } else {
                        match self.evict(key).await {
                            Ok(true) => Outcome::Succeeded,
                            Ok(false) => skipped("already absent"),
                            Err(e) => failed(&e),
                        }
                    };
                    report.actions.push(ActionReport::new(action, outcome, 0, started));
                }
            }
        }

        // Fetched but never promoted (shutdown): nothing may stay in staging.
        for version in staged.into_values() {
            discard(&version.dir);
        }

        report
    }
}

fn skipped(reason: &str) -> Outcome {
    Outcome::Skipped {
        reason: reason.to_string(),
    }
}

fn failed(err: &SyncError) -> Outcome {
    Outcome::Failed {
        error: ActionError::from(err),
    }
}

fn discard(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(path = %dir.display(), "Discarded staging directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to discard staging directory"),
    }
}

impl ExecutorInner {
    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<VersionKey, SharedFetch>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fetch_uncached(&self, entry: &ManifestEntry, abort: &CancellationToken) -> Result<StagedVersion> {
        abort.check()?;
        for file in &entry.files {
            resolve_relative(Path::new(""), &file.relative_path)?;
        }

        self.layout.ensure_dirs()?;
        self.check_free_space(entry.size)?;

        let dir = self.layout.new_staging_dir(&entry.model, entry.version)?;
        debug!(
            model = %entry.model,
            version = entry.version,
            files = entry.files.len(),
            bytes = entry.size,
            staging = %dir.display(),
            "Fetching version"
        );

        let result = self.download_all(entry, &dir, abort).await;
        let result = result.and_then(|()| verify_tree(entry, &dir));
        if let Err(e) = result {
            discard(&dir);
            return Err(e);
        }

        Ok(StagedVersion {
            key: entry.key(),
            dir,
            entry: entry.clone(),
        })
    }

    fn check_free_space(&self, needed: u64) -> Result<()> {
        let staging = self.layout.staging_root();
        let available =
            fs2::available_space(&staging).map_err(|e| SyncError::io_with_path(e, &staging))?;
        let required = needed.saturating_add(self.options.min_free_space_bytes);
        if available < required {
            return Err(SyncError::InsufficientSpace {
                path: staging,
                required,
                available,
            });
        }
        Ok(())
    }

    async fn download_all(&self, entry: &ManifestEntry, dir: &Path, abort: &CancellationToken) -> Result<()> {
        for file in &entry.files {
            abort.check()?;
            let target = resolve_relative(dir, &file.relative_path)?;
            let source = join_path(&entry.source_path, &file.relative_path);
            self.download_file(&source, file, &target, abort).await?;
        }
        Ok(())
    }

    async fn download_file(
        &self,
        source: &str,
        file: &ManifestFile,
        target: &Path,
        abort: &CancellationToken,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io_with_path(e, parent))?;
        }

        let mut stream = self.store.read(source).await?;
        let mut out = tokio::fs::File::create(target)
            .await
            .map_err(|e| SyncError::io_with_path(e, target))?;
        let mut hash = StreamingHash::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(SyncError::Aborted),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            if hash.bytes() + chunk.len() as u64 > file.size {
                return Err(SyncError::SizeMismatch {
                    path: file.relative_path.clone(),
                    expected: file.size,
                    actual: hash.bytes() + chunk.len() as u64,
                });
            }
            out.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io_with_path(e, target))?;
            hash.update(&chunk);
        }
        out.sync_all()
            .await
            .map_err(|e| SyncError::io_with_path(e, target))?;

        if hash.bytes() != file.size {
            return Err(SyncError::SizeMismatch {
                path: file.relative_path.clone(),
                expected: file.size,
                actual: hash.bytes(),
            });
        }
        if self.options.verify_checksums {
            if let Some(expected) = &file.checksum {
                let actual = hash.finish();
                if !digests_match(expected, &actual) {
                    return Err(SyncError::ChecksumMismatch {
                        path: file.relative_path.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}

/// The staged tree must hold exactly the manifest's files and bytes.
fn verify_tree(entry: &ManifestEntry, dir: &Path) -> Result<()> {
    let mut files = 0usize;
    let mut bytes = 0u64;
    for item in WalkDir::new(dir).min_depth(1) {
        let item = item.map_err(|e| SyncError::Other(format!("Walking {}: {}", dir.display(), e)))?;
        if item.file_type().is_file() {
            files += 1;
            bytes += item
                .metadata()
                .map_err(|e| SyncError::Other(format!("Reading {}: {}", item.path().display(), e)))?
                .len();
        }
    }
    if files != entry.files.len() || bytes != entry.size {
        return Err(SyncError::SizeMismatch {
            path: entry.key().to_string(),
            expected: entry.size,
            actual: bytes,
        });
    }
    Ok(())
}

fn promote_blocking(layout: &LocalLayout, staged: &StagedVersion, replace: bool) -> Result<PromoteResult> {
    let key = &staged.key;
    let target = layout.version_dir(&key.model, key.version)?;

    let existing_marker = match layout.read_marker(&key.model, key.version) {
        Ok(marker) => marker,
        Err(e) => {
            warn!(model = %key.model, version = key.version, error = %e, "Unreadable marker at promote target");
            None
        }
    };
    if let Some(marker) = &existing_marker {
        if marker.etag == staged.entry.etag {
            discard(&staged.dir);
            return Ok(PromoteResult::AlreadyPresent);
        }
        if !replace {
            discard(&staged.dir);
            return Err(SyncError::Conflict {
                message: format!(
                    "{} already promoted with etag {}, staged etag {}",
                    key, marker.etag, staged.entry.etag
                ),
            });
        }
    }

    let model_dir = layout.model_dir(&key.model)?;
    std::fs::create_dir_all(&model_dir).map_err(|e| SyncError::io_with_path(e, &model_dir))?;

    let trashed = if target.exists() {
        if !replace && existing_marker.is_none() {
            discard(&staged.dir);
            return Err(SyncError::Conflict {
                message: format!("{} exists without a completion marker", target.display()),
            });
        }
        Some(layout.move_to_trash(&target)?)
    } else {
        None
    };

    std::fs::rename(&staged.dir, &target).map_err(|e| SyncError::io_with_path(e, &staged.dir))?;
    layout.write_marker(&CompletionMarker::for_entry(&staged.entry))?;

    if let Some(old) = trashed {
        discard(&old);
        return Ok(PromoteResult::Replaced);
    }
    Ok(PromoteResult::Promoted)
}

fn evict_blocking(layout: &LocalLayout, key: &VersionKey) -> Result<bool> {
    let target = layout.version_dir(&key.model, key.version)?;
    if !target.exists() {
        return Ok(false);
    }
    // The version disappears from its final path in one step.
    let trashed = layout.move_to_trash(&target)?;
    std::fs::remove_dir_all(&trashed).map_err(|e| SyncError::io_with_path(e, &trashed))?;
    Ok(true)
}
