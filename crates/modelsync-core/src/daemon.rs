//! The sync loop.
//!
//! One pass: scan the remote store, scan the local root, ask the model server
//! what it is serving, plan, execute, refresh `models.config`. Passes never
//! overlap. Between passes the loop sleeps for the configured interval or
//! until [`SyncDaemon::trigger`] is called.
//!
//! Shutdown uses two tokens. `drain` stops new passes from starting; the
//! current pass finishes. `abort` additionally cancels running fetches, whose
//! staging directories are discarded.

use crate::cancel::CancellationToken;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::executor::{ExecutionReport, Executor, ExecutorOptions};
use crate::layout::{LocalLayout, LocalState, RootLock};
use crate::model::{Version, VersionKey};
use crate::planner::{plan, version_states, PlanInput, PlannerPolicy, SyncPlan, VersionStatus};
use crate::remote::{open_store, Catalog, CatalogOptions, RemoteLocation, RemoteManifest, RemoteStore};
use crate::serving::{write_model_config, ActiveVersionSource, ModelConfigEntry, TfServingStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// What the loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Running,
    Sleeping,
}

/// Result of one sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub plan: SyncPlan,
    pub execution: ExecutionReport,
    pub model_config_written: bool,
}

impl PassReport {
    pub fn has_failures(&self) -> bool {
        self.execution.has_failures()
    }
}

/// Dry-run output.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub plan: SyncPlan,
    pub versions: Vec<VersionStatus>,
}

struct Observed {
    manifest: RemoteManifest,
    local: LocalState,
    in_flight: HashSet<VersionKey>,
    active: HashMap<String, Version>,
}

impl Observed {
    fn input(&self) -> PlanInput<'_> {
        PlanInput {
            remote: &self.manifest,
            local: &self.local,
            in_flight: &self.in_flight,
            active: &self.active,
        }
    }
}

/// Owns the sync loop for one remote root and one local root.
pub struct SyncDaemon {
    config: SyncConfig,
    location: RemoteLocation,
    store: Arc<dyn RemoteStore>,
    executor: Executor,
    active_source: Option<Arc<dyn ActiveVersionSource>>,
    pass_lock: Mutex<()>,
    state: watch::Sender<DaemonState>,
    wake: Notify,
    drain: CancellationToken,
    abort: CancellationToken,
}

impl SyncDaemon {
    pub fn new(config: SyncConfig, location: RemoteLocation, store: Arc<dyn RemoteStore>) -> Self {
        let layout = LocalLayout::new(config.local_model_root.clone());
        let executor = Executor::new(layout, Arc::clone(&store), ExecutorOptions::from(&config));
        let (state, _) = watch::channel(DaemonState::Idle);
        Self {
            config,
            location,
            store,
            executor,
            active_source: None,
            pass_lock: Mutex::new(()),
            state,
            wake: Notify::new(),
            drain: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Build a daemon from configuration, opening the remote store and the
    /// optional serving status source.
    pub fn from_config(config: SyncConfig, location: RemoteLocation) -> Result<Self> {
        let store = open_store(&config, &location)?;
        let status = match &config.serving_status_url {
            Some(url) => Some(Arc::new(TfServingStatus::new(url)?) as Arc<dyn ActiveVersionSource>),
            None => None,
        };
        let daemon = Self::new(config, location, store);
        Ok(match status {
            Some(source) => daemon.with_active_source(source),
            None => daemon,
        })
    }

    pub fn with_active_source(mut self, source: Arc<dyn ActiveVersionSource>) -> Self {
        self.active_source = Some(source);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn layout(&self) -> &LocalLayout {
        self.executor.layout()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    /// Stops scheduling new passes.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Cancels running fetches.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Start the next pass now instead of at the end of the interval.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Take ownership of the local root and clear what a previous process
    /// left behind. The returned lock must be held for the daemon's lifetime.
    pub fn prepare(&self) -> Result<RootLock> {
        let layout = self.layout();
        let lock = layout.lock()?;
        layout.ensure_dirs()?;
        layout.cleanup_staging()?;
        Ok(lock)
    }

    /// Check that the remote root can be reached at all.
    pub async fn check_remote(&self) -> Result<()> {
        let entry = self.store.stat(&self.location.path).await?;
        if !entry.is_dir() {
            return Err(SyncError::config(format!(
                "Remote root {} is not a directory",
                self.location
            )));
        }
        info!(remote = %self.location, store = %self.store.describe(), "Remote root reachable");
        Ok(())
    }

    /// Compute the plan for the current state without executing it.
    pub async fn plan(&self) -> Result<(SyncPlan, RemoteManifest)> {
        let observed = self.observe().await?;
        let plan = plan(observed.input(), &PlannerPolicy::from(&self.config));
        Ok((plan, observed.manifest))
    }

    /// Plan plus the lifecycle state of every known version, for dry runs.
    pub async fn preview(&self) -> Result<PlanPreview> {
        let observed = self.observe().await?;
        let plan = plan(observed.input(), &PlannerPolicy::from(&self.config));
        let versions = version_states(observed.input(), &plan);
        Ok(PlanPreview { plan, versions })
    }

    async fn observe(&self) -> Result<Observed> {
        let manifest = Catalog::new(&*self.store, &self.location, self.catalog_options())
            .scan()
            .await?;
        let local = self.layout().scan()?;
        let active = self.active_versions(&manifest, &local).await;
        let in_flight = self.executor.in_flight();
        Ok(Observed {
            manifest,
            local,
            in_flight,
            active,
        })
    }

    /// Run one pass. Returns [`SyncError::PassInProgress`] if one is already
    /// running.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let _guard = self.pass_lock.try_lock().map_err(|_| SyncError::PassInProgress)?;
        self.state.send_replace(DaemonState::Running);
        let result = self.pass().await;
        self.state.send_replace(DaemonState::Idle);
        result
    }

    /// Single pass for `enable_sync_loop = false`.
    pub async fn run_once(&self) -> Result<PassReport> {
        self.run_pass().await
    }

    /// Loop until drained. Pass failures are logged and retried next cycle.
    pub async fn run(&self) {
        self.run_loop(false).await
    }

    /// Like [`run`](Self::run), but sleeps one interval before the first
    /// pass. Used after a blocking initial pass has just finished.
    pub async fn run_after_initial_pass(&self) {
        self.run_loop(true).await
    }

    async fn run_loop(&self, mut skip_pass: bool) {
        let interval = self.config.sync_interval();
        info!(
            remote = %self.location,
            local = %self.layout().root().display(),
            interval_secs = interval.as_secs(),
            retention = self.config.retention,
            "Sync loop started"
        );

        while !self.drain.is_cancelled() {
            if !skip_pass {
                match self.run_pass().await {
                    Ok(_) => {}
                    Err(SyncError::PassInProgress) => debug!("Pass already running; skipping cycle"),
                    Err(e) => warn!(error = %e, class = %e.class(), "Sync pass failed"),
                }
            }
            skip_pass = false;
            if self.drain.is_cancelled() {
                break;
            }

            self.state.send_replace(DaemonState::Sleeping);
            tokio::select! {
                _ = self.drain.cancelled() => {}
                _ = self.wake.notified() => debug!("Sync pass triggered"),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.state.send_replace(DaemonState::Idle);
        info!("Sync loop stopped");
    }

    async fn pass(&self) -> Result<PassReport> {
        let started_at = Utc::now();
        let started = Instant::now();

        let (plan, manifest) = self.plan().await?;
        for warning in &plan.warnings {
            debug!(model = %warning.model, version = ?warning.version, kind = ?warning.kind, "{}", warning.message);
        }

        let execution = if plan.is_empty() {
            ExecutionReport::default()
        } else {
            self.executor.execute(&plan, &manifest, &self.abort).await
        };

        let model_config_written = if self.config.write_model_config {
            match self.refresh_model_config(&manifest) {
                Ok(written) => written,
                Err(e) => {
                    warn!(error = %e, "Failed to write models.config");
                    false
                }
            }
        } else {
            false
        };

        let report = PassReport {
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            plan,
            execution,
            model_config_written,
        };
        info!(
            actions = report.plan.actions.len(),
            succeeded = report.execution.succeeded(),
            skipped = report.execution.skipped(),
            failed = report.execution.failed(),
            warnings = report.plan.warnings.len(),
            duration_ms = report.duration_ms,
            "Sync pass finished"
        );
        Ok(report)
    }

    fn catalog_options(&self) -> CatalogOptions {
        CatalogOptions {
            model_filter: self.config.model_name.clone(),
            require_success_marker: self.config.require_success_marker,
            model_config_path: self.config.model_config_path.clone(),
            concurrency: self.config.fetch_concurrency,
            default_platform: self.config.model_platform.clone(),
        }
    }

    async fn active_versions(&self, manifest: &RemoteManifest, local: &LocalState) -> HashMap<String, Version> {
        let Some(source) = &self.active_source else {
            return HashMap::new();
        };

        let mut models: BTreeSet<&str> = manifest.models.keys().map(String::as_str).collect();
        models.extend(local.models.keys().map(String::as_str));

        stream::iter(models.into_iter().map(str::to_owned))
            .map(|model| async move {
                let result = source.active_version(&model).await;
                (model, result)
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .filter_map(|(model, result)| async move {
                match result {
                    Ok(Some(version)) => Some((model, version)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(model = %model, error = %e, "Active version unknown");
                        None
                    }
                }
            })
            .collect()
            .await
    }

    fn refresh_model_config(&self, manifest: &RemoteManifest) -> Result<bool> {
        let layout = self.layout();
        let local = layout.scan()?;
        let mut entries = Vec::new();
        for (name, model) in &local.models {
            if model.newest_complete().is_none() {
                continue;
            }
            if self.config.model_name.as_ref().is_some_and(|f| f != name) {
                continue;
            }
            let entry = match manifest.models.get(name) {
                Some(remote) => remote.config.clone(),
                None => ModelConfigEntry::new(name.clone(), self.config.model_platform.clone()),
            };
            let base_path = layout.model_dir(name)?.to_string_lossy().to_string();
            entries.push(entry.with_base_path(base_path));
        }
        write_model_config(layout.root(), &entries)
    }
}
