//! Sync planning.
//!
//! A pure function from (remote manifest, local state, in-flight set, active
//! versions) to an ordered list of actions. Nothing here touches the disk or
//! the network, so a plan can be printed without being executed.

use crate::config::SyncConfig;
use crate::layout::LocalState;
use crate::model::{Version, VersionKey, VersionState};
use crate::remote::RemoteManifest;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Download a version into a fresh staging directory.
    Fetch {
        key: VersionKey,
        etag: String,
        size: u64,
        /// The final path already holds a directory that will be replaced.
        replace: bool,
    },
    /// Move a fetched version to its final path and mark it complete.
    Promote { key: VersionKey, replace: bool },
    /// Remove a version from its final path.
    Evict {
        key: VersionKey,
        /// Only evict if this version of the same model was promoted in
        /// this pass.
        after_promote: Option<Version>,
        reason: EvictReason,
    },
}

impl Action {
    pub fn key(&self) -> &VersionKey {
        match self {
            Action::Fetch { key, .. } | Action::Promote { key, .. } | Action::Evict { key, .. } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Fetch { .. } => "fetch",
            Action::Promote { .. } => "promote",
            Action::Evict { .. } => "evict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    /// Older than the retention window.
    Retention,
    /// The model no longer exists upstream.
    RemovedUpstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Same version number, different content.
    Conflict,
    /// A directory at a final path without a completion marker.
    UnmarkedDirectory,
    /// Upstream still writing the version.
    Incomplete,
    /// The model could not be listed this pass.
    Unavailable,
}

/// Something the operator should know about that produced no action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanWarning {
    pub kind: WarningKind,
    pub model: String,
    pub version: Option<Version>,
    pub message: String,
}

/// Ordered actions for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub actions: Vec<Action>,
    pub warnings: Vec<PlanWarning>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn fetches(&self) -> impl Iterator<Item = &Action> {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::Fetch { .. }))
    }
}

/// Knobs that shape a plan.
#[derive(Debug, Clone)]
pub struct PlannerPolicy {
    pub retention: usize,
    pub max_fetch_per_model: usize,
    pub replace_changed_versions: bool,
    pub prune_removed_models: bool,
    pub model_filter: Option<String>,
}

impl From<&SyncConfig> for PlannerPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            retention: config.retention.max(1),
            max_fetch_per_model: config.max_fetch_per_model.max(1),
            replace_changed_versions: config.replace_changed_versions,
            prune_removed_models: config.prune_removed_models,
            model_filter: config.model_name.clone(),
        }
    }
}

/// Inputs observed at the start of a pass.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub remote: &'a RemoteManifest,
    pub local: &'a LocalState,
    /// Versions currently being fetched; they are neither fetched again nor
    /// counted as local.
    pub in_flight: &'a HashSet<VersionKey>,
    /// Version each model server reports as active. Missing means unknown.
    pub active: &'a HashMap<String, Version>,
}

struct Candidate {
    version: Version,
    etag: String,
    size: u64,
    replace: bool,
}

/// Compute the plan for one pass.
pub fn plan(input: PlanInput<'_>, policy: &PlannerPolicy) -> SyncPlan {
    let mut out = SyncPlan::default();

    for message in &input.remote.conflicts {
        debug!("Remote conflict resolved by tie-break: {}", message);
    }

    let mut models: BTreeSet<&str> = input.remote.models.keys().map(String::as_str).collect();
    models.extend(input.local.models.keys().map(String::as_str));
    models.extend(input.remote.unavailable.keys().map(String::as_str));
    if let Some(filter) = &policy.model_filter {
        models.retain(|m| *m == filter.as_str());
    }

    for (key, reason) in &input.remote.incomplete {
        if policy.model_filter.as_ref().is_some_and(|f| f != &key.model) {
            continue;
        }
        out.warnings.push(PlanWarning {
            kind: WarningKind::Incomplete,
            model: key.model.clone(),
            version: Some(key.version),
            message: reason.clone(),
        });
    }

    for model in models {
        plan_model(model, input, policy, &mut out);
    }
    out
}

fn plan_model(model: &str, input: PlanInput<'_>, policy: &PlannerPolicy, out: &mut SyncPlan) {
    let remote = input.remote.models.get(model);
    let local = input.local.models.get(model);
    let active = input.active.get(model).copied();

    if let Some(reason) = input.remote.unavailable.get(model) {
        out.warnings.push(PlanWarning {
            kind: WarningKind::Unavailable,
            model: model.to_string(),
            version: None,
            message: reason.clone(),
        });
    }

    let complete: BTreeSet<Version> = local
        .map(|l| l.complete_versions().collect())
        .unwrap_or_default();

    let mut candidates: Vec<Candidate> = Vec::new();
    if let Some(remote) = remote {
        for (version, entry) in &remote.versions {
            let key = VersionKey::new(model, *version);
            if input.in_flight.contains(&key) {
                continue;
            }
            match local.and_then(|l| l.versions.get(version)) {
                None => candidates.push(Candidate {
                    version: *version,
                    etag: entry.etag.clone(),
                    size: entry.size,
                    replace: false,
                }),
                Some(existing) => match &existing.marker {
                    Some(marker) if marker.etag == entry.etag => {}
                    Some(marker) => {
                        if policy.replace_changed_versions {
                            candidates.push(Candidate {
                                version: *version,
                                etag: entry.etag.clone(),
                                size: entry.size,
                                replace: true,
                            });
                        } else {
                            warn!(
                                model = %model,
                                version = *version,
                                local_etag = %marker.etag,
                                remote_etag = %entry.etag,
                                "Conflict: remote content changed for an existing version"
                            );
                            out.warnings.push(PlanWarning {
                                kind: WarningKind::Conflict,
                                model: model.to_string(),
                                version: Some(*version),
                                message: format!(
                                    "remote etag {} differs from local etag {}",
                                    entry.etag, marker.etag
                                ),
                            });
                        }
                    }
                    None => candidates.push(Candidate {
                        version: *version,
                        etag: entry.etag.clone(),
                        size: entry.size,
                        replace: true,
                    }),
                },
            }
        }
    }

    if let Some(local) = local {
        for unmarked in local.versions.values().filter(|v| !v.is_complete()) {
            let listed = remote.is_some_and(|r| r.versions.contains_key(&unmarked.version));
            if !listed {
                out.warnings.push(PlanWarning {
                    kind: WarningKind::UnmarkedDirectory,
                    model: model.to_string(),
                    version: Some(unmarked.version),
                    message: format!(
                        "{} has no completion marker and is not listed upstream; left alone",
                        unmarked.path.display()
                    ),
                });
            }
        }
    }

    // Keep only candidates that would land inside the retention window, then
    // the newest few of those.
    let mut projected: BTreeSet<Version> = complete.clone();
    projected.extend(candidates.iter().map(|c| c.version));
    let window: BTreeSet<Version> = projected.iter().rev().take(policy.retention).copied().collect();
    candidates.retain(|c| window.contains(&c.version));
    candidates.sort_by(|a, b| b.version.cmp(&a.version));
    candidates.truncate(policy.max_fetch_per_model);

    for c in &candidates {
        out.actions.push(Action::Fetch {
            key: VersionKey::new(model, c.version),
            etag: c.etag.clone(),
            size: c.size,
            replace: c.replace,
        });
    }
    // Oldest first so the newest version becomes visible last.
    for c in candidates.iter().rev() {
        out.actions.push(Action::Promote {
            key: VersionKey::new(model, c.version),
            replace: c.replace,
        });
    }

    let removed_upstream = remote.is_none()
        && !input.remote.unavailable.contains_key(model)
        && policy.prune_removed_models;
    if removed_upstream {
        if input.remote.models.is_empty() {
            warn!(model = %model, "Upstream lists no models at all; not pruning");
            return;
        }
        // With no active source the newest copy may still be served.
        let protected = active.or_else(|| complete.iter().next_back().copied());
        for version in &complete {
            if Some(*version) == protected {
                continue;
            }
            out.actions.push(Action::Evict {
                key: VersionKey::new(model, *version),
                after_promote: None,
                reason: EvictReason::RemovedUpstream,
            });
        }
        return;
    }

    plan_evictions(model, &complete, &candidates, active, policy, out);
}

fn plan_evictions(
    model: &str,
    complete: &BTreeSet<Version>,
    promoted: &[Candidate],
    active: Option<Version>,
    policy: &PlannerPolicy,
    out: &mut SyncPlan,
) {
    let mut projected: BTreeSet<Version> = complete.clone();
    projected.extend(promoted.iter().map(|c| c.version));
    let keep: BTreeSet<Version> = projected.iter().rev().take(policy.retention).copied().collect();
    // Versions that are out of the window even if nothing gets promoted.
    let keep_without_promotes: BTreeSet<Version> =
        complete.iter().rev().take(policy.retention).copied().collect();
    let newest_promoted = promoted.iter().map(|c| c.version).max();
    let newest_local = complete.iter().next_back().copied();

    for version in complete.iter().filter(|v| !keep.contains(v)) {
        let key = VersionKey::new(model, *version);
        if active == Some(*version) {
            debug!(model = %model, version = *version, "Keeping active version beyond retention");
            continue;
        }

        let after_promote = if keep_without_promotes.contains(version) {
            newest_promoted
        } else {
            None
        };

        // Without an active source the newest local version is assumed to be
        // served; it only goes once something newer is in place.
        if active.is_none() && Some(*version) == newest_local && after_promote.is_none() {
            continue;
        }

        out.actions.push(Action::Evict {
            key,
            after_promote,
            reason: EvictReason::Retention,
        });
    }
}

/// Lifecycle state of one version, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionStatus {
    #[serde(flatten)]
    pub key: VersionKey,
    pub state: VersionState,
}

/// Classify every known version given the inputs and the plan built from them.
///
/// Versions the plan evicts are reported as stale.
pub fn version_states(input: PlanInput<'_>, plan: &SyncPlan) -> Vec<VersionStatus> {
    let evicted: HashSet<&VersionKey> = plan
        .actions
        .iter()
        .filter(|a| matches!(a, Action::Evict { .. }))
        .map(Action::key)
        .collect();

    let mut states: std::collections::BTreeMap<VersionKey, VersionState> = Default::default();
    for (name, model) in &input.remote.models {
        for version in model.versions.keys() {
            states.insert(VersionKey::new(name.clone(), *version), VersionState::Remote);
        }
    }
    for key in input.in_flight {
        states.insert(key.clone(), VersionState::Staging);
    }
    for (name, model) in &input.local.models {
        for version in model.complete_versions() {
            let key = VersionKey::new(name.clone(), version);
            let state = if evicted.contains(&key) {
                VersionState::Stale
            } else {
                VersionState::Local
            };
            states.insert(key, state);
        }
    }

    states
        .into_iter()
        .map(|(key, state)| VersionStatus { key, state })
        .collect()
}
