//! Configuration for the model sync daemon.
//!
//! Defaults live as associated constants on [`SyncDefaults`] and
//! [`NetworkDefaults`]. Runtime settings come from an optional YAML file, then
//! environment variables, then whatever the binary overrides from its CLI.

use crate::error::{Result, SyncError};
use crate::model::validate_model_name;
use crate::remote::RemoteLocation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Sync policy defaults and on-disk names.
pub struct SyncDefaults;

impl SyncDefaults {
    pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);
    pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);
    pub const RETENTION: usize = 2;
    pub const FETCH_CONCURRENCY: usize = 4;
    pub const MAX_FETCH_PER_MODEL: usize = 1;
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    /// Time allowed after aborting in-flight fetches before a forced exit.
    pub const ABORT_GRACE: Duration = Duration::from_secs(5);
    pub const MIN_FREE_SPACE_BYTES: u64 = 64 * 1024 * 1024;
    pub const LOCAL_MODEL_ROOT: &'static str = "/models";
    pub const MODEL_PLATFORM: &'static str = "tensorflow";
    pub const ENVIRONMENT: &'static str = "dev";

    pub const MARKER_FILENAME: &'static str = ".modelsync-complete.json";
    pub const STAGING_DIR_NAME: &'static str = ".modelsync-staging";
    pub const TRASH_DIR_NAME: &'static str = "trash";
    pub const LOCK_FILENAME: &'static str = ".modelsync.lock";
    pub const MODEL_CONFIG_FILENAME: &'static str = "models.config";

    // Upstream conventions
    pub const SUCCESS_MARKER: &'static str = "_SUCCESS";
    pub const COPYING_SUFFIX: &'static str = "._COPYING_";
    pub const CHECKSUM_SIDECAR: &'static str = "SHA256SUMS";
}

/// Network-related defaults.
pub struct NetworkDefaults;

impl NetworkDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
    pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
    pub const CIRCUIT_BREAKER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const WEBHDFS_DEFAULT_PORT: u16 = 9870;
    pub const WEBHDFS_PREFIX: &'static str = "/webhdfs/v1";
    pub const CLASSPATH_TIMEOUT: Duration = Duration::from_secs(30);
    pub const USER_AGENT: &'static str = "modelsync/0.3";
}

/// A single HDFS namenode of a name service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamenodeConfig {
    pub nn_id: String,
    /// HTTP address (`host:port`) serving WebHDFS.
    pub address: String,
}

/// HDFS connection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdfsConfig {
    /// Logical name service (`dfs.nameservices`). When it matches the host of
    /// the remote root, `namenodes` are used instead of DNS.
    pub name_services: Option<String>,
    /// Value sent as `user.name`.
    pub user: Option<String>,
    pub namenodes: Vec<NamenodeConfig>,
    /// Use `https` for WebHDFS requests.
    pub use_https: bool,
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote root, e.g. `hdfs://ns1/serving/models`. Sync is disabled when
    /// absent or not a supported scheme.
    pub remote_root: Option<String>,
    /// Local serving directory the model server reads.
    pub local_model_root: PathBuf,
    /// Restrict sync to one model.
    pub model_name: Option<String>,
    /// Remote YAML listing the models to serve.
    pub model_config_path: Option<String>,

    pub sync_interval_secs: u64,
    /// Legacy setting, wins over `sync_interval_secs` when set.
    pub sync_interval_minutes: Option<u64>,
    pub enable_sync_loop: bool,
    pub retention: usize,
    pub fetch_concurrency: usize,
    pub max_fetch_per_model: usize,
    pub shutdown_timeout_secs: u64,
    pub min_free_space_bytes: u64,

    pub verify_checksums: bool,
    pub require_success_marker: bool,
    pub replace_changed_versions: bool,
    pub prune_removed_models: bool,

    pub write_model_config: bool,
    pub model_platform: String,
    /// Base URL of the TF Serving REST API used to ask for loaded versions.
    pub serving_status_url: Option<String>,

    pub hdfs: HdfsConfig,

    #[serde(skip)]
    pub hadoop_home: Option<PathBuf>,
    #[serde(skip)]
    pub hadoop_conf_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_root: None,
            local_model_root: PathBuf::from(SyncDefaults::LOCAL_MODEL_ROOT),
            model_name: None,
            model_config_path: None,
            sync_interval_secs: SyncDefaults::SYNC_INTERVAL.as_secs(),
            sync_interval_minutes: None,
            enable_sync_loop: true,
            retention: SyncDefaults::RETENTION,
            fetch_concurrency: SyncDefaults::FETCH_CONCURRENCY,
            max_fetch_per_model: SyncDefaults::MAX_FETCH_PER_MODEL,
            shutdown_timeout_secs: SyncDefaults::SHUTDOWN_TIMEOUT.as_secs(),
            min_free_space_bytes: SyncDefaults::MIN_FREE_SPACE_BYTES,
            verify_checksums: true,
            require_success_marker: false,
            replace_changed_versions: false,
            prune_removed_models: false,
            write_model_config: false,
            model_platform: SyncDefaults::MODEL_PLATFORM.to_string(),
            serving_status_url: None,
            hdfs: HdfsConfig::default(),
            hadoop_home: None,
            hadoop_conf_dir: None,
        }
    }
}

/// Where the daemon pulls from, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Remote(RemoteLocation),
    /// Sync disabled; the directory is already local.
    LocalOnly(PathBuf),
}

impl SyncConfig {
    /// Load configuration from a YAML file.
    ///
    /// The file may be a flat document or keyed by environment name
    /// (`dev:`, `prod:`). A keyed file without the requested environment is an
    /// error.
    pub fn from_yaml_file(path: &Path, environment: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;
        Self::from_yaml_str(&content, environment).map_err(|e| match e {
            SyncError::Config { message } => SyncError::Config {
                message: format!("{} ({})", message, path.display()),
            },
            other => SyncError::config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                other
            )),
        })
    }

    /// Parse a YAML document, selecting the `environment` section if present.
    pub fn from_yaml_str(content: &str, environment: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(content)?;
        let section = match document.get(environment) {
            Some(section) if section.is_mapping() => section.clone(),
            _ if looks_keyed_by_environment(&document) => {
                return Err(SyncError::config(format!(
                    "Configuration for environment '{}' not found",
                    environment
                )));
            }
            _ => document,
        };

        if section.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_value(section)?)
    }

    /// Apply environment variable overrides through a lookup function.
    ///
    /// Taking a lookup keeps tests away from the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(base) = non_empty("MODEL_BASE_PATH") {
            debug!("MODEL_BASE_PATH={}", base);
            self.remote_root = Some(base);
        }
        if let Some(root) = non_empty("LOCAL_MODEL_ROOT") {
            self.local_model_root = PathBuf::from(root);
        }
        if let Some(name) = non_empty("MODEL_NAME") {
            self.model_name = Some(name);
        }
        if let Some(path) =
            non_empty("MODELSYNC_MODEL_CONFIG_PATH").or_else(|| non_empty("HDFS_MODEL_CONFIG_PATH"))
        {
            self.model_config_path = Some(path);
        }
        if let Some(url) = non_empty("MODELSYNC_SERVING_STATUS_URL") {
            self.serving_status_url = Some(url);
        }
        if let Some(user) = non_empty("HADOOP_USER_NAME") {
            self.hdfs.user = Some(user);
        }
        self.hadoop_home = non_empty("HADOOP_HOME").map(PathBuf::from);
        self.hadoop_conf_dir = non_empty("HADOOP_CONF_DIR").map(PathBuf::from);
    }

    /// Load from the process environment: optional file named by
    /// `MODELSYNC_CONFIG`, environment section from `MODELSYNC_ENV` or `APP_ENV`.
    pub fn from_env(config_path: Option<&Path>) -> Result<Self> {
        let environment = std::env::var("MODELSYNC_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| SyncDefaults::ENVIRONMENT.to_string());

        let file = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("MODELSYNC_CONFIG").map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_yaml_file(&path, &environment)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Check the configuration for values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.local_model_root.as_os_str().is_empty() {
            return Err(SyncError::config("local_model_root must not be empty"));
        }
        if self.retention == 0 {
            return Err(SyncError::config("retention must be at least 1"));
        }
        if self.fetch_concurrency == 0 {
            return Err(SyncError::config("fetch_concurrency must be at least 1"));
        }
        if self.max_fetch_per_model == 0 {
            return Err(SyncError::config("max_fetch_per_model must be at least 1"));
        }
        if let Some(name) = &self.model_name {
            validate_model_name(name).map_err(|_| {
                SyncError::config(format!("MODEL_NAME '{}' is not a valid model name", name))
            })?;
        }
        for nn in &self.hdfs.namenodes {
            if nn.address.trim().is_empty() {
                return Err(SyncError::config(format!(
                    "namenode '{}' has an empty address",
                    nn.nn_id
                )));
            }
        }
        if let Some(url) = &self.serving_status_url {
            url::Url::parse(url).map_err(|e| {
                SyncError::config(format!("serving_status_url '{}' is invalid: {}", url, e))
            })?;
        }
        Ok(())
    }

    /// Resolve where the daemon syncs from.
    pub fn sync_target(&self) -> SyncTarget {
        match self.remote_root.as_deref() {
            Some(root) => match RemoteLocation::parse(root) {
                Some(location) => SyncTarget::Remote(location),
                None => SyncTarget::LocalOnly(PathBuf::from(root)),
            },
            None => SyncTarget::LocalOnly(self.local_model_root.clone()),
        }
    }

    /// Effective interval between passes, clamped to the minimum.
    pub fn sync_interval(&self) -> Duration {
        let interval = match self.sync_interval_minutes {
            Some(minutes) => Duration::from_secs(minutes.saturating_mul(60)),
            None => Duration::from_secs(self.sync_interval_secs),
        };
        interval.max(SyncDefaults::MIN_SYNC_INTERVAL)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn looks_keyed_by_environment(document: &serde_yaml::Value) -> bool {
    const ENVIRONMENTS: &[&str] = &["dev", "test", "staging", "prod", "production"];
    document
        .as_mapping()
        .map(|map| {
            map.keys()
                .filter_map(|k| k.as_str())
                .any(|k| ENVIRONMENTS.contains(&k))
        })
        .unwrap_or(false)
}
