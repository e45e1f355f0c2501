//! Modelsync Core - Headless library for syncing serving models from HDFS.
//!
//! Pulls versioned model directories (`<root>/<model>/<version>/`) from a
//! remote store into the local directory a model server reads, so the server
//! only ever sees fully-fetched, verified versions. Old versions are evicted
//! past a retention count without removing the one being served.
//!
//! The `modelsyncd` binary wraps this crate with signal handling and a
//! supervisor for the serving process.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelsync_core::{SyncConfig, SyncDaemon, SyncTarget};
//!
//! #[tokio::main]
//! async fn main() -> modelsync_core::Result<()> {
//!     let config = SyncConfig::from_env(None)?;
//!     config.validate()?;
//!
//!     if let SyncTarget::Remote(location) = config.sync_target() {
//!         let daemon = SyncDaemon::from_config(config, location)?;
//!         let _lock = daemon.prepare()?;
//!         let report = daemon.run_once().await?;
//!         println!("{} actions, {} failed", report.plan.actions.len(), report.execution.failed());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod hadoop;
pub mod hashing;
pub mod layout;
pub mod metadata;
pub mod model;
pub mod network;
pub mod planner;
pub mod remote;
pub mod serving;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{HdfsConfig, NamenodeConfig, NetworkDefaults, SyncConfig, SyncDefaults, SyncTarget};
pub use daemon::{DaemonState, PassReport, PlanPreview, SyncDaemon};
pub use error::{ErrorClass, Result, SyncError};
pub use executor::{ActionReport, ExecutionReport, Executor, ExecutorOptions, Outcome, PromoteResult};
pub use layout::{CompletionMarker, LocalLayout, LocalState, RootLock};
pub use model::{ManifestEntry, ManifestFile, Version, VersionKey, VersionState};
pub use planner::{Action, PlannerPolicy, SyncPlan, VersionStatus};
pub use remote::{LocalStore, RemoteLocation, RemoteStore, WebHdfsStore};
pub use serving::{ActiveVersionSource, ModelConfigList, StaticActiveVersions, TfServingStatus};
