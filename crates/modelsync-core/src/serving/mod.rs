//! Integration points with the model server.
//!
//! - [`ActiveVersionSource`]: which version the server is answering with
//! - [`ModelConfigList`]: the model list read upstream and the `models.config`
//!   written locally

mod model_config;
mod status;

pub use model_config::{render_model_config, write_model_config, ModelConfigEntry, ModelConfigList};
pub use status::TfServingStatus;

use crate::error::Result;
use crate::model::Version;
use async_trait::async_trait;
use std::collections::HashMap;

/// Reports the version a model server is actively serving.
///
/// `Ok(None)` means the server does not know the model (yet). Errors are
/// treated the same way by the planner, after being logged.
#[async_trait]
pub trait ActiveVersionSource: Send + Sync {
    async fn active_version(&self, model: &str) -> Result<Option<Version>>;
}

/// Fixed answers, for setups where the active version is pinned externally.
#[derive(Debug, Clone, Default)]
pub struct StaticActiveVersions {
    versions: HashMap<String, Version>,
}

impl StaticActiveVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, model: impl Into<String>, version: Version) -> Self {
        self.versions.insert(model.into(), version);
        self
    }
}

#[async_trait]
impl ActiveVersionSource for StaticActiveVersions {
    async fn active_version(&self, model: &str) -> Result<Option<Version>> {
        Ok(self.versions.get(model).copied())
    }
}
