//! Active version lookup over the TF Serving REST API.

use super::ActiveVersionSource;
use crate::config::NetworkDefaults;
use crate::error::{Result, SyncError};
use crate::model::{parse_version, Version};
use crate::network::HttpClient;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
struct ModelStatusResponse {
    #[serde(default)]
    model_version_status: Vec<VersionStatus>,
}

#[derive(Debug, Deserialize)]
struct VersionStatus {
    /// TF Serving encodes the version as a string.
    version: serde_json::Value,
    state: String,
}

impl VersionStatus {
    fn version(&self) -> Option<Version> {
        match &self.version {
            serde_json::Value::String(s) => parse_version(s),
            serde_json::Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }
}

/// Asks a TF Serving instance which versions are `AVAILABLE`.
#[derive(Debug, Clone)]
pub struct TfServingStatus {
    http: HttpClient,
    base: Url,
}

impl TfServingStatus {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| {
            SyncError::config(format!("Invalid serving status URL '{}': {}", base_url, e))
        })?;
        let http =
            HttpClient::with_timeouts(NetworkDefaults::CONNECT_TIMEOUT, NetworkDefaults::STATUS_TIMEOUT)?;
        Ok(Self { http, base })
    }

    fn status_url(&self, model: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::config(format!("Serving status URL {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(["v1", "models", model]);
        Ok(url)
    }
}

#[async_trait]
impl ActiveVersionSource for TfServingStatus {
    async fn active_version(&self, model: &str) -> Result<Option<Version>> {
        let url = self.status_url(model)?;
        let response = self.http.get(&url).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SyncError::Remote {
                message: format!("Serving status for {} returned HTTP {}", model, status),
                source: None,
            });
        }

        let body: ModelStatusResponse = response.json().await?;
        Ok(body
            .model_version_status
            .iter()
            .filter(|s| s.state.eq_ignore_ascii_case("AVAILABLE"))
            .filter_map(VersionStatus::version)
            .max())
    }
}
