//! HTTP client wrapper.
//!
//! Provides a reqwest client with:
//! - Connect timeout and user agent set once
//! - Bounded timeouts for metadata calls
//! - Unbounded (stream-driven) requests for file content

use crate::config::NetworkDefaults;
use crate::{Result, SyncError};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// HTTP client used for WebHDFS and TF Serving status calls.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    request_timeout: Duration,
}

impl HttpClient {
    /// Create a client with default timeouts.
    pub fn new() -> Result<Self> {
        Self::with_timeouts(NetworkDefaults::CONNECT_TIMEOUT, NetworkDefaults::REQUEST_TIMEOUT)
    }

    /// Create a client with explicit connect and metadata-request timeouts.
    pub fn with_timeouts(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(NetworkDefaults::USER_AGENT)
            .build()
            .map_err(|e| SyncError::Remote {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Get a reference to the underlying reqwest client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET with the metadata timeout applied.
    pub async fn get(&self, url: &Url) -> Result<Response> {
        debug!("GET {}", redact(url));
        self.client
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| request_error("GET", url, e))
    }

    /// GET without a total timeout; the body is streamed by the caller.
    pub async fn get_streaming(&self, url: &Url) -> Result<Response> {
        debug!("GET (stream) {}", redact(url));
        self.client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error("GET", url, e))
    }

    /// Check if a status code indicates a transient failure.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
    }
}

fn request_error(method: &str, url: &Url, err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout(format!("{} {}", method, redact(url)))
    } else {
        SyncError::Remote {
            message: format!("{} {} failed: {}", method, redact(url), err),
            source: Some(err),
        }
    }
}

/// URL without its query string, for logs.
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
