//! WebHDFS remote store with HA namenode failover.
//!
//! Uses the REST operations `LISTSTATUS`, `GETFILESTATUS` and `OPEN`. `OPEN`
//! answers with a redirect to a datanode which reqwest follows.
//!
//! For an HA name service every configured namenode is tried, starting with
//! the one that answered last. Standby namenodes reply with a
//! `StandbyException`, which moves on to the next namenode without counting as
//! a failure. A namenode whose circuit is open is skipped.

use super::{file_name, join_path, ByteStream, EntryKind, RemoteEntry, RemoteLocation, RemoteStore, Scheme};
use crate::config::{HdfsConfig, NetworkDefaults};
use crate::error::{Result, SyncError};
use crate::network::{retry_async, CircuitBreaker, HttpClient, RetryConfig};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use url::Url;

/// A namenode HTTP endpoint.
#[derive(Debug)]
struct Namenode {
    id: String,
    base: Url,
    breaker: CircuitBreaker,
}

/// WebHDFS-backed remote store.
#[derive(Debug)]
pub struct WebHdfsStore {
    http: HttpClient,
    nameservice: String,
    namenodes: Vec<Namenode>,
    /// Index of the namenode that answered last.
    preferred: AtomicUsize,
    user: Option<String>,
    retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ListStatus,
    GetFileStatus,
    Open,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::ListStatus => "LISTSTATUS",
            Operation::GetFileStatus => "GETFILESTATUS",
            Operation::Open => "OPEN",
        }
    }
}

// WebHDFS JSON payloads

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListStatusResponse {
    file_statuses: FileStatuses,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileStatuses {
    #[serde(default)]
    file_status: Vec<FileStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileStatusResponse {
    file_status: FileStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStatus {
    #[serde(default)]
    path_suffix: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    modification_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteExceptionResponse {
    remote_exception: RemoteException,
}

#[derive(Debug, Deserialize)]
struct RemoteException {
    #[serde(default)]
    exception: String,
    #[serde(default)]
    message: String,
}

impl FileStatus {
    fn into_entry(self, path: String) -> RemoteEntry {
        let kind = if self.kind.eq_ignore_ascii_case("DIRECTORY") {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        RemoteEntry {
            name: file_name(&path).to_string(),
            path,
            kind,
            size: if kind == EntryKind::Directory { 0 } else { self.length },
            modified: self
                .modification_time
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            checksum: None,
        }
    }
}

/// Outcome of asking one namenode.
enum Attempt {
    Answered(Response),
    /// Namenode is healthy but not active.
    Standby,
    Failed(SyncError),
}

impl WebHdfsStore {
    /// Build a store for `location`, resolving namenodes from `hdfs`.
    ///
    /// - `webhdfs://host:port` talks to that address directly
    /// - `hdfs://<name_services>` uses the configured namenode list
    /// - `hdfs://host[:rpc-port]` talks to `host` on the default WebHDFS port
    pub fn from_location(location: &RemoteLocation, hdfs: &HdfsConfig) -> Result<Self> {
        let authority = location
            .authority
            .clone()
            .ok_or_else(|| SyncError::config(format!("{} has no authority", location)))?;
        let host = location.host().unwrap_or(&authority).to_string();
        let use_https = hdfs.use_https || location.tls;

        let addresses: Vec<(String, String)> = match location.scheme {
            Scheme::WebHdfs => vec![(host.clone(), authority.clone())],
            _ => {
                let is_nameservice = hdfs.name_services.as_deref() == Some(host.as_str())
                    || (hdfs.name_services.is_none() && !hdfs.namenodes.is_empty());
                if is_nameservice && !hdfs.namenodes.is_empty() {
                    hdfs.namenodes
                        .iter()
                        .map(|nn| (nn.nn_id.clone(), nn.address.clone()))
                        .collect()
                } else {
                    vec![(
                        host.clone(),
                        format!("{}:{}", host, NetworkDefaults::WEBHDFS_DEFAULT_PORT),
                    )]
                }
            }
        };

        Self::with_namenodes(host, addresses, hdfs.user.clone(), use_https)
    }

    /// Build a store from explicit `(id, host:port)` namenode addresses.
    pub fn with_namenodes(
        nameservice: impl Into<String>,
        addresses: Vec<(String, String)>,
        user: Option<String>,
        use_https: bool,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(SyncError::config("no WebHDFS namenodes configured"));
        }
        let scheme = if use_https { "https" } else { "http" };
        let namenodes = addresses
            .into_iter()
            .map(|(id, address)| {
                let base = Url::parse(&format!("{}://{}", scheme, address)).map_err(|e| {
                    SyncError::config(format!("invalid namenode address '{}': {}", address, e))
                })?;
                Ok(Namenode {
                    breaker: CircuitBreaker::new(address),
                    id,
                    base,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            http: HttpClient::new()?,
            nameservice: nameservice.into(),
            namenodes,
            preferred: AtomicUsize::new(0),
            user,
            retry: RetryConfig::default(),
        })
    }

    /// Override the retry policy for metadata calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn operation_url(&self, base: &Url, path: &str, op: Operation) -> Result<Url> {
        let encoded: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        let mut url = base
            .join(&format!(
                "{}/{}",
                NetworkDefaults::WEBHDFS_PREFIX,
                encoded.join("/")
            ))
            .map_err(|e| SyncError::Other(format!("Invalid WebHDFS path {}: {}", path, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("op", op.as_str());
            if let Some(user) = &self.user {
                query.append_pair("user.name", user);
            }
        }
        Ok(url)
    }

    async fn attempt(&self, namenode: &Namenode, path: &str, op: Operation) -> Attempt {
        let url = match self.operation_url(&namenode.base, path, op) {
            Ok(url) => url,
            Err(e) => return Attempt::Failed(e),
        };
        let sent = if op == Operation::Open {
            self.http.get_streaming(&url).await
        } else {
            self.http.get(&url).await
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                namenode.breaker.record_failure();
                return Attempt::Failed(e);
            }
        };

        let status = response.status();
        if status.is_success() {
            namenode.breaker.record_success();
            return Attempt::Answered(response);
        }
        if HttpClient::is_retryable_status(status) {
            namenode.breaker.record_failure();
            let message = exception_message(response).await;
            return Attempt::Failed(SyncError::Remote {
                message: format!("{} {} on {}: {} {}", op.as_str(), path, namenode.id, status, message),
                source: None,
            });
        }

        // 4xx: either a standby namenode or a real answer about the path.
        let (exception, message) = match response.json::<RemoteExceptionResponse>().await {
            Ok(body) => (body.remote_exception.exception, body.remote_exception.message),
            Err(_) => (String::new(), String::new()),
        };
        namenode.breaker.record_success();
        if exception == "StandbyException" {
            debug!("Namenode {} is standby", namenode.id);
            return Attempt::Standby;
        }
        Attempt::Failed(classify_client_error(status, &exception, &message, path))
    }

    /// Send `op` for `path`, failing over across namenodes.
    async fn call(&self, path: &str, op: Operation) -> Result<Response> {
        let count = self.namenodes.len();
        let start = self.preferred.load(Ordering::Relaxed) % count;
        let mut last_error: Option<SyncError> = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            let namenode = &self.namenodes[index];
            if !namenode.breaker.allow_request() {
                debug!("Skipping namenode {} (circuit open)", namenode.id);
                continue;
            }
            match self.attempt(namenode, path, op).await {
                Attempt::Answered(response) => {
                    if index != start {
                        debug!("Switching preferred namenode to {}", namenode.id);
                    }
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Attempt::Standby => continue,
                Attempt::Failed(e) if e.is_fatal_io() => {
                    self.preferred.store(index, Ordering::Relaxed);
                    return Err(e);
                }
                Attempt::Failed(e) => {
                    warn!("WebHDFS {} {} failed on {}: {}", op.as_str(), path, namenode.id, e);
                    last_error = Some(e);
                }
            }
        }

        Err(SyncError::NoNamenodeAvailable {
            nameservice: self.nameservice.clone(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "all namenodes are standby or circuit-open".to_string()),
        })
    }

    async fn call_with_retry(&self, path: &str, op: Operation) -> Result<Response> {
        let label = format!("WebHDFS {} {}", op.as_str(), path);
        retry_async(
            &self.retry,
            &label,
            || self.call(path, op),
            |e: &SyncError| e.is_retryable(),
        )
        .await
    }
}

async fn exception_message(response: Response) -> String {
    match response.json::<RemoteExceptionResponse>().await {
        Ok(body) => format!(
            "{}: {}",
            body.remote_exception.exception, body.remote_exception.message
        ),
        Err(_) => String::new(),
    }
}

fn classify_client_error(status: StatusCode, exception: &str, message: &str, path: &str) -> SyncError {
    match (status, exception) {
        (_, "FileNotFoundException") | (StatusCode::NOT_FOUND, _) => {
            SyncError::RemoteNotFound(path.to_string())
        }
        (_, "AccessControlException") | (StatusCode::FORBIDDEN, _) | (StatusCode::UNAUTHORIZED, _) => {
            SyncError::RemotePermissionDenied(path.to_string())
        }
        _ => SyncError::Remote {
            message: format!("{} for {}: {} {}", status, path, exception, message),
            source: None,
        },
    }
}

#[async_trait]
impl RemoteStore for WebHdfsStore {
    fn describe(&self) -> String {
        let ids: Vec<&str> = self.namenodes.iter().map(|n| n.id.as_str()).collect();
        format!("webhdfs {} [{}]", self.nameservice, ids.join(", "))
    }

    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let response = self.call_with_retry(path, Operation::ListStatus).await?;
        let body: ListStatusResponse = response.json().await.map_err(|e| SyncError::Remote {
            message: format!("Invalid LISTSTATUS response for {}: {}", path, e),
            source: Some(e),
        })?;

        let mut entries: Vec<RemoteEntry> = body
            .file_statuses
            .file_status
            .into_iter()
            .filter(|status| !status.path_suffix.is_empty())
            .map(|status| {
                let child = join_path(path, &status.path_suffix);
                status.into_entry(child)
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry> {
        let response = self.call_with_retry(path, Operation::GetFileStatus).await?;
        let body: FileStatusResponse = response.json().await.map_err(|e| SyncError::Remote {
            message: format!("Invalid GETFILESTATUS response for {}: {}", path, e),
            source: Some(e),
        })?;
        Ok(body.file_status.into_entry(path.to_string()))
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        let response = self.call_with_retry(path, Operation::Open).await?;
        let owned_path = path.to_string();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| SyncError::Remote {
                message: format!("Read of {} interrupted: {}", owned_path, e),
                source: Some(e),
            })
        });
        Ok(Box::pin(stream))
    }
}
