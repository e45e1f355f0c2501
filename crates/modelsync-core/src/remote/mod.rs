//! Read-only access to the remote model store.
//!
//! The daemon never writes upstream. Everything it needs is captured by the
//! [`RemoteStore`] trait: list a directory, stat a path, stream a file.
//!
//! Implementations:
//! - [`WebHdfsStore`] for `hdfs://` and `webhdfs://` roots (WebHDFS REST)
//! - [`LocalStore`] for `file://` roots (mounted filesystems)

mod catalog;
mod local;
mod webhdfs;

pub use catalog::{Catalog, CatalogOptions, RemoteManifest, RemoteModel};
pub use local::LocalStore;
pub use webhdfs::WebHdfsStore;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;

/// Streamed file content.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Supported remote schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `hdfs://nameservice/path`, reached over WebHDFS.
    Hdfs,
    /// `webhdfs://host:port/path`, authority is the HTTP address.
    WebHdfs,
    /// `file:///path`
    File,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Hdfs => "hdfs",
            Scheme::WebHdfs => "webhdfs",
            Scheme::File => "file",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hdfs" => Some(Scheme::Hdfs),
            "webhdfs" | "swebhdfs" => Some(Scheme::WebHdfs),
            "file" => Some(Scheme::File),
            _ => None,
        }
    }
}

/// A parsed remote root such as `hdfs://ns1/serving/models`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub scheme: Scheme,
    /// `host` or `host:port`, absent for `file://`.
    pub authority: Option<String>,
    /// Absolute path inside the store, without a trailing slash.
    pub path: String,
    /// `swebhdfs://` asks for TLS.
    pub tls: bool,
}

impl RemoteLocation {
    /// Parse a remote root. Returns `None` for plain local paths and
    /// unsupported schemes.
    pub fn parse(raw: &str) -> Option<Self> {
        let (scheme_str, _) = raw.split_once("://")?;
        let scheme = Scheme::from_str(scheme_str)?;
        let url = url::Url::parse(raw).ok()?;

        let authority = url.host_str().filter(|h| !h.is_empty()).map(|host| {
            match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            }
        });
        if scheme != Scheme::File && authority.is_none() {
            return None;
        }

        let decoded = urlencoding::decode(url.path())
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| url.path().to_string());

        Some(Self {
            scheme,
            authority,
            path: normalize_path(&decoded),
            tls: scheme_str.eq_ignore_ascii_case("swebhdfs"),
        })
    }

    /// Host part of the authority.
    pub fn host(&self) -> Option<&str> {
        self.authority
            .as_deref()
            .map(|a| a.split(':').next().unwrap_or(a))
    }
}

impl std::fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority.as_deref().unwrap_or(""),
            self.path
        )
    }
}

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry returned by [`RemoteStore::list`] or [`RemoteStore::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Absolute path inside the store.
    pub path: String,
    /// Final path component.
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Lowercase hex SHA-256 if the store knows it.
    pub checksum: Option<String>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Read-only capability over a remote filesystem.
///
/// Failures are reported as retryable (`Remote`, `Timeout`,
/// `NoNamenodeAvailable`) or fatal for the call (`RemoteNotFound`,
/// `RemotePermissionDenied`).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// List the direct children of a directory, sorted by name.
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Metadata for a single path.
    async fn stat(&self, path: &str) -> Result<RemoteEntry>;

    /// Stream the content of a file.
    async fn read(&self, path: &str) -> Result<ByteStream>;
}

/// Read a small remote file fully, refusing anything above `limit` bytes.
pub async fn read_to_bytes(store: &dyn RemoteStore, path: &str, limit: usize) -> Result<Bytes> {
    let mut stream = store.read(path).await?;
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buffer.len() + chunk.len() > limit {
            return Err(SyncError::Other(format!(
                "Remote file {} exceeds {} bytes",
                path, limit
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Open the store that serves `location`.
pub fn open_store(config: &SyncConfig, location: &RemoteLocation) -> Result<Arc<dyn RemoteStore>> {
    match location.scheme {
        Scheme::File => Ok(Arc::new(LocalStore::new())),
        Scheme::Hdfs | Scheme::WebHdfs => {
            Ok(Arc::new(WebHdfsStore::from_location(location, &config.hdfs)?))
        }
    }
}

/// Join a child name onto a remote directory path.
pub fn join_path(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Collapse duplicate slashes and strip the trailing one.
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Final component of a remote path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').find(|p| !p.is_empty()).unwrap_or("")
}
