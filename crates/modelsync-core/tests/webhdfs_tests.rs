//! WebHDFS store against a fake namenode served by axum.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::TryStreamExt;
use modelsync_core::network::RetryConfig;
use modelsync_core::remote::RemoteStore;
use modelsync_core::{RemoteLocation, SyncConfig, SyncDaemon, SyncError, WebHdfsStore};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MODIFIED_MS: i64 = 1_700_000_000_000;

/// A namenode with an in-memory namespace. `OPEN` redirects to a datanode
/// route on the same server, like a real cluster does.
struct FakeNamenode {
    files: BTreeMap<String, Vec<u8>>,
    standby: bool,
    requests: AtomicUsize,
}

impl FakeNamenode {
    fn new(files: &[(&str, &str)], standby: bool) -> Arc<Self> {
        Arc::new(Self {
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
                .collect(),
            standby,
            requests: AtomicUsize::new(0),
        })
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn children(&self, path: &str) -> Vec<serde_json::Value> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for (file, content) in &self.files {
            let Some(rest) = file.strip_prefix(&prefix) else { continue };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.insert(dir.to_string(), status(dir, "DIRECTORY", 0));
                }
                None => {
                    children.insert(rest.to_string(), status(rest, "FILE", content.len()));
                }
            }
        }
        children.into_values().collect()
    }
}

fn status(suffix: &str, kind: &str, length: usize) -> serde_json::Value {
    json!({
        "accessTime": 0,
        "blockSize": 134217728,
        "group": "hadoop",
        "length": length,
        "modificationTime": MODIFIED_MS,
        "owner": "serving",
        "pathSuffix": suffix,
        "permission": "755",
        "replication": 3,
        "type": kind,
    })
}

fn remote_exception(status: StatusCode, exception: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "RemoteException": {
                "exception": exception,
                "javaClassName": format!("org.apache.hadoop.{}", exception),
                "message": message,
            }
        })),
    )
        .into_response()
}

async fn namenode(
    State(nn): State<Arc<FakeNamenode>>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    nn.requests.fetch_add(1, Ordering::SeqCst);
    if nn.standby {
        return remote_exception(
            StatusCode::FORBIDDEN,
            "StandbyException",
            "Operation category READ is not supported in state standby",
        );
    }

    let path = format!("/{}", path.trim_end_matches('/'));
    let not_found = || remote_exception(StatusCode::NOT_FOUND, "FileNotFoundException", &format!("File {} does not exist.", path));
    match query.get("op").map(String::as_str) {
        Some("LISTSTATUS") if nn.is_dir(&path) => {
            Json(json!({ "FileStatuses": { "FileStatus": nn.children(&path) } })).into_response()
        }
        Some("GETFILESTATUS") if nn.is_dir(&path) => {
            Json(json!({ "FileStatus": status("", "DIRECTORY", 0) })).into_response()
        }
        Some("GETFILESTATUS") => match nn.files.get(&path) {
            Some(content) => Json(json!({ "FileStatus": status("", "FILE", content.len()) })).into_response(),
            None => not_found(),
        },
        Some("OPEN") if nn.files.contains_key(&path) => (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, format!("/datanode{}", path))],
        )
            .into_response(),
        Some("LISTSTATUS") | Some("OPEN") => not_found(),
        _ => remote_exception(StatusCode::BAD_REQUEST, "IllegalArgumentException", "Invalid value for webhdfs parameter \"op\""),
    }
}

async fn datanode(State(nn): State<Arc<FakeNamenode>>, Path(path): Path<String>) -> Response {
    match nn.files.get(&format!("/{}", path)) {
        Some(content) => content.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve(nn: Arc<FakeNamenode>) -> SocketAddr {
    let app = Router::new()
        .route("/webhdfs/v1/*path", get(namenode))
        .route("/datanode/*path", get(datanode))
        .with_state(nn);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn model_tree() -> Vec<(&'static str, &'static str)> {
    vec![
        ("/models/ranker/1/saved_model.pb", "graph v1"),
        ("/models/ranker/2/saved_model.pb", "graph v2"),
        ("/models/ranker/2/variables/variables.index", "index"),
        ("/models/ranker/2/_SUCCESS", ""),
    ]
}

fn single_attempt() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(1)
        .with_base_delay(Duration::from_millis(10))
        .with_jitter(false)
}

#[tokio::test]
async fn test_list_stat_and_read() {
    let nn = FakeNamenode::new(&model_tree(), false);
    let addr = serve(Arc::clone(&nn)).await;
    let store = WebHdfsStore::with_namenodes(
        "ns1",
        vec![("nn1".to_string(), addr.to_string())],
        Some("serving".to_string()),
        false,
    )
    .unwrap();

    let entries = store.list("/models/ranker/2").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["_SUCCESS", "saved_model.pb", "variables"]);
    assert!(entries[2].is_dir());
    assert_eq!(entries[1].size, 8);
    assert_eq!(entries[1].path, "/models/ranker/2/saved_model.pb");
    assert!(entries[1].modified.is_some());

    assert!(store.stat("/models").await.unwrap().is_dir());

    let chunks: Vec<bytes::Bytes> = store
        .read("/models/ranker/2/saved_model.pb")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), b"graph v2");
}

#[tokio::test]
async fn test_missing_path_is_not_retried() {
    let nn = FakeNamenode::new(&model_tree(), false);
    let addr = serve(Arc::clone(&nn)).await;
    let store =
        WebHdfsStore::with_namenodes("ns1", vec![("nn1".to_string(), addr.to_string())], None, false)
            .unwrap();

    let err = store.list("/models/missing").await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteNotFound(_)));
    assert_eq!(nn.requests(), 1);
}

#[tokio::test]
async fn test_standby_namenode_fails_over() {
    let standby = FakeNamenode::new(&model_tree(), true);
    let active = FakeNamenode::new(&model_tree(), false);
    let standby_addr = serve(Arc::clone(&standby)).await;
    let active_addr = serve(Arc::clone(&active)).await;

    let store = WebHdfsStore::with_namenodes(
        "ns1",
        vec![
            ("nn1".to_string(), standby_addr.to_string()),
            ("nn2".to_string(), active_addr.to_string()),
        ],
        None,
        false,
    )
    .unwrap();

    let entries = store.list("/models").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(standby.requests(), 1);

    // The active namenode is preferred from now on.
    store.list("/models/ranker").await.unwrap();
    assert_eq!(standby.requests(), 1);
    assert_eq!(active.requests(), 2);
}

#[tokio::test]
async fn test_all_standby_reports_no_namenode() {
    let first = FakeNamenode::new(&model_tree(), true);
    let second = FakeNamenode::new(&model_tree(), true);
    let store = WebHdfsStore::with_namenodes(
        "ns1",
        vec![
            ("nn1".to_string(), serve(Arc::clone(&first)).await.to_string()),
            ("nn2".to_string(), serve(Arc::clone(&second)).await.to_string()),
        ],
        None,
        false,
    )
    .unwrap()
    .with_retry(single_attempt());

    let err = store.list("/models").await.unwrap_err();
    assert!(matches!(err, SyncError::NoNamenodeAvailable { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_daemon_syncs_over_webhdfs() {
    let nn = FakeNamenode::new(&model_tree(), false);
    let addr = serve(Arc::clone(&nn)).await;
    let tmp = TempDir::new().unwrap();

    let config = SyncConfig {
        remote_root: Some(format!("webhdfs://{}/models", addr)),
        local_model_root: tmp.path().to_path_buf(),
        min_free_space_bytes: 0,
        require_success_marker: true,
        ..SyncConfig::default()
    };
    let location = RemoteLocation::parse(config.remote_root.as_deref().unwrap()).unwrap();
    let daemon = SyncDaemon::from_config(config, location).unwrap();
    daemon.check_remote().await.unwrap();

    let report = daemon.run_pass().await.unwrap();
    assert!(!report.has_failures());

    // Version 1 has no _SUCCESS marker and is ignored.
    let version = tmp.path().join("ranker/2");
    assert_eq!(std::fs::read_to_string(version.join("saved_model.pb")).unwrap(), "graph v2");
    assert_eq!(
        std::fs::read_to_string(version.join("variables/variables.index")).unwrap(),
        "index"
    );
    assert!(!version.join("_SUCCESS").exists());
    assert!(!tmp.path().join("ranker/1").exists());
}
