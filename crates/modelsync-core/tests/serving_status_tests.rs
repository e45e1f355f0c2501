//! Active version lookups against a fake TF Serving REST endpoint.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use modelsync_core::{ActiveVersionSource, TfServingStatus};
use serde_json::json;
use std::net::SocketAddr;

async fn model_status(Path(name): Path<String>) -> Response {
    match name.as_str() {
        "ranker" => Json(json!({
            "model_version_status": [
                { "version": "3", "state": "END", "status": { "error_code": "OK", "error_message": "" } },
                { "version": "4", "state": "AVAILABLE", "status": { "error_code": "OK", "error_message": "" } },
                { "version": "5", "state": "LOADING", "status": { "error_code": "OK", "error_message": "" } }
            ]
        }))
        .into_response(),
        "warming" => Json(json!({
            "model_version_status": [
                { "version": "1", "state": "LOADING", "status": { "error_code": "OK", "error_message": "" } }
            ]
        }))
        .into_response(),
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Servable not found for request: Latest({})", name) })),
        )
            .into_response(),
    }
}

async fn serve() -> SocketAddr {
    let app = Router::new().route("/v1/models/:name", get(model_status));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_newest_available_version_is_active() {
    let addr = serve().await;
    let status = TfServingStatus::new(&format!("http://{}", addr)).unwrap();

    assert_eq!(status.active_version("ranker").await.unwrap(), Some(4));
    assert_eq!(status.active_version("warming").await.unwrap(), None);
}

#[tokio::test]
async fn test_unknown_model_has_no_active_version() {
    let addr = serve().await;
    let status = TfServingStatus::new(&format!("http://{}/", addr)).unwrap();
    assert_eq!(status.active_version("unknown").await.unwrap(), None);
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let addr = serve().await;
    let status = TfServingStatus::new(&format!("http://{}", addr)).unwrap();
    assert!(status.active_version("broken").await.is_err());
}
