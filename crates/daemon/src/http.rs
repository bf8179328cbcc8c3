//! The daemon's HTTP surface: trigger a reconcile, inspect sync progress.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use drover_core::Platform;

use crate::Daemon;

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/v1/sync", post(sync_cluster).get(sync_status))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(daemon)
}

/// POST /v1/sync: kick off a reconcile and acknowledge; the work proceeds in
/// the background.
async fn sync_cluster(State(daemon): State<Arc<Daemon>>) -> StatusCode {
    tokio::spawn(async move {
        if let Err(err) = daemon.sync_cluster().await {
            warn!(error = %err, "background sync failed");
        }
    });
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct SyncStatusParams {
    #[serde(rename = "ref", default = "head_ref")]
    reference: String,
}

fn head_ref() -> String {
    "HEAD".to_string()
}

/// GET /v1/sync?ref=<ref>: the commit hashes pending application relative to
/// the given ref, newest first.
async fn sync_status(
    State(daemon): State<Arc<Daemon>>,
    Query(params): Query<SyncStatusParams>,
) -> Response {
    match daemon.sync_status(params.reference).await {
        Ok(commits) => Json(commits).into_response(),
        Err(err) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() })))
                .into_response()
        }
    }
}

/// Anything else is a client calling an old or unsupported API.
async fn not_found(uri: Uri) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "no such API route", "path": uri.path() })))
        .into_response()
}
