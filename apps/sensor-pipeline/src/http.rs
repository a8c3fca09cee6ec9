use crate::feed::FeedSnapshot;
use crate::uploader::UploadStats;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct HttpState {
    pub snapshots: watch::Receiver<Option<FeedSnapshot>>,
    pub uploads: Option<Arc<UploadStats>>,
}

#[derive(Debug, Serialize)]
struct UploadStatus {
    enabled: bool,
    succeeded: u64,
    failed: u64,
    network_retries: u64,
    rate_limit_violations: u64,
    last_error: Option<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_dashboard(
    State(state): State<HttpState>,
) -> Result<Json<FeedSnapshot>, (StatusCode, String)> {
    let snapshot = state.snapshots.borrow().clone();
    snapshot.map(Json).ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "dashboard has not completed a refresh yet".to_string(),
    ))
}

async fn get_uploads(State(state): State<HttpState>) -> Json<UploadStatus> {
    let Some(stats) = state.uploads.as_ref() else {
        return Json(UploadStatus {
            enabled: false,
            succeeded: 0,
            failed: 0,
            network_retries: 0,
            rate_limit_violations: 0,
            last_error: None,
        });
    };
    Json(UploadStatus {
        enabled: true,
        succeeded: stats.succeeded.load(Ordering::Relaxed),
        failed: stats.failed.load(Ordering::Relaxed),
        network_retries: stats.network_retries.load(Ordering::Relaxed),
        rate_limit_violations: stats.rate_limit_violations.load(Ordering::Relaxed),
        last_error: stats
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone()),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/dashboard", get(get_dashboard))
        .route("/v1/uploads", get(get_uploads))
        .with_state(state)
}
