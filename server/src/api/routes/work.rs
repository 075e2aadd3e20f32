//! `/work/*` handlers: the task-queue and cron entry points behind
//! [`crate::api::auth::require_work_auth`].

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;

use crate::api::AppState;
use crate::api::error::ApiError;
use crate::poller;
use crate::poller::ScanTask;

#[derive(Debug, Deserialize)]
pub struct SubscriptionTask {
    subscription_key: String,
}

pub async fn subscriptions(
    State(state): State<AppState>,
    Json(task): Json<SubscriptionTask>,
) -> Result<StatusCode, ApiError> {
    state.subscriptions.confirm_work(&task.subscription_key).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct PullFeedsTask {
    topic: String,
}

pub async fn pull_feeds(
    State(state): State<AppState>,
    Json(task): Json<PullFeedsTask>,
) -> Result<StatusCode, ApiError> {
    state.feeds.fetch_worker(&task.topic).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct PushEventsTask {
    event_key: String,
}

pub async fn push_events(
    State(state): State<AppState>,
    Json(task): Json<PushEventsTask>,
) -> Result<StatusCode, ApiError> {
    state.delivery.deliver(&task.event_key).await?;
    Ok(StatusCode::OK)
}

/// `GET /work/poll_bootstrap`: advances the polling marker and kicks off a
/// scan generation if due.
pub async fn poll_bootstrap_trigger(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.poller.trigger().await?;
    Ok(StatusCode::OK)
}

/// `POST /work/poll_bootstrap`: continuation of a scan generation. The
/// dispatcher posts the JSON body produced by the previous chunk's
/// `Some(&format!("{sequence}-{hash}"))`-named task.
pub async fn poll_bootstrap_continue(
    State(state): State<AppState>,
    Json(task): Json<ScanTask>,
) -> Result<StatusCode, ApiError> {
    state.poller.scan_chunk(&task).await?;
    Ok(StatusCode::OK)
}

/// `GET /work/event_cleanup`: reaps totally-failed events past their
/// retention window.
pub async fn event_cleanup(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    poller::reap_expired_events(&state.store).await?;
    Ok(StatusCode::OK)
}
