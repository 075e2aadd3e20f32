//! `POST /publish`: publisher ping (spec §6).

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;

use crate::api::AppState;
use crate::api::error::ApiError;
use crate::api::routes::{form_all, form_first, parse_form};

pub async fn post(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let form = parse_form(&body);
    handle(&state, &form).await
}

pub async fn handle(state: &AppState, form: &[(String, String)]) -> Result<StatusCode, ApiError> {
    let mode = form_first(form, "hub.mode")
        .ok_or_else(|| ApiError::BadRequest("missing hub.mode".to_string()))?;
    if mode != "publish" {
        return Err(ApiError::BadRequest(format!("invalid hub.mode '{mode}'")));
    }

    let urls: Vec<String> = form_all(form, "hub.url").into_iter().map(str::to_string).collect();
    state.feeds.publish(&urls).await?;
    Ok(StatusCode::NO_CONTENT)
}
