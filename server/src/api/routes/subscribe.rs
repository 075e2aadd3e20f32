//! `POST /subscribe`: the subscribe/unsubscribe handshake (spec §6).

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;

use crate::api::AppState;
use crate::api::error::ApiError;
use crate::api::routes::{form_all, form_first, parse_form};
use crate::subscriptions::{SubscribeRequest, SyncOutcome, VerifyMode};

pub async fn post(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let form = parse_form(&body);
    handle(&state, &form).await
}

pub async fn handle(state: &AppState, form: &[(String, String)]) -> Result<StatusCode, ApiError> {
    let mode = form_first(form, "hub.mode")
        .ok_or_else(|| ApiError::BadRequest("missing hub.mode".to_string()))?;
    let callback = form_first(form, "hub.callback")
        .ok_or_else(|| ApiError::BadRequest("missing hub.callback".to_string()))?
        .to_string();
    let topic = form_first(form, "hub.topic")
        .ok_or_else(|| ApiError::BadRequest("missing hub.topic".to_string()))?
        .to_string();
    let verify_token = form_first(form, "hub.verify_token").map(str::to_string);
    let secret = form_first(form, "hub.secret").map(str::to_string);
    let verify_mode = parse_verify_mode(&form_all(form, "hub.verify"))?;
    let lease_seconds = match form_first(form, "hub.lease_seconds") {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ApiError::BadRequest(format!("invalid hub.lease_seconds '{raw}'")))?,
        ),
        None => None,
    };

    let outcome = match mode {
        "subscribe" => {
            let req = SubscribeRequest {
                callback,
                topic,
                verify_token,
                secret,
                lease_seconds,
                mode: verify_mode,
            };
            state.subscriptions.subscribe(req).await?
        }
        "unsubscribe" => {
            state
                .subscriptions
                .unsubscribe(&callback, &topic, verify_token, verify_mode)
                .await?
        }
        other => return Err(ApiError::BadRequest(format!("invalid hub.mode '{other}'"))),
    };

    Ok(status_for(outcome))
}

/// `hub.verify` is a repeatable, preference-ordered list; the hub picks
/// the first value it supports.
fn parse_verify_mode(values: &[&str]) -> Result<VerifyMode, ApiError> {
    values
        .iter()
        .find_map(|v| match *v {
            "sync" => Some(VerifyMode::Sync),
            "async" => Some(VerifyMode::Async),
            _ => None,
        })
        .ok_or_else(|| ApiError::BadRequest("missing or unsupported hub.verify".to_string()))
}

fn status_for(outcome: SyncOutcome) -> StatusCode {
    match outcome {
        SyncOutcome::Verified | SyncOutcome::NoOp => StatusCode::NO_CONTENT,
        SyncOutcome::Accepted => StatusCode::ACCEPTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_mode_picks_first_supported_preference() {
        assert_eq!(parse_verify_mode(&["async", "sync"]).unwrap(), VerifyMode::Async);
        assert_eq!(parse_verify_mode(&["sync"]).unwrap(), VerifyMode::Sync);
        assert!(parse_verify_mode(&["unknown"]).is_err());
        assert!(parse_verify_mode(&[]).is_err());
    }

    #[test]
    fn status_mapping_matches_spec_table() {
        assert_eq!(status_for(SyncOutcome::Verified), StatusCode::NO_CONTENT);
        assert_eq!(status_for(SyncOutcome::NoOp), StatusCode::NO_CONTENT);
        assert_eq!(status_for(SyncOutcome::Accepted), StatusCode::ACCEPTED);
    }
}
