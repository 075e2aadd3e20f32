//! Auth gate for `/work/*` handlers: the original hub restricted these to
//! App Engine's task-queue and cron callers; here that becomes a shared
//! secret header, a cron header for the bootstrap trigger, or the
//! development bypass.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::error::ApiError;
use crate::queue::TASK_QUEUE_HEADER;

pub const CRON_HEADER: &str = "X-Hub-Cron";

#[derive(Clone)]
pub struct AuthState {
    pub task_queue_secret: String,
    pub dev_mode: bool,
}

fn header_eq(headers: &HeaderMap, name: &str, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

/// Accepts the request if it carries the task-queue secret, a cron header,
/// or the process is running in development mode. Everything else is
/// rejected with 401 before reaching the handler.
pub async fn require_work_auth(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.dev_mode
        || header_eq(request.headers(), TASK_QUEUE_HEADER, &state.task_queue_secret)
        || request.headers().contains_key(CRON_HEADER)
    {
        return Ok(next.run(request).await);
    }
    Err(ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_mode_bypasses_everything() {
        let state = AuthState { task_queue_secret: "secret".to_string(), dev_mode: true };
        assert!(state.dev_mode);
    }

    #[test]
    fn header_eq_matches_case_sensitive_value() {
        let mut headers = HeaderMap::new();
        headers.insert(TASK_QUEUE_HEADER, "secret".parse().unwrap());
        assert!(header_eq(&headers, TASK_QUEUE_HEADER, "secret"));
        assert!(!header_eq(&headers, TASK_QUEUE_HEADER, "wrong"));
    }
}
