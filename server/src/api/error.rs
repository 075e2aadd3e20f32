//! Maps internal error types to the hub's HTTP error surface (spec §7):
//! plain-text bodies, not JSON, with 400/409/503 status codes.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::delivery::error::DeliveryError;
use crate::feed::error::FeedError;
use crate::poller::error::PollerError;
use crate::store::error::StoreError;
use crate::subscriptions::error::SubscriptionError;

pub enum ApiError {
    /// 400: the request named a bad parameter.
    BadRequest(String),
    /// 409: a subscriber-side failure on synchronous verification.
    Conflict(String),
    /// 401: missing/invalid work-endpoint credentials.
    Unauthorized,
    /// 503, with `Retry-After: 120`: transient internal failure.
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message).into_response(),
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
            }
            ApiError::ServiceUnavailable(message) => {
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, message).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("120"));
                response
            }
        }
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        match &e {
            SubscriptionError::InvalidUrl { .. }
            | SubscriptionError::InvalidMode(_)
            | SubscriptionError::InvalidLeaseSeconds(_) => ApiError::BadRequest(e.to_string()),
            _ if e.is_subscriber_attributed() => ApiError::Conflict(e.to_string()),
            _ => ApiError::ServiceUnavailable(e.to_string()),
        }
    }
}

impl From<FeedError> for ApiError {
    fn from(e: FeedError) -> Self {
        ApiError::ServiceUnavailable(e.to_string())
    }
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        ApiError::ServiceUnavailable(e.to_string())
    }
}

impl From<PollerError> for ApiError {
    fn from(e: PollerError) -> Self {
        ApiError::ServiceUnavailable(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::ServiceUnavailable(e.to_string())
    }
}
