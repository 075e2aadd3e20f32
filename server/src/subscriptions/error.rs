use thiserror::Error;

use crate::queue::error::QueueError;
use crate::store::error::StoreError;
use crate::utils::url::UrlValidationError;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("invalid {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: UrlValidationError,
    },

    #[error("invalid hub.mode '{0}'")]
    InvalidMode(String),

    #[error("invalid hub.lease_seconds '{0}'")]
    InvalidLeaseSeconds(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("subscriber challenge did not match")]
    ChallengeMismatch,

    #[error("subscriber verifier returned status {0}")]
    VerifierRejected(u16),

    #[error("verification request failed: {0}")]
    VerifierUnreachable(String),
}

impl SubscriptionError {
    /// Whether this failure should be surfaced as a synchronous 409
    /// (subscriber-attributed) rather than a 503 (internal/transient).
    pub fn is_subscriber_attributed(&self) -> bool {
        matches!(
            self,
            Self::ChallengeMismatch | Self::VerifierRejected(_) | Self::VerifierUnreachable(_)
        )
    }
}
