use thiserror::Error;

use crate::store::error::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("enqueue failed after {attempts} attempts: {source}")]
    EnqueueExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::EnqueueExhausted { .. } => false,
        }
    }
}
