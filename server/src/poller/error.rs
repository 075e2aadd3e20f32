use thiserror::Error;

use crate::queue::error::QueueError;
use crate::store::error::StoreError;

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}
