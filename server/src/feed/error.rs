use thiserror::Error;

use crate::queue::error::QueueError;
use crate::store::error::StoreError;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("fetch request failed: {0}")]
    FetchUnreachable(String),

    #[error("fetch returned unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("too many redirects (> {0})")]
    TooManyRedirects(u8),

    #[error("could not parse feed as atom or rss: {0}")]
    ParseFailed(String),

    #[error("commit too large after {attempts} splitting attempts")]
    CommitTooLarge { attempts: u32 },
}
