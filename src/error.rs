use crate::client::ClientError;
use crate::worker_pool::QueueFull;

/// Error kinds surfaced by the crawl pipeline and the store.
///
/// Transient and permanent remote failures are recovered locally (logged,
/// cached, or turned into deletions); storage errors roll the transaction
/// back and are retried by the next periodic pass.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("transient remote failure: {0}")]
    TransientRemote(ClientError),
    #[error("remote entity is gone: {0}")]
    PermanentRemote(ClientError),
    #[error("banned by remote: {0}")]
    Banned(ClientError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl From<ClientError> for CrawlError {
    fn from(e: ClientError) -> Self {
        if e.is_permanent_absence() {
            CrawlError::PermanentRemote(e)
        } else if e.is_auth() {
            CrawlError::Banned(e)
        } else {
            CrawlError::TransientRemote(e)
        }
    }
}
