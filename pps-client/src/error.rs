use thiserror::Error;

/// Errors surfaced by the external-collaborator adapters.
///
/// Transient variants get retried under infinite backoff by whichever
/// task surfaced them; `WatchCreation` is the one variant that unwinds
/// the whole master loop.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create watch: {0}")]
    WatchCreation(String),

    #[error("transient store error: {0}")]
    TransientStore(#[source] etcd_client::Error),

    #[error("transient orchestrator error: {0}")]
    TransientOrchestrator(#[source] kube::Error),

    #[error("transient data store error: {0}")]
    TransientDataStore(String),

    #[error("record not found")]
    NotFound,

    #[error("pipeline record failed to decode")]
    Decode(#[from] serde_json::Error),

    #[error("lock session lost")]
    LockLost,
}

impl Error {
    /// Whether the caller should treat this as a not-found (already the
    /// desired end state) rather than a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound => true,
            Error::TransientOrchestrator(e) => matches!(e, kube::Error::Api(resp) if resp.code == 404),
            _ => false,
        }
    }
}
