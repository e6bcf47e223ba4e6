use crate::store::StoreError;

/// Errors returned by [`Client`](crate::Client) operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key does not exist and no loader was supplied to populate it.
    #[error("key not found")]
    NotFound,

    /// The per-call deadline elapsed before a value could be returned.
    #[error("deadline exceeded before the key was populated")]
    DeadlineExceeded,

    /// The user-supplied loader failed. The population lock has already
    /// been released (best effort) when this is returned.
    #[error("loader failed: {0}")]
    Loader(#[source] anyhow::Error),

    /// A command against the backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
