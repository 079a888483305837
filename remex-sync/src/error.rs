//! Error types for remex-sync.

use std::path::PathBuf;

use thiserror::Error;

use remex_core::RemexError;

/// All errors that can arise from file synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A blob whose bytes do not hash to the digest it was requested under.
    #[error("digest mismatch for {expected}: got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A delta with none of delete/sha/content set.
    #[error("empty delta for '{0}'")]
    EmptyDelta(String),

    /// Errors from the core layer (link calls, digests).
    #[error(transparent)]
    Core(#[from] RemexError),
}

impl From<SyncError> for RemexError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Core(inner) => inner,
            SyncError::Io { path, source } => RemexError::Io { path, source },
            other => RemexError::Remote(other.to_string()),
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
