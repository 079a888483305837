use std::path::PathBuf;

use thiserror::Error;

use remex_core::RemexError;
use remex_sync::SyncError;

/// Error surface for the Sink service, client sessions and the dispatcher.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] RemexError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<DaemonError> for RemexError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Core(inner) => inner,
            DaemonError::Sync(inner) => inner.into(),
            DaemonError::Io { path, source } => RemexError::Io { path, source },
            other => RemexError::Remote(other.to_string()),
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
