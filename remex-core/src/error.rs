//! Error types for remex-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::AreaId;

/// All errors that can cross the Sink/Source boundary.
#[derive(Debug, Error)]
pub enum RemexError {
    /// Underlying I/O failure, annotated with the path (or socket) involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode failure on the link.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The Sink has no Area with this id.
    #[error("unknown area '{0}'")]
    UnknownArea(AreaId),

    /// The Area is in the wrong run state for the requested operation.
    #[error("area '{area}': {reason}")]
    IllegalState { area: AreaId, reason: String },

    /// A path that is absolute or escapes its root.
    #[error("invalid path '{0}': must be relative and stay inside the area")]
    InvalidPath(String),

    /// A caller supplied an argument that can never succeed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The link to the peer is closed; pending and future calls fail with this.
    #[error("link closed")]
    LinkClosed,

    /// The peer answered with an error or an unexpected frame.
    #[error("remote error: {0}")]
    Remote(String),
}

impl RemexError {
    pub fn illegal_state(area: &AreaId, reason: impl Into<String>) -> Self {
        RemexError::IllegalState {
            area: area.clone(),
            reason: reason.into(),
        }
    }
}

/// Convenience constructor for [`RemexError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RemexError {
    RemexError::Io {
        path: path.into(),
        source,
    }
}
