//! # remex-sync
//!
//! Both halves of delta synchronization.
//!
//! - [`SourceFs`] tracks the local files a Source references and turns their
//!   changes into [`Delta`](remex_core::Delta) batches.
//! - [`SinkFs`] applies those batches under an Area, fetching blobs it does
//!   not hold from the connected Sources.
//! - [`translate`] maps local paths (any OS shape) to Area-relative ones.

pub mod error;
pub mod sink_fs;
pub mod source_fs;
pub mod translate;

pub use error::SyncError;
pub use sink_fs::{DeltaOutcome, SinkFs};
pub use source_fs::{Entry, FileDescription, SourceFs};
