//! remex core: wire types, peer interfaces, and the link that carries them.
//!
//! - [`types`]: Delta, Welcome, events, Area snapshots
//! - [`api`]: [`Sink`] / [`Source`] traits, request catalogues, proxies
//! - [`link`]: newline-delimited JSON call/return over TCP
//! - [`digest`]: SHA-1 helpers
//! - [`paths`]: Area-relative path resolution

pub mod api;
pub mod digest;
pub mod error;
pub mod link;
pub mod paths;
pub mod types;

pub use api::{Sink, SinkProxy, SinkRequest, Source, SourceDispatch, SourceProxy, SourceRequest};
pub use error::RemexError;
pub use link::{Link, LinkHandler, RemoteHandle};
pub use types::{
    AreaEvent, AreaId, AreaInfo, AreaState, Delta, DeltaOp, EventKind, Welcome, PROTOCOL_VERSION,
};
