//! The Sink and Source interfaces, their wire catalogues, and the proxies
//! that carry them over a [`Link`](crate::link::Link).
//!
//! A `*Proxy` implements the trait by encoding a request enum and calling the
//! peer; a `*Dispatch` implements [`LinkHandler`] by decoding the request enum
//! and calling a local implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemexError;
use crate::link::{LinkHandler, RemoteHandle};
use crate::types::{b64, AreaEvent, AreaId, AreaInfo, Delta, Welcome};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Server-role peer: owns Areas and runs commands in them.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn get_welcome(&self, highest: u32) -> Result<Welcome, RemexError>;
    /// The Area's snapshot, materializing an empty Area for an unknown id.
    async fn get_area(&self, id: &AreaId) -> Result<AreaInfo, RemexError>;
    /// Create (or return) an Area. `None` allocates the next free id.
    async fn create_area(&self, id: Option<AreaId>) -> Result<AreaInfo, RemexError>;
    async fn get_areas(&self) -> Result<Vec<AreaInfo>, RemexError>;
    async fn remove_area(&self, id: &AreaId) -> Result<bool, RemexError>;
    async fn launch(
        &self,
        area: &AreaId,
        env: BTreeMap<String, String>,
        args: Vec<String>,
    ) -> Result<(), RemexError>;
    async fn cancel(&self, area: &AreaId) -> Result<(), RemexError>;
    async fn input(&self, area: &AreaId, text: String) -> Result<(), RemexError>;
    /// Cancel, wait (bounded) for the worker, return the last exit code.
    async fn exit(&self, area: &AreaId) -> Result<i32, RemexError>;
    async fn view(&self, area: &AreaId, path: &str) -> Result<Option<Vec<u8>>, RemexError>;
    async fn sync(&self, area: &AreaId, deltas: Vec<Delta>) -> Result<(), RemexError>;
    async fn clear_cache(&self) -> Result<(), RemexError>;
}

/// Client-role peer: owns the authoritative files and receives output.
#[async_trait]
pub trait Source: Send + Sync {
    /// Bytes for `sha` if this Source still holds a file with that digest.
    async fn get_data(&self, sha: &str) -> Result<Option<Vec<u8>>, RemexError>;
    async fn event(&self, event: AreaEvent) -> Result<(), RemexError>;
    async fn output(&self, area: &AreaId, text: String, is_err: bool) -> Result<(), RemexError>;
}

// ---------------------------------------------------------------------------
// Wire catalogues
// ---------------------------------------------------------------------------

/// Every call a Source can make on a Sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum SinkRequest {
    GetWelcome {
        highest: u32,
    },
    GetArea {
        id: AreaId,
    },
    CreateArea {
        #[serde(default)]
        id: Option<AreaId>,
    },
    GetAreas,
    RemoveArea {
        id: AreaId,
    },
    Launch {
        area: AreaId,
        #[serde(default)]
        env: BTreeMap<String, String>,
        args: Vec<String>,
    },
    Cancel {
        area: AreaId,
    },
    Input {
        area: AreaId,
        text: String,
    },
    Exit {
        area: AreaId,
    },
    View {
        area: AreaId,
        path: String,
    },
    Sync {
        area: AreaId,
        deltas: Vec<Delta>,
    },
    ClearCache,
}

/// Every call a Sink can make on a Source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum SourceRequest {
    GetData { sha: String },
    Event { event: AreaEvent },
    Output { area: AreaId, text: String, is_err: bool },
}

/// Optional byte payload, base64 on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(#[serde(with = "b64")] pub Option<Vec<u8>>);

fn encode<T: Serialize>(value: &T) -> Result<Value, RemexError> {
    Ok(serde_json::to_value(value)?)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RemexError> {
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Proxies
// ---------------------------------------------------------------------------

/// A remote Sink reached over a link.
#[derive(Debug, Clone)]
pub struct SinkProxy {
    remote: RemoteHandle,
}

impl SinkProxy {
    pub fn new(remote: RemoteHandle) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &RemoteHandle {
        &self.remote
    }

    async fn call<T: DeserializeOwned>(&self, request: SinkRequest) -> Result<T, RemexError> {
        decode(self.remote.call(encode(&request)?).await?)
    }
}

#[async_trait]
impl Sink for SinkProxy {
    async fn get_welcome(&self, highest: u32) -> Result<Welcome, RemexError> {
        self.call(SinkRequest::GetWelcome { highest }).await
    }

    async fn get_area(&self, id: &AreaId) -> Result<AreaInfo, RemexError> {
        self.call(SinkRequest::GetArea { id: id.clone() }).await
    }

    async fn create_area(&self, id: Option<AreaId>) -> Result<AreaInfo, RemexError> {
        self.call(SinkRequest::CreateArea { id }).await
    }

    async fn get_areas(&self) -> Result<Vec<AreaInfo>, RemexError> {
        self.call(SinkRequest::GetAreas).await
    }

    async fn remove_area(&self, id: &AreaId) -> Result<bool, RemexError> {
        self.call(SinkRequest::RemoveArea { id: id.clone() }).await
    }

    async fn launch(
        &self,
        area: &AreaId,
        env: BTreeMap<String, String>,
        args: Vec<String>,
    ) -> Result<(), RemexError> {
        self.call(SinkRequest::Launch {
            area: area.clone(),
            env,
            args,
        })
        .await
    }

    async fn cancel(&self, area: &AreaId) -> Result<(), RemexError> {
        self.call(SinkRequest::Cancel { area: area.clone() }).await
    }

    async fn input(&self, area: &AreaId, text: String) -> Result<(), RemexError> {
        self.call(SinkRequest::Input {
            area: area.clone(),
            text,
        })
        .await
    }

    async fn exit(&self, area: &AreaId) -> Result<i32, RemexError> {
        self.call(SinkRequest::Exit { area: area.clone() }).await
    }

    async fn view(&self, area: &AreaId, path: &str) -> Result<Option<Vec<u8>>, RemexError> {
        let payload: Payload = self
            .call(SinkRequest::View {
                area: area.clone(),
                path: path.to_string(),
            })
            .await?;
        Ok(payload.0)
    }

    async fn sync(&self, area: &AreaId, deltas: Vec<Delta>) -> Result<(), RemexError> {
        self.call(SinkRequest::Sync {
            area: area.clone(),
            deltas,
        })
        .await
    }

    async fn clear_cache(&self) -> Result<(), RemexError> {
        self.call(SinkRequest::ClearCache).await
    }
}

/// A remote Source reached over a link. `event` and `output` are one-way.
#[derive(Debug, Clone)]
pub struct SourceProxy {
    remote: RemoteHandle,
}

impl SourceProxy {
    pub fn new(remote: RemoteHandle) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &RemoteHandle {
        &self.remote
    }
}

#[async_trait]
impl Source for SourceProxy {
    async fn get_data(&self, sha: &str) -> Result<Option<Vec<u8>>, RemexError> {
        let request = SourceRequest::GetData {
            sha: sha.to_string(),
        };
        let payload: Payload = decode(self.remote.call(encode(&request)?).await?)?;
        Ok(payload.0)
    }

    async fn event(&self, event: AreaEvent) -> Result<(), RemexError> {
        self.remote
            .notify(encode(&SourceRequest::Event { event })?)
            .await
    }

    async fn output(&self, area: &AreaId, text: String, is_err: bool) -> Result<(), RemexError> {
        self.remote
            .notify(encode(&SourceRequest::Output {
                area: area.clone(),
                text,
                is_err,
            })?)
            .await
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Decode a [`SinkRequest`] and run it against `sink`.
pub async fn dispatch_sink(sink: &dyn Sink, body: Value) -> Result<Value, RemexError> {
    let request: SinkRequest = decode(body)?;
    match request {
        SinkRequest::GetWelcome { highest } => encode(&sink.get_welcome(highest).await?),
        SinkRequest::GetArea { id } => encode(&sink.get_area(&id).await?),
        SinkRequest::CreateArea { id } => encode(&sink.create_area(id).await?),
        SinkRequest::GetAreas => encode(&sink.get_areas().await?),
        SinkRequest::RemoveArea { id } => encode(&sink.remove_area(&id).await?),
        SinkRequest::Launch { area, env, args } => encode(&sink.launch(&area, env, args).await?),
        SinkRequest::Cancel { area } => encode(&sink.cancel(&area).await?),
        SinkRequest::Input { area, text } => encode(&sink.input(&area, text).await?),
        SinkRequest::Exit { area } => encode(&sink.exit(&area).await?),
        SinkRequest::View { area, path } => encode(&Payload(sink.view(&area, &path).await?)),
        SinkRequest::Sync { area, deltas } => encode(&sink.sync(&area, deltas).await?),
        SinkRequest::ClearCache => encode(&sink.clear_cache().await?),
    }
}

/// Decode a [`SourceRequest`] and run it against `source`.
pub async fn dispatch_source(source: &dyn Source, body: Value) -> Result<Value, RemexError> {
    let request: SourceRequest = decode(body)?;
    match request {
        SourceRequest::GetData { sha } => encode(&Payload(source.get_data(&sha).await?)),
        SourceRequest::Event { event } => encode(&source.event(event).await?),
        SourceRequest::Output { area, text, is_err } => {
            encode(&source.output(&area, text, is_err).await?)
        }
    }
}

/// Serves a local [`Source`] on a link.
pub struct SourceDispatch<S> {
    source: Arc<S>,
}

impl<S: Source> SourceDispatch<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: Source + 'static> LinkHandler for SourceDispatch<S> {
    async fn handle(&self, body: Value) -> Result<Value, RemexError> {
        dispatch_source(self.source.as_ref(), body).await
    }
}
