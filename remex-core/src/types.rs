//! Wire types shared by Sink and Source.
//!
//! Everything here crosses the link as JSON. Byte payloads are carried as
//! base64 strings via [`b64`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest link protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed Area identifier. Also the Area's directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AreaId(pub String);

impl AreaId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AreaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AreaId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// One file-level mutation sent from a Source to a Sink.
///
/// Exactly one of `delete`, `sha` or `content` is meaningful; the constructors
/// are the only way this crate builds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Path relative to the Area cwd, in the Sink's separator convention.
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub content: Option<Vec<u8>>,
}

/// What a [`Delta`] asks the Sink to do, with the meaningless fields dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp<'a> {
    Delete,
    Sha(&'a str),
    Content(&'a [u8]),
}

impl Delta {
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            delete: true,
            sha: None,
            content: None,
        }
    }

    pub fn sha(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            delete: false,
            sha: Some(sha.into()),
            content: None,
        }
    }

    pub fn content(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            delete: false,
            sha: None,
            content: Some(content),
        }
    }

    /// Classify this delta. `delete` wins over `sha`, which wins over `content`.
    pub fn op(&self) -> Option<DeltaOp<'_>> {
        if self.delete {
            Some(DeltaOp::Delete)
        } else if let Some(sha) = self.sha.as_deref() {
            Some(DeltaOp::Sha(sha))
        } else {
            self.content.as_deref().map(DeltaOp::Content)
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Handshake payload returned by the Sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Negotiated version: `min(PROTOCOL_VERSION, requested)`.
    pub version: u32,
    /// The Sink's native path separator.
    pub separator: char,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Deleted,
    Exited,
    Launching,
    Restarted,
    Running,
    Started,
    Virginal,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Created => "created",
            EventKind::Deleted => "deleted",
            EventKind::Exited => "exited",
            EventKind::Launching => "launching",
            EventKind::Restarted => "restarted",
            EventKind::Running => "running",
            EventKind::Started => "started",
            EventKind::Virginal => "virginal",
        };
        f.write_str(s)
    }
}

/// A lifecycle event for one Area, broadcast by the Sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaEvent {
    pub area: AreaId,
    pub kind: EventKind,
}

impl AreaEvent {
    pub fn new(area: &AreaId, kind: EventKind) -> Self {
        Self {
            area: area.clone(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Area snapshot
// ---------------------------------------------------------------------------

/// Run state of an Area as seen over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AreaState {
    #[default]
    Virginal,
    Launching,
    Running,
    Exited,
}

impl fmt::Display for AreaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaState::Virginal => write!(f, "virginal"),
            AreaState::Launching => write!(f, "launching"),
            AreaState::Running => write!(f, "running"),
            AreaState::Exited => write!(f, "exited"),
        }
    }
}

/// Point-in-time snapshot of an Area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaInfo {
    pub id: AreaId,
    pub cwd: PathBuf,
    pub state: AreaState,
    pub running: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Base64 byte fields
// ---------------------------------------------------------------------------

/// `#[serde(with = "b64")]` for `Option<Vec<u8>>` fields.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_op_prefers_delete_then_sha() {
        let mut delta = Delta::sha("a.txt", "abc");
        delta.delete = true;
        assert_eq!(delta.op(), Some(DeltaOp::Delete));

        let delta = Delta {
            path: "a.txt".into(),
            delete: false,
            sha: Some("abc".into()),
            content: Some(b"x".to_vec()),
        };
        assert_eq!(delta.op(), Some(DeltaOp::Sha("abc")));

        let empty = Delta {
            path: "a.txt".into(),
            delete: false,
            sha: None,
            content: None,
        };
        assert_eq!(empty.op(), None);
    }

    #[test]
    fn content_delta_is_base64_on_the_wire() {
        let delta = Delta::content("bnd.bnd", b"-runpath: x\n".to_vec());
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["content"], "LXJ1bnBhdGg6IHgK");
        assert!(json.get("sha").is_none());
        assert!(json.get("delete").is_none());

        let back: Delta = serde_json::from_value(json).unwrap();
        assert_eq!(back, delta);
    }

    #[test]
    fn event_kind_serializes_lowercase() {
        let event = AreaEvent::new(&AreaId::from("1000"), EventKind::Exited);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"area":"1000","kind":"exited"}"#);
    }
}
