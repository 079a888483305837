//! Daemon configuration and on-disk layout.
//!
//! ```text
//! <root>/
//!   areas/<id>/cwd/...     one tree per Area
//!   shacache/<sha1-hex>    content-addressed blobs
//! ```

use std::path::{Path, PathBuf};

use remex_core::AreaId;

pub const DEFAULT_PORT: u16 = 29281;
/// Bind every interface.
pub const ANY_HOST: &str = "*";
pub const DEFAULT_CONNECT_HOST: &str = "localhost";

pub const AREAS_DIR: &str = "areas";
pub const AREA_CWD_DIR: &str = "cwd";
pub const SHACACHE_DIR: &str = "shacache";

/// `~/.remex` for the given home directory.
pub fn default_root(home: &Path) -> PathBuf {
    home.join(".remex")
}

pub fn areas_root(root: &Path) -> PathBuf {
    root.join(AREAS_DIR)
}

pub fn area_dir(root: &Path, id: &AreaId) -> PathBuf {
    areas_root(root).join(id.as_str())
}

pub fn area_cwd(root: &Path, id: &AreaId) -> PathBuf {
    area_dir(root, id).join(AREA_CWD_DIR)
}

pub fn shacache_dir(root: &Path) -> PathBuf {
    root.join(SHACACHE_DIR)
}

/// Where a Sink keeps its state and where it listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub root: PathBuf,
    pub host: String,
    pub port: u16,
}

impl SinkConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            host: ANY_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port` suitable for binding; `*` becomes the unspecified address.
    pub fn bind_addr(&self) -> String {
        bind_addr(&self.host, self.port)
    }
}

/// Where a Source finds its Sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_CONNECT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn connect_addr(&self) -> String {
        let host = if self.host == ANY_HOST {
            DEFAULT_CONNECT_HOST
        } else {
            self.host.as_str()
        };
        format!("{host}:{}", self.port)
    }
}

pub(crate) fn bind_addr(host: &str, port: u16) -> String {
    let host = if host == ANY_HOST { "0.0.0.0" } else { host };
    format!("{host}:{port}")
}
