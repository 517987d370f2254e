//! Service configuration.
//!
//! Every field has a default, so a configuration file only needs the keys it
//! changes:
//!
//! ```toml
//! port = 8080
//! use_resource = true
//! resource_root = "www"
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum request header size accepted by default (64 KiB).
pub const DEFAULT_MAX_REQUEST_HEADER_SIZE: usize = 64 * 1024;

/// Maximum request body size accepted by default (10 MiB).
pub const DEFAULT_MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Errors produced while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_address: IpAddr,
    /// Port of the built-in listener. `0` disables it.
    pub port: u16,
    /// Worker threads of an owned runtime, and the number of requests
    /// processed concurrently off the I/O tasks.
    pub max_threads: usize,
    pub max_request_header_size: usize,
    pub max_request_body_size: usize,
    /// Run processors on worker threads instead of the connection's I/O task.
    pub process_by_threads: bool,
    /// Serve files through the resource provider when no processor claims a `GET`.
    pub use_resource: bool,
    /// Prepended to the request path (leading `/` removed) before resource lookup.
    pub resource_prefix: String,
    /// Root directory of the default filesystem resource provider.
    pub resource_root: PathBuf,
    /// Emit `info` lines for connection and request events.
    pub log_debug: bool,
    /// Close a connection when a single read waits longer than this.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_threads: default_max_threads(),
            max_request_header_size: DEFAULT_MAX_REQUEST_HEADER_SIZE,
            max_request_body_size: DEFAULT_MAX_REQUEST_BODY_SIZE,
            process_by_threads: true,
            use_resource: false,
            resource_prefix: String::new(),
            resource_root: PathBuf::from("."),
            log_debug: false,
            idle_timeout_secs: None,
        }
    }
}

fn default_max_threads() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Address of the built-in listener, `None` when it is disabled.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        (self.port != 0).then(|| SocketAddr::new(self.bind_address, self.port))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Effective worker cap; never below one.
    pub fn worker_count(&self) -> usize {
        self.max_threads.max(1)
    }

    #[must_use]
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_max_threads(mut self, count: usize) -> Self {
        self.max_threads = count;
        self
    }

    #[must_use]
    pub fn with_max_request_header_size(mut self, size: usize) -> Self {
        self.max_request_header_size = size;
        self
    }

    #[must_use]
    pub fn with_max_request_body_size(mut self, size: usize) -> Self {
        self.max_request_body_size = size;
        self
    }

    #[must_use]
    pub fn with_process_by_threads(mut self, enabled: bool) -> Self {
        self.process_by_threads = enabled;
        self
    }

    /// Enables static resource serving from `root`, looked up under `prefix`.
    #[must_use]
    pub fn with_resources(mut self, root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.use_resource = true;
        self.resource_root = root.into();
        self.resource_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_log_debug(mut self, enabled: bool) -> Self {
        self.log_debug = enabled;
        self
    }

    #[must_use]
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }
}
