//! Client configuration.

use crate::advertisement::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default agent string sent in `agent=` capabilities.
pub const DEFAULT_AGENT: &str = concat!("gitwire/", env!("CARGO_PKG_VERSION"));

/// Configuration shared by remotes, transports and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Value of the `agent` capability.
    pub agent: String,
    /// Protocol version requested from the server.
    pub protocol_version: ProtocolVersion,
    /// Program run by the local transport for fetches.
    pub upload_pack: String,
    /// Program run by the local transport for pushes.
    pub receive_pack: String,
    /// HTTP transport settings.
    pub http: HttpConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.to_string(),
            protocol_version: ProtocolVersion::V2,
            upload_pack: "git-upload-pack".to_string(),
            receive_pack: "git-receive-pack".to_string(),
            http: HttpConfig::default(),
        }
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// `User-Agent` header.
    pub user_agent: String,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Overall request timeout in seconds; `None` leaves large transfers unbounded.
    pub timeout_secs: Option<u64>,
    /// Extra headers sent with every request (e.g. `Authorization`).
    pub extra_headers: BTreeMap<String, String>,
    /// Requests up to this size are sent in one piece; larger ones are streamed chunked.
    pub post_buffer: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("git/2.0 ({DEFAULT_AGENT})"),
            connect_timeout_secs: 30,
            timeout_secs: None,
            extra_headers: BTreeMap::new(),
            post_buffer: 1024 * 1024,
        }
    }
}

impl HttpConfig {
    /// Connection timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a [`Duration`], if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
