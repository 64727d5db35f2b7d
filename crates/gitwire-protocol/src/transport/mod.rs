//! Transports carry the byte streams of a session.
//!
//! Every transport offers the same three operations: fetch the initial
//! advertisement, open an upload-pack exchange and open a receive-pack
//! exchange. Exchanges are stateless request/response pairs: the session
//! writes its request, calls [`Connection::end_request`] and reads the
//! response.

mod http;
mod local;

pub use http::HttpTransport;
pub use local::LocalTransport;

use crate::advertisement::ProtocolVersion;
use crate::config::ClientConfig;
use crate::context::Context;
use crate::{GitError, Result};
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// The two smart protocol services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Fetching (`git-upload-pack` on the remote).
    UploadPack,
    /// Pushing (`git-receive-pack` on the remote).
    ReceivePack,
}

impl Service {
    /// Service name as used in URLs and content types.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request/response exchange with a remote service.
pub trait Connection: Read + Write + Send {
    /// Marks the end of the request. Afterwards only reads are valid.
    fn end_request(&mut self) -> Result<()>;

    /// Releases the connection and reports failures of the remote side.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A way of reaching a remote repository.
pub trait Transport: Send + Sync {
    /// Identifier of the remote, used in error messages and logs.
    fn url(&self) -> &str;

    /// Returns the service's initial advertisement, without any transport
    /// specific preamble.
    fn advertise_refs(
        &self,
        ctx: &Context,
        service: Service,
        version: ProtocolVersion,
    ) -> Result<Box<dyn Read + Send>>;

    /// Opens a stateless upload-pack exchange (one command or negotiation round).
    fn upload_pack(&self, ctx: &Context, version: ProtocolVersion) -> Result<Box<dyn Connection>>;

    /// Opens a receive-pack exchange. The response side starts with the
    /// ref advertisement, followed by the status report once the request ends.
    fn receive_pack(&self, ctx: &Context) -> Result<Box<dyn Connection>>;
}

/// Picks a transport for `url`.
///
/// `http://` and `https://` URLs use [`HttpTransport`]; `file://` URLs and
/// plain paths use [`LocalTransport`]. Other schemes are not handled here.
pub fn from_url(url: &str, config: &ClientConfig) -> Result<Arc<dyn Transport>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Arc::new(HttpTransport::new(url, config)?));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Arc::new(LocalTransport::new(PathBuf::from(path), config)));
    }
    if url.contains("://") || looks_like_scp(url) {
        return Err(GitError::Transport(format!("unsupported remote URL {url}")));
    }
    Ok(Arc::new(LocalTransport::new(PathBuf::from(url), config)))
}

/// `user@host:path` style remotes.
fn looks_like_scp(url: &str) -> bool {
    match url.split_once(':') {
        Some((host, _)) => !host.is_empty() && !host.contains('/') && host.len() > 1,
        None => false,
    }
}
