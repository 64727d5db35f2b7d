//! Client side of git's smart transfer protocol.
//!
//! This crate speaks protocol v1 and v2 to `git-upload-pack` and
//! `git-receive-pack`, over a local subprocess or smart HTTP, and implements
//! the pack and pack index formats the protocol carries.
//!
//! A typical fetch:
//!
//! ```no_run
//! use gitwire_protocol::{ClientConfig, Context, FetchRequest, PackReader, Remote};
//!
//! # fn main() -> gitwire_protocol::Result<()> {
//! let ctx = Context::new();
//! let remote = Remote::new("https://example.com/repo.git", ClientConfig::default())?;
//! let mut session = remote.start_fetch(&ctx)?;
//! let refs = session.list_refs(&ctx, &["refs/heads/"])?;
//! let request = FetchRequest::new(refs.iter().map(|r| r.id));
//! let response = session.negotiate(&ctx, request)?;
//! if let Some(packfile) = response.packfile {
//!     let (objects, _checksum) = PackReader::new(packfile)?.read_all()?;
//!     println!("received {} objects", objects.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod advertisement;
pub mod capabilities;
pub mod config;
pub mod context;
mod error;
pub mod fetch;
pub mod pack;
pub mod pktline;
pub mod push;
mod remote;
pub mod sideband;
pub mod transport;

pub use advertisement::{Advertisement, ProtocolVersion, Ref};
pub use capabilities::{Capabilities, Features};
pub use config::{ClientConfig, HttpConfig};
pub use context::Context;
pub use error::{GitError, ResultExt};
pub use fetch::{Ack, AckStatus, FetchRequest, FetchResponse, FetchSession, Packfile, ShallowUpdate};
pub use pack::{ObjectLookup, PackBuilder, PackIndex, PackReader, PackWriter, ResolvedObject};
pub use pktline::{PktLine, PktLineReader, PktLineWriter};
pub use push::{PushCommand, PushSession, RefStatus, StatusReport};
pub use remote::Remote;
pub use transport::{Connection, Service, Transport};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
