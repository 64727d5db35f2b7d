//! Protocol error types.

use crate::push::StatusReport;
use gitwire_object::{ObjectError, ObjectId};
use std::io;
use thiserror::Error;

/// Errors that can occur during git protocol operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pkt-line framing.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// The stream ended in the middle of a frame or where more data was required.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A line or section could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request used a feature the server did not advertise.
    #[error("remote does not support {0}")]
    MissingCapability(String),

    /// A request was rejected before anything was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The remote reported a fatal error on the side-band error channel.
    #[error("remote: {0}")]
    Remote(String),

    /// The remote rejected some or all ref updates of a push.
    #[error("remote: {0}")]
    PushRejected(StatusReport),

    /// Negotiation finished without a packfile although one was required.
    #[error("remote did not send a packfile")]
    NoPackfile,

    /// Invalid pack file contents.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// Invalid delta instruction stream.
    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    /// A trailing SHA-1 checksum did not match the data it covers.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Checksum stored in the stream.
        expected: ObjectId,
        /// Checksum computed over the received bytes.
        actual: ObjectId,
    },

    /// A ref-delta names a base object that is not available.
    #[error("delta base not found: {0}")]
    MissingBase(ObjectId),

    /// Object model error, including content hash mismatches.
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// A transport (process or connection) failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A failure wrapped with the command and remote it happened on.
    #[error("{command} {remote}: {source}")]
    Session {
        /// Protocol command being executed (e.g. `ls-refs`, `fetch`).
        command: String,
        /// Identifier of the remote.
        remote: String,
        /// Underlying error.
        #[source]
        source: Box<GitError>,
    },

    /// The operation was cancelled through its context.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl GitError {
    /// Returns true if this error was reported by the remote rather than
    /// detected locally.
    pub fn is_remote(&self) -> bool {
        match self {
            Self::Remote(_) | Self::PushRejected(_) => true,
            Self::Session { source, .. } => source.is_remote(),
            _ => false,
        }
    }

    /// Returns the innermost error, looking through session wrappers.
    pub fn root(&self) -> &GitError {
        match self {
            Self::Session { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<io::Error> for GitError {
    fn from(err: io::Error) -> Self {
        // Readers in this crate tunnel GitError through io::Error.
        if !err.get_ref().is_some_and(|inner| inner.is::<GitError>()) {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return GitError::UnexpectedEof;
            }
            return GitError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<GitError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => GitError::Io(io::Error::other(other)),
            None => GitError::Io(io::Error::other("empty I/O error")),
        }
    }
}

impl From<GitError> for io::Error {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Io(inner) => inner,
            GitError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, GitError::UnexpectedEof),
            other => io::Error::other(other),
        }
    }
}

/// Attaches command and remote context to failures.
pub trait ResultExt<T> {
    /// Wraps an error as [`GitError::Session`].
    fn with_session(self, command: &str, remote: &str) -> crate::Result<T>;
}

impl<T> ResultExt<T> for crate::Result<T> {
    fn with_session(self, command: &str, remote: &str) -> crate::Result<T> {
        self.map_err(|source| match source {
            // Cancellation stays recognisable and is never double wrapped.
            GitError::Cancelled => GitError::Cancelled,
            s @ GitError::Session { .. } => s,
            source => GitError::Session {
                command: command.to_string(),
                remote: remote.to_string(),
                source: Box::new(source),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_error_roundtrips_through_io_error() {
        let io_err: io::Error = GitError::Remote("access denied".to_string()).into();
        let back: GitError = io_err.into();
        assert!(matches!(back, GitError::Remote(ref msg) if msg == "access denied"));
    }

    #[test]
    fn test_unexpected_eof_maps_to_variant() {
        let err: GitError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, GitError::UnexpectedEof));
    }

    #[test]
    fn test_with_session_wraps_once() {
        let result: crate::Result<()> = Err(GitError::Protocol("bad line".to_string()));
        let err = result
            .with_session("fetch", "file:///tmp/repo")
            .with_session("outer", "ignored")
            .unwrap_err();
        assert_eq!(err.to_string(), "fetch file:///tmp/repo: protocol error: bad line");
        assert!(matches!(err.root(), GitError::Protocol(_)));
    }

    #[test]
    fn test_is_remote() {
        assert!(GitError::Remote("x".to_string()).is_remote());
        assert!(!GitError::Protocol("x".to_string()).is_remote());
        let wrapped: crate::Result<()> = Err(GitError::Remote("x".to_string()));
        assert!(wrapped.with_session("fetch", "r").unwrap_err().is_remote());
    }
}
