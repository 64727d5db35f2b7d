//! Object model error types.

use thiserror::Error;

/// Errors produced while parsing or verifying objects.
#[derive(Debug, Error)]
pub enum ObjectError {
    /// An object id could not be parsed.
    #[error("invalid object id: {0}")]
    InvalidId(String),

    /// An object type name or pack type code was not recognised.
    #[error("unknown object type: {0}")]
    UnknownType(String),

    /// The content hash of an object did not match its expected id.
    #[error("hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch {
        /// The id the object was expected to have.
        expected: crate::ObjectId,
        /// The id computed from the object's content.
        actual: crate::ObjectId,
    },
}
