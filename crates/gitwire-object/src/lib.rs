//! Git object model for gitwire.
//!
//! The wire layers only need three things from the object model: a 20-byte
//! SHA-1 identifier, the four object types and the `"<type> <size>\0"` header
//! that prefixes an object's payload when it is hashed. This crate provides
//! exactly that, plus [`GitObject`] as a convenient owned object value.

mod error;
mod id;
mod object;

pub use error::ObjectError;
pub use id::ObjectId;
pub use object::{object_header, GitObject, ObjectType};

/// Result type for object model operations.
pub type Result<T> = std::result::Result<T, ObjectError>;
