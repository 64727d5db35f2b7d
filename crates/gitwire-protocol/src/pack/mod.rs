//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format

mod delta;
mod entry;
mod index;
mod reader;
mod writer;

pub use delta::{apply_delta, create_delta, parse_delta, DeltaInstruction, Instructions};
pub use entry::{EntryKind, PackObjectHeader};
pub use index::{IndexEntry, IndexVersion, PackIndex};
pub use reader::{ObjectLookup, PackReader, ResolvedObject};
pub use writer::{PackBuilder, PackWriter};

use gitwire_object::ObjectId;
use sha1::{Digest, Sha1};

/// Magic bytes at the start of a pack file.
pub(crate) const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version written.
pub const PACK_VERSION: u32 = 2;

/// Finishes a SHA-1 into an [`ObjectId`].
pub(crate) fn digest_id(hasher: Sha1) -> ObjectId {
    let mut id = [0u8; ObjectId::LEN];
    id.copy_from_slice(&hasher.finalize());
    ObjectId::from_bytes(id)
}
