//! Pack entry headers.
//!
//! Each entry starts with a variable-length header: the first byte holds a
//! continuation bit, a 3-bit type code and the low 4 bits of the size; every
//! following byte adds 7 more size bits. Delta entries then name their base,
//! either as a backward offset or as a 20-byte object id.

use crate::{GitError, Result};
use gitwire_object::{ObjectId, ObjectType};
use std::io::Read;

/// Type code of an offset delta entry.
const OFS_DELTA: u8 = 6;
/// Type code of a ref delta entry.
const REF_DELTA: u8 = 7;

/// What a pack entry contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A complete object.
    Base(ObjectType),
    /// A delta against the entry `offset` bytes before this one.
    OffsetDelta {
        /// Distance back from the start of this entry to the base entry.
        offset: u64,
    },
    /// A delta against the object with id `base`.
    RefDelta {
        /// Id of the base object.
        base: ObjectId,
    },
}

impl EntryKind {
    /// Returns the 3-bit type code written in the header.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Base(t) => t.pack_type(),
            Self::OffsetDelta { .. } => OFS_DELTA,
            Self::RefDelta { .. } => REF_DELTA,
        }
    }

    /// Returns true for both delta kinds.
    pub fn is_delta(&self) -> bool {
        !matches!(self, Self::Base(_))
    }
}

/// Header of a single pack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackObjectHeader {
    /// Entry kind, including the delta base reference.
    pub kind: EntryKind,
    /// Inflated size of the payload (object data or delta instructions).
    pub size: u64,
}

impl PackObjectHeader {
    /// Creates a header.
    pub fn new(kind: EntryKind, size: u64) -> Self {
        Self { kind, size }
    }

    /// Appends the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut size = self.size;
        let mut byte = (self.kind.type_code() << 4) | (size & 0x0F) as u8;
        size >>= 4;
        while size > 0 {
            out.push(byte | 0x80);
            byte = (size & 0x7F) as u8;
            size >>= 7;
        }
        out.push(byte);

        match self.kind {
            EntryKind::Base(_) => {}
            EntryKind::OffsetDelta { offset } => encode_offset(offset, out),
            EntryKind::RefDelta { base } => out.extend_from_slice(base.as_bytes()),
        }
    }

    /// Returns the encoded header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        self.encode(&mut out);
        out
    }

    /// Reads a header from `reader`, returning it with its encoded length.
    pub fn read<R: Read>(reader: &mut R) -> Result<(Self, usize)> {
        let mut consumed = 0;
        let mut next = || -> Result<u8> {
            let mut byte = [0u8; 1];
            reader
                .read_exact(&mut byte)
                .map_err(|e| match GitError::from(e) {
                    GitError::UnexpectedEof => {
                        GitError::InvalidPack("truncated entry header".to_string())
                    }
                    other => other,
                })?;
            consumed += 1;
            Ok(byte[0])
        };

        let first = next()?;
        let code = (first >> 4) & 0x07;
        let mut size = u64::from(first & 0x0F);
        let mut shift = 4u32;
        let mut byte = first;
        while byte & 0x80 != 0 {
            byte = next()?;
            if shift >= 64 || (shift > 57 && u64::from(byte & 0x7F) >> (64 - shift) != 0) {
                return Err(GitError::InvalidPack("entry size overflows 64 bits".to_string()));
            }
            size |= u64::from(byte & 0x7F) << shift;
            shift += 7;
        }

        let kind = match code {
            OFS_DELTA => {
                let mut byte = next()?;
                let mut offset = u64::from(byte & 0x7F);
                while byte & 0x80 != 0 {
                    if offset > (u64::MAX >> 7) - 1 {
                        return Err(GitError::InvalidPack("delta offset overflows 64 bits".to_string()));
                    }
                    byte = next()?;
                    offset = ((offset + 1) << 7) | u64::from(byte & 0x7F);
                }
                if offset == 0 {
                    return Err(GitError::InvalidPack("delta base offset is zero".to_string()));
                }
                EntryKind::OffsetDelta { offset }
            }
            REF_DELTA => {
                let mut id = [0u8; ObjectId::LEN];
                for slot in id.iter_mut() {
                    *slot = next()?;
                }
                EntryKind::RefDelta {
                    base: ObjectId::from_bytes(id),
                }
            }
            code => EntryKind::Base(
                ObjectType::from_pack_type(code)
                    .map_err(|_| GitError::InvalidPack(format!("invalid object type {code}")))?,
            ),
        };
        Ok((Self { kind, size }, consumed))
    }

    /// Decodes a header at the start of `data`, returning it with its length.
    pub fn decode(mut data: &[u8]) -> Result<(Self, usize)> {
        Self::read(&mut data)
    }
}

/// Writes a delta base offset. Each continuation adds one before shifting, so
/// no value has two encodings.
fn encode_offset(mut offset: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; 10];
    let mut pos = buf.len() - 1;
    buf[pos] = (offset & 0x7F) as u8;
    offset >>= 7;
    while offset > 0 {
        offset -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (offset & 0x7F) as u8;
        offset >>= 7;
    }
    out.extend_from_slice(&buf[pos..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: PackObjectHeader) {
        let bytes = header.to_bytes();
        let (decoded, consumed) = PackObjectHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_small_blob_is_one_byte() {
        let header = PackObjectHeader::new(EntryKind::Base(ObjectType::Blob), 15);
        assert_eq!(header.to_bytes(), vec![0x3F]);
    }

    #[test]
    fn test_size_boundaries() {
        for size in [0, 15, 16, 127, 2047, 2048, 1 << 20, u64::from(u32::MAX), u64::MAX] {
            for t in [ObjectType::Commit, ObjectType::Tree, ObjectType::Blob, ObjectType::Tag] {
                roundtrip(PackObjectHeader::new(EntryKind::Base(t), size));
            }
        }
    }

    #[test]
    fn test_size_continuation_bytes() {
        // 16 needs a second byte: low nibble 0, then 1.
        let header = PackObjectHeader::new(EntryKind::Base(ObjectType::Commit), 16);
        assert_eq!(header.to_bytes(), vec![0x90, 0x01]);
    }

    #[test]
    fn test_offset_encoding_matches_git() {
        let mut out = Vec::new();
        encode_offset(127, &mut out);
        assert_eq!(out, vec![0x7F]);
        out.clear();
        encode_offset(128, &mut out);
        assert_eq!(out, vec![0x80, 0x00]);
        out.clear();
        encode_offset(16511, &mut out);
        assert_eq!(out, vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_delta_headers() {
        for offset in [1, 127, 128, 16511, 16512, 1 << 40] {
            roundtrip(PackObjectHeader::new(EntryKind::OffsetDelta { offset }, 42));
        }
        let base = ObjectId::from_hex("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        roundtrip(PackObjectHeader::new(EntryKind::RefDelta { base }, 3000));
    }

    #[test]
    fn test_invalid_type_codes() {
        assert!(PackObjectHeader::decode(&[0x00]).is_err());
        assert!(PackObjectHeader::decode(&[0x50]).is_err());
    }

    #[test]
    fn test_truncated_header() {
        assert!(PackObjectHeader::decode(&[]).is_err());
        assert!(PackObjectHeader::decode(&[0x90]).is_err());
        assert!(PackObjectHeader::decode(&[0x70, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let bytes = [0xFF; 16];
        assert!(PackObjectHeader::decode(&bytes).is_err());
    }
}
