//! Pack index (`.idx`) files, formats 1 and 2.
//!
//! Format 1 is a 256-entry fan-out table followed by `(offset, id)` pairs.
//! Format 2 starts with a magic number and version, and stores ids, CRC32s
//! and offsets in separate tables; offsets that do not fit in 31 bits live in
//! an extra table of 64-bit values. Both end with the pack checksum and a
//! checksum of the index itself.

use super::digest_id;
use super::reader::ResolvedObject;
use crate::{GitError, Result};
use gitwire_object::ObjectId;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

const V2_MAGIC: [u8; 4] = [0xFF, b't', b'O', b'c'];
const LARGE_OFFSET: u32 = 0x8000_0000;

/// Index file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexVersion {
    /// The original format, without CRC32s and limited to 32-bit offsets.
    V1,
    /// The current format.
    #[default]
    V2,
}

/// One indexed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Object id.
    pub id: ObjectId,
    /// Offset of the entry in the pack.
    pub offset: u64,
    /// CRC32 of the packed entry; format 1 does not record it.
    pub crc32: Option<u32>,
}

impl From<&ResolvedObject> for IndexEntry {
    fn from(object: &ResolvedObject) -> Self {
        Self {
            id: object.object.id,
            offset: object.offset,
            crc32: Some(object.crc32),
        }
    }
}

/// An in-memory pack index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackIndex {
    version: IndexVersion,
    entries: Vec<IndexEntry>,
    fanout: [u32; 256],
    pack_checksum: ObjectId,
}

impl PackIndex {
    /// Builds an index from entries in any order.
    pub fn new(mut entries: Vec<IndexEntry>, pack_checksum: ObjectId) -> Result<Self> {
        entries.sort_by_key(|e| e.id);
        if let Some(pair) = entries.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(GitError::InvalidPack(format!("duplicate object {}", pair[0].id)));
        }
        Ok(Self {
            version: IndexVersion::V2,
            fanout: fanout(&entries),
            entries,
            pack_checksum,
        })
    }

    /// Builds an index for the objects of a pack.
    pub fn from_objects<'a>(
        objects: impl IntoIterator<Item = &'a ResolvedObject>,
        pack_checksum: ObjectId,
    ) -> Result<Self> {
        Self::new(objects.into_iter().map(IndexEntry::from).collect(), pack_checksum)
    }

    /// Format this index was read in (V2 for indexes built in memory).
    pub fn version(&self) -> IndexVersion {
        self.version
    }

    /// Checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> ObjectId {
        self.pack_checksum
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index has no objects.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by id.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Finds the entry for `id`.
    pub fn find(&self, id: &ObjectId) -> Option<&IndexEntry> {
        let first = usize::from(id.first_byte());
        let start = if first == 0 { 0 } else { self.fanout[first - 1] as usize };
        let end = self.fanout[first] as usize;
        let bucket = &self.entries[start..end];
        bucket
            .binary_search_by_key(id, |e| e.id)
            .ok()
            .map(|i| &bucket[i])
    }

    /// Returns the pack offset of `id`.
    pub fn lookup(&self, id: &ObjectId) -> Option<u64> {
        self.find(id).map(|e| e.offset)
    }

    /// Reads an index file, detecting its format.
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::parse(&data)
    }

    /// Parses index file bytes, verifying the trailing index checksum.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 40 {
            return Err(invalid("index too small"));
        }
        let (body, trailer) = data.split_at(data.len() - 20);
        let mut hasher = Sha1::new();
        hasher.update(body);
        let actual = digest_id(hasher);
        let expected = ObjectId::from_slice(trailer)?;
        if actual != expected {
            return Err(GitError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = Cursor { data: body, pos: 0 };
        let version = if body.starts_with(&V2_MAGIC) {
            cursor.pos = 4;
            match cursor.u32()? {
                2 => IndexVersion::V2,
                v => return Err(invalid(&format!("unsupported index version {v}"))),
            }
        } else {
            IndexVersion::V1
        };

        let mut fanout = [0u32; 256];
        for slot in fanout.iter_mut() {
            *slot = cursor.u32()?;
        }
        if fanout.windows(2).any(|w| w[0] > w[1]) {
            return Err(invalid("fan-out table is not monotonic"));
        }
        let count = fanout[255] as usize;

        let entries = match version {
            IndexVersion::V1 => read_v1_entries(&mut cursor, count)?,
            IndexVersion::V2 => read_v2_entries(&mut cursor, count)?,
        };

        let pack_checksum = ObjectId::from_slice(cursor.take(20)?)?;
        if cursor.pos != body.len() {
            return Err(invalid("unexpected data before index checksum"));
        }
        if entries.windows(2).any(|w| w[0].id >= w[1].id) {
            return Err(invalid("object ids are not sorted"));
        }
        if fanout != self::fanout(&entries) {
            return Err(invalid("fan-out table does not match object ids"));
        }

        tracing::debug!(?version, objects = count, "read pack index");
        Ok(Self {
            version,
            entries,
            fanout,
            pack_checksum,
        })
    }

    /// Writes the index in `version` format and returns the index checksum.
    pub fn write<W: Write>(&self, mut out: W, version: IndexVersion) -> Result<ObjectId> {
        let mut buf = Vec::with_capacity(1072 + self.entries.len() * 28);
        if version == IndexVersion::V2 {
            buf.extend_from_slice(&V2_MAGIC);
            buf.extend_from_slice(&2u32.to_be_bytes());
        }
        for count in self.fanout {
            buf.extend_from_slice(&count.to_be_bytes());
        }

        match version {
            IndexVersion::V1 => {
                for entry in &self.entries {
                    let offset = u32::try_from(entry.offset).map_err(|_| {
                        invalid(&format!("offset of {} needs index format 2", entry.id))
                    })?;
                    buf.extend_from_slice(&offset.to_be_bytes());
                    buf.extend_from_slice(entry.id.as_bytes());
                }
            }
            IndexVersion::V2 => {
                for entry in &self.entries {
                    buf.extend_from_slice(entry.id.as_bytes());
                }
                for entry in &self.entries {
                    let crc = entry
                        .crc32
                        .ok_or_else(|| invalid(&format!("no CRC32 recorded for {}", entry.id)))?;
                    buf.extend_from_slice(&crc.to_be_bytes());
                }
                let mut large = Vec::new();
                for entry in &self.entries {
                    let small = match u32::try_from(entry.offset) {
                        Ok(offset) if offset < LARGE_OFFSET => offset,
                        _ => {
                            let slot = u32::try_from(large.len())
                                .map_err(|_| invalid("too many large offsets"))?;
                            large.push(entry.offset);
                            LARGE_OFFSET | slot
                        }
                    };
                    buf.extend_from_slice(&small.to_be_bytes());
                }
                for offset in large {
                    buf.extend_from_slice(&offset.to_be_bytes());
                }
            }
        }

        buf.extend_from_slice(self.pack_checksum.as_bytes());
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let checksum = digest_id(hasher);
        buf.extend_from_slice(checksum.as_bytes());
        out.write_all(&buf)?;
        out.flush()?;
        Ok(checksum)
    }
}

fn invalid(message: &str) -> GitError {
    GitError::InvalidPack(format!("pack index: {message}"))
}

fn fanout(sorted: &[IndexEntry]) -> [u32; 256] {
    let mut fanout = [0u32; 256];
    for entry in sorted {
        fanout[usize::from(entry.id.first_byte())] += 1;
    }
    let mut total = 0;
    for slot in fanout.iter_mut() {
        total += *slot;
        *slot = total;
    }
    fanout
}

fn read_v1_entries(cursor: &mut Cursor<'_>, count: usize) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::with_capacity(count.min(cursor.remaining() / 24));
    for _ in 0..count {
        let offset = u64::from(cursor.u32()?);
        let id = ObjectId::from_slice(cursor.take(20)?)?;
        entries.push(IndexEntry {
            id,
            offset,
            crc32: None,
        });
    }
    Ok(entries)
}

fn read_v2_entries(cursor: &mut Cursor<'_>, count: usize) -> Result<Vec<IndexEntry>> {
    if cursor.remaining() < count.saturating_mul(28) {
        return Err(invalid("truncated object tables"));
    }
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(ObjectId::from_slice(cursor.take(20)?)?);
    }
    let mut crcs = Vec::with_capacity(count);
    for _ in 0..count {
        crcs.push(cursor.u32()?);
    }
    let mut small = Vec::with_capacity(count);
    for _ in 0..count {
        small.push(cursor.u32()?);
    }

    let large_count = small.iter().filter(|&&o| o & LARGE_OFFSET != 0).count();
    let mut large = Vec::with_capacity(large_count);
    for _ in 0..large_count {
        let bytes = cursor.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        large.push(u64::from_be_bytes(raw));
    }

    ids.into_iter()
        .zip(crcs)
        .zip(small)
        .map(|((id, crc), offset)| {
            let offset = if offset & LARGE_OFFSET != 0 {
                let slot = (offset & !LARGE_OFFSET) as usize;
                *large
                    .get(slot)
                    .ok_or_else(|| invalid("large offset slot out of range"))?
            } else {
                u64::from(offset)
            };
            Ok(IndexEntry {
                id,
                offset,
                crc32: Some(crc),
            })
        })
        .collect()
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| invalid("truncated"))?;
        self.pos += n;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
