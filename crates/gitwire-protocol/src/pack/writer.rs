//! Pack writing.

use super::delta::create_delta;
use super::entry::{EntryKind, PackObjectHeader};
use super::{digest_id, PACK_SIGNATURE, PACK_VERSION};
use crate::{GitError, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use gitwire_object::{GitObject, ObjectId};
use sha1::{Digest, Sha1};
use std::io::Write;

/// How many preceding objects [`PackBuilder`] tries as delta bases.
const DELTA_WINDOW: usize = 10;

/// Streams a pack to any writer.
///
/// The object count goes in the header, so it must be known up front;
/// [`PackWriter::finish`] fails if a different number of entries was written.
pub struct PackWriter<W: Write> {
    inner: W,
    hasher: Sha1,
    offset: u64,
    expected: u32,
    written: u32,
}

impl<W: Write> PackWriter<W> {
    /// Writes the pack header for `count` entries.
    pub fn new(inner: W, count: u32) -> Result<Self> {
        let mut writer = Self {
            inner,
            hasher: Sha1::new(),
            offset: 0,
            expected: count,
            written: 0,
        };
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(PACK_SIGNATURE);
        header.extend_from_slice(&PACK_VERSION.to_be_bytes());
        header.extend_from_slice(&count.to_be_bytes());
        writer.put(&header)?;
        Ok(writer)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Current offset, i.e. where the next entry will start.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Writes one entry and returns its offset. `payload` is the object data
    /// for whole objects and the delta instructions for deltas.
    pub fn write_entry(&mut self, kind: EntryKind, payload: &[u8]) -> Result<u64> {
        if self.written == self.expected {
            return Err(GitError::InvalidPack(format!(
                "pack header announced {} objects",
                self.expected
            )));
        }
        let start = self.offset;
        self.put(&PackObjectHeader::new(kind, payload.len() as u64).to_bytes())?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;
        self.put(&compressed)?;
        self.written += 1;
        Ok(start)
    }

    /// Writes a whole object and returns its offset.
    pub fn write_object(&mut self, object: &GitObject) -> Result<u64> {
        self.write_entry(EntryKind::Base(object.object_type), &object.data)
    }

    /// Writes the trailing checksum, returning the writer and the checksum.
    pub fn finish(mut self) -> Result<(W, ObjectId)> {
        if self.written != self.expected {
            return Err(GitError::InvalidPack(format!(
                "pack header announced {} objects, {} written",
                self.expected, self.written
            )));
        }
        let checksum = digest_id(self.hasher.clone());
        self.inner.write_all(checksum.as_bytes())?;
        self.inner.flush()?;
        tracing::debug!(objects = self.written, checksum = %checksum, "pack written");
        Ok((self.inner, checksum))
    }
}

/// Builds a pack file from a set of objects.
#[derive(Debug, Default)]
pub struct PackBuilder {
    objects: Vec<GitObject>,
    deltas: bool,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores objects as offset deltas against earlier objects of the same
    /// type when that is smaller.
    pub fn with_deltas(mut self) -> Self {
        self.deltas = true;
        self
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Number of objects added so far.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no objects were added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file in memory.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();
        self.write_to(&mut pack)?;
        Ok(pack)
    }

    /// Streams the pack to `out`, returning its checksum.
    pub fn write_to<W: Write>(self, out: W) -> Result<ObjectId> {
        let count = u32::try_from(self.objects.len())
            .map_err(|_| GitError::InvalidPack("too many objects for one pack".to_string()))?;
        let mut writer = PackWriter::new(out, count)?;
        let mut offsets = Vec::with_capacity(self.objects.len());

        for (i, object) in self.objects.iter().enumerate() {
            let offset = writer.offset();
            match self.deltas.then(|| self.best_delta(i)).flatten() {
                Some((base, delta)) => {
                    let back = offset - offsets[base];
                    writer.write_entry(EntryKind::OffsetDelta { offset: back }, &delta)?;
                }
                None => {
                    writer.write_object(object)?;
                }
            }
            offsets.push(offset);
        }

        let (_, checksum) = writer.finish()?;
        Ok(checksum)
    }

    /// Picks the earlier object in the window that gives the smallest delta
    /// for object `i`, if any delta beats half the object's size.
    fn best_delta(&self, i: usize) -> Option<(usize, Vec<u8>)> {
        let target = &self.objects[i];
        let mut best: Option<(usize, Vec<u8>)> = None;
        for base in (i.saturating_sub(DELTA_WINDOW)..i).rev() {
            let candidate = &self.objects[base];
            if candidate.object_type != target.object_type {
                continue;
            }
            let delta = create_delta(&candidate.data, &target.data);
            let limit = best.as_ref().map_or(target.data.len() / 2, |(_, d)| d.len());
            if delta.len() < limit {
                best = Some((base, delta));
            }
        }
        best
    }
}
