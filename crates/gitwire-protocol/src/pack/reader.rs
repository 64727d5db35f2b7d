//! Streaming pack reader.
//!
//! [`PackReader`] walks a pack as it arrives, inflating one entry at a time
//! and resolving deltas against entries it has already seen. Ref deltas whose
//! base is neither earlier in the pack nor available from an
//! [`ObjectLookup`] are held back and resolved once the whole pack is read,
//! which is what thin packs need.
//!
//! Memory stays bounded: reconstructed objects are kept in an LRU cache with
//! a byte budget, and the raw pack is spooled aside (in memory, then on disk)
//! so that an evicted base can be inflated again when a later delta needs it.

use super::delta::apply_delta;
use super::entry::{EntryKind, PackObjectHeader};
use super::{digest_id, PACK_SIGNATURE};
use crate::{GitError, Result};
use bytes::Bytes;
use flate2::bufread::ZlibDecoder;
use gitwire_object::{GitObject, ObjectId, ObjectType};
use lru::LruCache;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::SpooledTempFile;

/// Size of the read-ahead buffer.
const BUFFER_SIZE: usize = 64 * 1024;

/// Default byte budget of the delta base cache.
pub const DEFAULT_CACHE_LIMIT: usize = 64 * 1024 * 1024;

/// Raw pack bytes kept in memory before the spool moves to a file.
const SPOOL_IN_MEMORY: usize = 32 * 1024 * 1024;

/// Source of objects outside the pack, used as ref-delta bases.
pub trait ObjectLookup {
    /// Returns the object named `id`, if available.
    fn find_object(&self, id: &ObjectId) -> Option<GitObject>;
}

impl ObjectLookup for HashMap<ObjectId, GitObject> {
    fn find_object(&self, id: &ObjectId) -> Option<GitObject> {
        self.get(id).cloned()
    }
}

impl<T: ObjectLookup + ?Sized> ObjectLookup for Arc<T> {
    fn find_object(&self, id: &ObjectId) -> Option<GitObject> {
        (**self).find_object(id)
    }
}

/// An object read from a pack, with its content fully reconstructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedObject {
    /// The object, its id computed from the reconstructed content.
    pub object: GitObject,
    /// Offset of the entry in the pack.
    pub offset: u64,
    /// CRC32 of the entry's raw bytes (header and compressed data).
    pub crc32: u32,
    /// Number of deltas applied to get here; 0 for whole objects.
    pub depth: u32,
}

/// Buffers the input, copies everything read into the spool and keeps a
/// running SHA-1, CRC32 and offset over every byte consumed.
struct CountingReader<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    hasher: Sha1,
    crc: crc32fast::Hasher,
    offset: u64,
    spool: SpooledTempFile,
}

impl<R: Read> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.filled {
            self.filled = self.inner.read(&mut self.buf)?;
            self.pos = 0;
            self.spool.write_all(&self.buf[..self.filled])?;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.filled - self.pos);
        let consumed = &self.buf[self.pos..self.pos + amt];
        self.hasher.update(consumed);
        self.crc.update(consumed);
        self.offset += amt as u64;
        self.pos += amt;
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = {
            let available = self.fill_buf()?;
            let n = available.len().min(out.len());
            out[..n].copy_from_slice(&available[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

/// Where a delta entry's base lives.
#[derive(Debug, Clone, Copy)]
enum Base {
    Offset(u64),
    Id(ObjectId),
}

/// What is remembered about every entry read: enough to rebuild it.
struct Slot {
    object_type: ObjectType,
    depth: u32,
    /// Offset of the compressed data, just past the entry header.
    data_start: u64,
    size: u64,
    base: Option<Base>,
}

/// A ref delta waiting for its base.
struct Pending {
    offset: u64,
    crc32: u32,
    base: ObjectId,
    data_start: u64,
    size: u64,
}

/// Reads the objects of a pack from any byte stream.
pub struct PackReader<R> {
    input: CountingReader<R>,
    version: u32,
    count: u32,
    entries_read: u32,
    slots: HashMap<u64, Slot>,
    ids: HashMap<ObjectId, u64>,
    cache: LruCache<u64, Bytes>,
    cache_bytes: usize,
    cache_limit: usize,
    pending: Vec<Pending>,
    lookup: Option<Box<dyn ObjectLookup + Send>>,
    checksum: Option<ObjectId>,
    failed: bool,
}

impl<R: Read> PackReader<R> {
    /// Reads and validates the pack header.
    pub fn new(reader: R) -> Result<Self> {
        let mut input = CountingReader {
            inner: reader,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            filled: 0,
            hasher: Sha1::new(),
            crc: crc32fast::Hasher::new(),
            offset: 0,
            spool: tempfile::spooled_tempfile(SPOOL_IN_MEMORY),
        };

        let mut header = [0u8; 12];
        input.read_exact(&mut header).map_err(|e| match GitError::from(e) {
            GitError::UnexpectedEof => GitError::InvalidPack("pack too small".to_string()),
            other => other,
        })?;
        if &header[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack("invalid signature".to_string()));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(GitError::InvalidPack(format!("unsupported version: {version}")));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        tracing::debug!(version, objects = count, "reading pack");

        Ok(Self {
            input,
            version,
            count,
            entries_read: 0,
            slots: HashMap::new(),
            ids: HashMap::new(),
            cache: LruCache::unbounded(),
            cache_bytes: 0,
            cache_limit: DEFAULT_CACHE_LIMIT,
            pending: Vec::new(),
            lookup: None,
            checksum: None,
            failed: false,
        })
    }

    /// Resolves ref deltas against `lookup` when the base is not in the pack.
    pub fn with_lookup(mut self, lookup: impl ObjectLookup + Send + 'static) -> Self {
        self.lookup = Some(Box::new(lookup));
        self
    }

    /// Sets the byte budget for reconstructed objects kept as delta bases.
    /// Bases evicted from the cache are inflated again from the spooled pack.
    pub fn with_cache_limit(mut self, bytes: usize) -> Self {
        self.cache_limit = bytes;
        self.shrink_cache(0);
        self
    }

    /// Pack format version (2 or 3).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of objects the header announces.
    pub fn object_count(&self) -> u32 {
        self.count
    }

    /// The verified trailing checksum, once every entry has been read.
    pub fn checksum(&self) -> Option<ObjectId> {
        self.checksum
    }

    /// Returns the next object, or `None` once the pack is exhausted and its
    /// checksum verified.
    pub fn next_object(&mut self) -> Result<Option<ResolvedObject>> {
        while self.entries_read < self.count {
            self.entries_read += 1;
            if let Some(object) = self.read_entry()? {
                return Ok(Some(object));
            }
        }
        if self.checksum.is_none() {
            self.verify_trailer()?;
        }
        self.resolve_pending()
    }

    /// Reads the remaining objects and returns them with the pack checksum.
    ///
    /// The returned objects are all held in memory; iterate the reader to
    /// process a large pack one object at a time.
    pub fn read_all(mut self) -> Result<(Vec<ResolvedObject>, ObjectId)> {
        let mut objects = Vec::with_capacity((self.count as usize).min(4096));
        while let Some(object) = self.next_object()? {
            objects.push(object);
        }
        let checksum = self
            .checksum
            .ok_or_else(|| GitError::InvalidPack("pack checksum not read".to_string()))?;
        Ok((objects, checksum))
    }

    fn read_entry(&mut self) -> Result<Option<ResolvedObject>> {
        let offset = self.input.offset;
        self.input.crc = crc32fast::Hasher::new();
        let (header, _) = PackObjectHeader::read(&mut self.input)?;
        let data_start = self.input.offset;
        let payload = self.inflate(header.size, offset)?;
        let crc32 = std::mem::take(&mut self.input.crc).finalize();
        tracing::trace!(offset, kind = ?header.kind, size = header.size, "pack entry");

        let mut slot = Slot {
            object_type: ObjectType::Blob,
            depth: 0,
            data_start,
            size: header.size,
            base: None,
        };
        match header.kind {
            EntryKind::Base(object_type) => {
                slot.object_type = object_type;
                Ok(Some(self.store(offset, crc32, slot, payload.into())))
            }
            EntryKind::OffsetDelta { offset: back } => {
                let base_offset = offset
                    .checked_sub(back)
                    .filter(|base_offset| self.slots.contains_key(base_offset))
                    .ok_or_else(|| {
                        GitError::InvalidPack(format!(
                            "entry at {offset} refers to unknown base {back} bytes back"
                        ))
                    })?;
                let (object_type, base, depth) = self.base_at(base_offset)?;
                slot.object_type = object_type;
                slot.depth = depth + 1;
                slot.base = Some(Base::Offset(base_offset));
                let data = apply_delta(&base, &payload)?;
                Ok(Some(self.store(offset, crc32, slot, data.into())))
            }
            EntryKind::RefDelta { base } => match self.find_base(&base)? {
                Some((object_type, data, depth)) => {
                    slot.object_type = object_type;
                    slot.depth = depth + 1;
                    slot.base = Some(Base::Id(base));
                    let data = apply_delta(&data, &payload)?;
                    Ok(Some(self.store(offset, crc32, slot, data.into())))
                }
                None => {
                    tracing::trace!(offset, base = %base, "deferring ref delta");
                    self.pending.push(Pending {
                        offset,
                        crc32,
                        base,
                        data_start,
                        size: header.size,
                    });
                    Ok(None)
                }
            },
        }
    }

    /// Inflates exactly `size` bytes of zlib data from the input.
    fn inflate(&mut self, size: u64, offset: u64) -> Result<Vec<u8>> {
        inflate_exact(&mut self.input, size, offset)
    }

    /// Inflates an entry again from the spooled pack.
    fn reinflate(&mut self, data_start: u64, size: u64, offset: u64) -> Result<Vec<u8>> {
        let spool = &mut self.input.spool;
        spool.seek(SeekFrom::Start(data_start))?;
        let data = inflate_exact(BufReader::new(&mut *spool), size, offset);
        // Later input is appended at the end.
        spool.seek(SeekFrom::End(0))?;
        data
    }

    /// Returns the type, content and depth of the entry at `offset`,
    /// rebuilding it from the spool if it was evicted from the cache.
    fn base_at(&mut self, offset: u64) -> Result<(ObjectType, Bytes, u32)> {
        let (object_type, depth) = match self.slots.get(&offset) {
            Some(slot) => (slot.object_type, slot.depth),
            None => return Err(GitError::InvalidPack(format!("no entry at {offset}"))),
        };
        if let Some(data) = self.cache.get(&offset) {
            return Ok((object_type, data.clone(), depth));
        }

        // Walk down the delta chain to something cached, a whole object or
        // an external base, then apply the deltas back up.
        let mut chain = Vec::new();
        let mut current = offset;
        let mut data = loop {
            if let Some(data) = self.cache.get(&current) {
                break data.clone();
            }
            let (data_start, size, base) = match self.slots.get(&current) {
                Some(slot) => (slot.data_start, slot.size, slot.base),
                None => return Err(GitError::InvalidPack(format!("no entry at {current}"))),
            };
            match base {
                None => {
                    let data = Bytes::from(self.reinflate(data_start, size, current)?);
                    self.cache_put(current, data.clone());
                    break data;
                }
                Some(Base::Offset(base)) => {
                    chain.push(current);
                    current = base;
                }
                Some(Base::Id(id)) => {
                    chain.push(current);
                    match self.ids.get(&id) {
                        Some(&base) => current = base,
                        None => break self.lookup_object(&id)?.ok_or(GitError::MissingBase(id))?.data,
                    }
                }
            }
        };
        tracing::trace!(offset, chain = chain.len(), "rebuilding evicted base");

        for entry in chain.into_iter().rev() {
            let (data_start, size) = match self.slots.get(&entry) {
                Some(slot) => (slot.data_start, slot.size),
                None => return Err(GitError::InvalidPack(format!("no entry at {entry}"))),
            };
            let delta = self.reinflate(data_start, size, entry)?;
            data = Bytes::from(apply_delta(&data, &delta)?);
            self.cache_put(entry, data.clone());
        }
        Ok((object_type, data, depth))
    }

    /// Finds a ref-delta base in the pack or through the lookup.
    fn find_base(&mut self, id: &ObjectId) -> Result<Option<(ObjectType, Bytes, u32)>> {
        if let Some(&offset) = self.ids.get(id) {
            return self.base_at(offset).map(Some);
        }
        Ok(self
            .lookup_object(id)?
            .map(|object| (object.object_type, object.data, 0)))
    }

    fn lookup_object(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        let Some(object) = self.lookup.as_ref().and_then(|lookup| lookup.find_object(id)) else {
            return Ok(None);
        };
        // External objects are held to the same integrity rule as pack entries.
        Ok(Some(GitObject::verified(object.object_type, object.data, *id)?))
    }

    fn store(&mut self, offset: u64, crc32: u32, slot: Slot, data: Bytes) -> ResolvedObject {
        let object = GitObject::new(slot.object_type, data.clone());
        let depth = slot.depth;
        self.ids.insert(object.id, offset);
        self.slots.insert(offset, slot);
        self.cache_put(offset, data);
        ResolvedObject {
            object,
            offset,
            crc32,
            depth,
        }
    }

    fn cache_put(&mut self, offset: u64, data: Bytes) {
        if data.len() > self.cache_limit {
            return;
        }
        self.shrink_cache(data.len());
        if let Some(old) = self.cache.put(offset, data.clone()) {
            self.cache_bytes -= old.len();
        }
        self.cache_bytes += data.len();
    }

    /// Evicts least recently used bases until `incoming` more bytes fit.
    fn shrink_cache(&mut self, incoming: usize) {
        while self.cache_bytes + incoming > self.cache_limit {
            match self.cache.pop_lru() {
                Some((_, evicted)) => self.cache_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    fn verify_trailer(&mut self) -> Result<()> {
        let actual = digest_id(self.input.hasher.clone());
        let mut trailer = [0u8; ObjectId::LEN];
        self.input.read_exact(&mut trailer).map_err(|e| match GitError::from(e) {
            GitError::UnexpectedEof => GitError::InvalidPack("missing pack checksum".to_string()),
            other => other,
        })?;
        let expected = ObjectId::from_bytes(trailer);
        if expected != actual {
            return Err(GitError::ChecksumMismatch { expected, actual });
        }
        if !self.input.fill_buf()?.is_empty() {
            return Err(GitError::InvalidPack("trailing data after pack checksum".to_string()));
        }
        tracing::debug!(checksum = %actual, objects = self.count, "pack checksum verified");
        self.checksum = Some(actual);
        Ok(())
    }

    /// Resolves one deferred ref delta whose base is now known.
    fn resolve_pending(&mut self) -> Result<Option<ResolvedObject>> {
        for i in 0..self.pending.len() {
            let base = self.pending[i].base;
            let Some((object_type, data, depth)) = self.find_base(&base)? else {
                continue;
            };
            let pending = self.pending.swap_remove(i);
            let delta = self.reinflate(pending.data_start, pending.size, pending.offset)?;
            let slot = Slot {
                object_type,
                depth: depth + 1,
                data_start: pending.data_start,
                size: pending.size,
                base: Some(Base::Id(base)),
            };
            let data = apply_delta(&data, &delta)?;
            return Ok(Some(self.store(pending.offset, pending.crc32, slot, data.into())));
        }
        match self.pending.first() {
            Some(pending) => Err(GitError::MissingBase(pending.base)),
            None => Ok(None),
        }
    }
}

/// Inflates exactly `size` bytes of zlib data from `input`.
fn inflate_exact(input: impl BufRead, size: u64, offset: u64) -> Result<Vec<u8>> {
    let expected = usize::try_from(size)
        .map_err(|_| GitError::InvalidPack(format!("entry at {offset} too large")))?;
    let mut data = Vec::with_capacity(expected.min(BUFFER_SIZE * 16));
    ZlibDecoder::new(input)
        .take(size.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|e| match GitError::from(e) {
            GitError::Io(e) => GitError::InvalidPack(format!("corrupt entry at {offset}: {e}")),
            other => other,
        })?;
    if data.len() != expected {
        return Err(GitError::InvalidPack(format!(
            "entry at {offset} inflated to {} bytes, header says {expected}",
            data.len()
        )));
    }
    Ok(data)
}

impl<R: Read> Iterator for PackReader<R> {
    type Item = Result<ResolvedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_object() {
            Ok(object) => object.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl<R> std::fmt::Debug for PackReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackReader")
            .field("version", &self.version)
            .field("count", &self.count)
            .field("entries_read", &self.entries_read)
            .field("cached_bytes", &self.cache_bytes)
            .field("pending", &self.pending.len())
            .finish()
    }
}
