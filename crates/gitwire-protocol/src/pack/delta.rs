//! Git delta encoding.
//!
//! A delta starts with the base and result sizes as little-endian base-128
//! varints, followed by instructions that either copy a window of the base or
//! insert literal bytes.

use crate::{GitError, Result};
use std::collections::HashMap;

/// Length a copy instruction with no length bytes stands for.
const DEFAULT_COPY_LEN: usize = 0x10000;
/// Largest literal run a single insert can carry.
const MAX_INSERT: usize = 0x7F;
/// Block size used to index the base in [`create_delta`].
const BLOCK: usize = 16;

/// One delta instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaInstruction<'a> {
    /// Copy `length` bytes starting at `offset` in the base.
    Copy {
        /// Start of the window in the base.
        offset: usize,
        /// Window length, 1..=0xFFFFFF.
        length: usize,
    },
    /// Append literal bytes (1..=127 of them).
    Insert(&'a [u8]),
}

/// Appends a copy instruction. `length` must be in `1..=0xFF_FFFF`.
fn push_copy(offset: u32, length: u32, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(0x80);
    let mut cmd = 0x80u8;
    for (i, byte) in offset.to_le_bytes().into_iter().enumerate() {
        if byte != 0 {
            cmd |= 1 << i;
            out.push(byte);
        }
    }
    // 0x10000 is written with no length bytes at all.
    if length as usize != DEFAULT_COPY_LEN {
        for (i, byte) in length.to_le_bytes()[..3].iter().enumerate() {
            if *byte != 0 {
                cmd |= 0x10 << i;
                out.push(*byte);
            }
        }
    }
    out[start] = cmd;
}

impl DeltaInstruction<'_> {
    /// Appends the encoded instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match *self {
            Self::Copy { offset, length } => {
                let offset = u32::try_from(offset)
                    .map_err(|_| GitError::InvalidDelta(format!("copy offset {offset} too large")))?;
                if length == 0 || length > 0xFF_FFFF {
                    return Err(GitError::InvalidDelta(format!("invalid copy length {length}")));
                }
                push_copy(offset, length as u32, out);
            }
            Self::Insert(data) => {
                if data.is_empty() || data.len() > MAX_INSERT {
                    return Err(GitError::InvalidDelta(format!(
                        "invalid insert length {}",
                        data.len()
                    )));
                }
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
        }
        Ok(())
    }
}

/// Iterator over the instructions of a delta.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    delta: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<DeltaInstruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let cmd = *self.delta.get(self.pos)?;
        self.pos += 1;
        Some(self.decode(cmd))
    }
}

impl<'a> Instructions<'a> {
    fn next_byte(&mut self) -> Result<u8> {
        let byte = self
            .delta
            .get(self.pos)
            .copied()
            .ok_or_else(|| GitError::InvalidDelta("truncated copy instruction".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn decode(&mut self, cmd: u8) -> Result<DeltaInstruction<'a>> {
        if cmd & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    offset |= usize::from(self.next_byte()?) << (8 * i);
                }
            }
            let mut length = 0usize;
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    length |= usize::from(self.next_byte()?) << (8 * i);
                }
            }
            if length == 0 {
                length = DEFAULT_COPY_LEN;
            }
            return Ok(DeltaInstruction::Copy { offset, length });
        }
        if cmd == 0 {
            // Reserved by git; never produced by a valid encoder.
            self.delta = &[];
            return Err(GitError::InvalidDelta("instruction byte 0".to_string()));
        }
        let len = usize::from(cmd);
        let end = self.pos + len;
        let Some(data) = self.delta.get(self.pos..end) else {
            self.delta = &[];
            return Err(GitError::InvalidDelta("truncated insert instruction".to_string()));
        };
        self.pos = end;
        Ok(DeltaInstruction::Insert(data))
    }
}

/// Reads a base-128 size varint at `*pos`.
fn read_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *delta
            .get(*pos)
            .ok_or_else(|| GitError::InvalidDelta("truncated size".to_string()))?;
        *pos += 1;
        if shift > 63 {
            return Err(GitError::InvalidDelta("size overflows".to_string()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    usize::try_from(value).map_err(|_| GitError::InvalidDelta("size overflows".to_string()))
}

fn write_size(mut value: usize, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Parses the delta header, returning `(base_size, result_size, instructions)`.
pub fn parse_delta(delta: &[u8]) -> Result<(usize, usize, Instructions<'_>)> {
    let mut pos = 0;
    let base_size = read_size(delta, &mut pos)?;
    let result_size = read_size(delta, &mut pos)?;
    Ok((base_size, result_size, Instructions { delta, pos }))
}

/// Applies `delta` to `base`.
///
/// Fails if the declared base size does not match `base`, if a copy window
/// leaves the base or overruns the declared result size, or if the result
/// does not come out at exactly the declared size.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let (base_size, result_size, instructions) = parse_delta(delta)?;
    if base_size != base.len() {
        return Err(GitError::InvalidDelta(format!(
            "base size mismatch: delta expects {base_size}, base has {}",
            base.len()
        )));
    }

    // The declared size is untrusted until the instructions deliver it.
    let mut result = Vec::with_capacity(result_size.min(delta.len().saturating_mul(64)));
    for instruction in instructions {
        let chunk = match instruction? {
            DeltaInstruction::Copy { offset, length } => offset
                .checked_add(length)
                .and_then(|end| base.get(offset..end))
                .ok_or_else(|| {
                    GitError::InvalidDelta(format!(
                        "copy {offset}+{length} outside base of {} bytes",
                        base.len()
                    ))
                })?,
            DeltaInstruction::Insert(data) => data,
        };
        if result.len() + chunk.len() > result_size {
            return Err(GitError::InvalidDelta(format!(
                "result exceeds declared size {result_size}"
            )));
        }
        result.extend_from_slice(chunk);
    }

    if result.len() != result_size {
        return Err(GitError::InvalidDelta(format!(
            "result is {} bytes, expected {result_size}",
            result.len()
        )));
    }
    Ok(result)
}

/// Builds a delta that turns `base` into `target`.
///
/// Blocks of the base are indexed by content; the target is scanned for
/// matching blocks, which are extended as far as they go and emitted as
/// copies. Everything else becomes inserts.
pub fn create_delta(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(target.len() / 2 + 16);
    write_size(base.len(), &mut out);
    write_size(target.len(), &mut out);

    let mut index: HashMap<&[u8], usize> = HashMap::new();
    // Copy offsets are limited to 32 bits.
    let indexed = base.len().min(u32::MAX as usize);
    for start in (0..indexed.saturating_sub(BLOCK - 1)).step_by(BLOCK) {
        index.entry(&base[start..start + BLOCK]).or_insert(start);
    }

    let mut literal_start = 0;
    let mut pos = 0;
    while pos < target.len() {
        let found = target
            .get(pos..pos + BLOCK)
            .and_then(|block| index.get(block).copied());
        let Some(base_start) = found else {
            pos += 1;
            continue;
        };

        let mut len = BLOCK;
        while base_start + len < indexed && pos + len < target.len() && base[base_start + len] == target[pos + len] {
            len += 1;
        }
        // Grow the match backwards into pending literals.
        let mut back = 0;
        while pos - back > literal_start && base_start > back && base[base_start - back - 1] == target[pos - back - 1] {
            back += 1;
        }

        emit_inserts(&target[literal_start..pos - back], &mut out);
        // Everything below `indexed` is addressable with 32 bits.
        emit_copies((base_start - back) as u32, (len + back) as u32, &mut out);
        pos += len;
        literal_start = pos;
    }
    emit_inserts(&target[literal_start..], &mut out);
    out
}

fn emit_inserts(mut literal: &[u8], out: &mut Vec<u8>) {
    while !literal.is_empty() {
        let n = literal.len().min(MAX_INSERT);
        out.push(n as u8);
        out.extend_from_slice(&literal[..n]);
        literal = &literal[n..];
    }
}

fn emit_copies(mut offset: u32, mut length: u32, out: &mut Vec<u8>) {
    while length > 0 {
        let n = length.min(DEFAULT_COPY_LEN as u32);
        push_copy(offset, n, out);
        offset += n;
        length -= n;
    }
}
