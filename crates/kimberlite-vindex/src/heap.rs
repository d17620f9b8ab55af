//! Append-only posting-list store (the index's data file).
//!
//! Layout: a 4-byte big-endian `size` header at offset 0, followed by
//! length-prefixed, varint-encoded posting lists. Each posting list is
//! `len, id0, d1, d2, ..`: the key's first (smallest) record id stored
//! absolute, every following id stored as a positive delta from its
//! predecessor. Decoding deltas back into absolute ids is the caller's
//! job (see [`crate::mutate`]) — this module only knows how to read and
//! write raw integer sequences.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kimberlite_io::{FileHandle, IoBackend, IoError, OpenFlags};

use crate::codec::{self, EncodedInt};

const HEADER_LEN: u64 = 4;

/// Returned by [`Heap::write_nums`] when the new encoding does not fit in
/// the space the old one occupied. The caller must append instead and
/// repoint whatever referenced the old offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MustAppend;

/// The append-only data file (C2 in the on-disk layout).
pub struct Heap {
    backend: Arc<dyn IoBackend>,
    handle: FileHandle,
    /// Offset of the first free byte. Only ever grows. This is tracked from
    /// the file's actual length, not from the header word — the header
    /// holds the index's slot count instead (see [`Self::size`]).
    cursor: AtomicU64,
    /// Bytes made unreachable by an in-place overwrite that shrank a
    /// posting list, or by an overwrite that fell back to append. Used for
    /// [`crate::config::IndexConfig::rebuild_dead_ratio`] advisories only.
    dead_bytes: AtomicU64,
}

impl Heap {
    /// Opens (creating if needed) the heap file at `path`.
    ///
    /// Opened without `O_APPEND`: every write this module issues goes
    /// through positional `write_at` (the header, in-place overwrites, and
    /// appends alike, the last by passing the tracked [`Self::byte_len`] as
    /// the offset), and on Linux a `pwrite` against an `O_APPEND` descriptor
    /// ignores the given offset and always lands at EOF — which would both
    /// send in-place overwrites to the wrong place and never touch the
    /// header word.
    pub fn open(backend: Arc<dyn IoBackend>, path: &Path) -> Result<Self, IoError> {
        let existed = path.exists();
        let handle = backend.open(
            path,
            OpenFlags {
                read: true,
                write: true,
                create: true,
                ..OpenFlags::default()
            },
        )?;
        let file_size = if existed { backend.file_size(&handle)? } else { 0 };
        let cursor = if file_size >= HEADER_LEN {
            file_size
        } else {
            backend.write_at(&handle, 0, &0u32.to_be_bytes())?;
            HEADER_LEN
        };
        Ok(Self {
            backend,
            handle,
            cursor: AtomicU64::new(cursor),
            dead_bytes: AtomicU64::new(0),
        })
    }

    /// The `size` word in header byte 0–3: the index's slot count (number
    /// of live directory entries), per the on-disk format — *not* this
    /// file's own byte length. Kept current by [`crate::index::ValueIndex`]
    /// after every directory mutation via [`Self::set_size`].
    pub fn size(&self) -> Result<u32, IoError> {
        let mut header = [0u8; 4];
        self.backend.read_at(&self.handle, 0, &mut header)?;
        Ok(u32::from_be_bytes(header))
    }

    /// Persists the index's current slot count into the header word.
    pub fn set_size(&self, size: u32) -> Result<(), IoError> {
        self.backend.write_at(&self.handle, 0, &size.to_be_bytes())
    }

    /// Total bytes in the heap file, including the header. Used only for
    /// [`crate::index::ValueIndex::fragmentation_ratio`]'s denominator.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Bytes that are allocated in the file but no longer reachable from
    /// any directory slot.
    #[must_use]
    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes.load(Ordering::Acquire)
    }

    /// Reads the posting list at `offset`, returning its `len` values
    /// (first absolute, remainder delta-encoded).
    pub fn read_nums(&self, offset: u64) -> Result<Vec<u32>, IoError> {
        let (values, _consumed) = self.read_raw(offset)?;
        Ok(values)
    }

    /// Like [`Self::read_nums`] but also returns the total byte length of
    /// the encoding, needed by [`Self::write_nums`] to decide whether an
    /// in-place overwrite fits.
    fn read_raw(&self, offset: u64) -> Result<(Vec<u32>, usize), IoError> {
        // Posting lists are short (record-id counts per key are not
        // expected to be enormous); a bounded probe-and-grow read avoids
        // needing to know the length up front.
        let mut probe_len = 64usize;
        loop {
            let mut buf = vec![0u8; probe_len];
            let n = self.backend.read_at(&self.handle, offset, &mut buf)?;
            buf.truncate(n);
            match try_decode(&buf) {
                Some(result) => return Ok(result),
                None if n < probe_len => {
                    // Hit EOF before a full decode; the data is short, not truncated.
                    return Ok((Vec::new(), 0));
                }
                None => probe_len *= 4,
            }
        }
    }

    /// Appends a new posting list and returns the offset it was written at.
    pub fn append_nums(&self, values: &[u32]) -> Result<u64, IoError> {
        let encoded = encode_posting_list(values);
        let offset = self.cursor.load(Ordering::Acquire);
        self.backend.write_at(&self.handle, offset, &encoded)?;
        let new_cursor = offset + encoded.len() as u64;
        self.cursor.store(new_cursor, Ordering::Release);
        Ok(offset)
    }

    /// Overwrites the posting list at `offset` in place if the new
    /// encoding is no longer than the old one, otherwise returns
    /// [`MustAppend`] so the caller can append and repoint.
    pub fn write_nums(&self, offset: u64, values: &[u32]) -> Result<Result<(), MustAppend>, IoError> {
        let (_old_values, old_len) = self.read_raw(offset)?;
        let encoded = encode_posting_list(values);
        if encoded.len() > old_len {
            return Ok(Err(MustAppend));
        }
        self.backend.write_at(&self.handle, offset, &encoded)?;
        let shrink = old_len - encoded.len();
        if shrink > 0 {
            self.dead_bytes.fetch_add(shrink as u64, Ordering::AcqRel);
        }
        Ok(Ok(()))
    }

    /// Marks the posting list previously at `offset` (of `byte_len` bytes)
    /// as dead, e.g. because [`Self::write_nums`] fell back to append.
    pub fn mark_dead(&self, byte_len: u64) {
        self.dead_bytes.fetch_add(byte_len, Ordering::AcqRel);
    }

    /// Byte length of the posting list encoding at `offset`, for callers
    /// that need to know how much to mark dead after relocating it.
    pub fn encoded_len_at(&self, offset: u64) -> Result<u64, IoError> {
        let (_values, len) = self.read_raw(offset)?;
        Ok(len as u64)
    }
}

fn encode_posting_list(values: &[u32]) -> Vec<u8> {
    let len = codec::encode(values.len() as u32);
    let mut out = Vec::with_capacity(len.len() + values.len() * 2);
    out.extend_from_slice(len.as_bytes());
    for &v in values {
        out.extend_from_slice(encode_one(v).as_bytes());
    }
    out
}

fn encode_one(v: u32) -> EncodedInt {
    codec::encode(v)
}

/// Tries to decode a full posting list from the start of `buf`. Returns
/// `None` if `buf` does not contain enough bytes to know.
fn try_decode(buf: &[u8]) -> Option<(Vec<u32>, usize)> {
    if buf.is_empty() {
        return None;
    }
    let (count, mut pos) = safe_decode_at(buf, 0)?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (v, next) = safe_decode_at(buf, pos)?;
        values.push(v);
        pos = next;
    }
    Some((values, pos))
}

fn safe_decode_at(buf: &[u8], offset: usize) -> Option<(u32, usize)> {
    if offset >= buf.len() {
        return None;
    }
    let class_len = match buf[offset] & 0xC0 {
        0x00 => 1,
        0x40 => 2,
        0x80 => 3,
        _ => 5,
    };
    if offset + class_len > buf.len() {
        return None;
    }
    Some(codec::decode_at(buf, offset))
}
