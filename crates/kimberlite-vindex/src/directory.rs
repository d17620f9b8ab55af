//! Sorted key/offset arrays (C3 in the on-disk layout): `idxr` holds heap
//! offsets, `ctext` holds the keys themselves, parallel and sorted by key
//! using unsigned byte-lexicographic order (`[u8]`'s `Ord` impl is already
//! unsigned-lexicographic, unlike `&str`'s, which is the comparison this
//! format actually wants).
//!
//! Both arrays are small enough, and mutated rarely enough relative to how
//! often they are searched, that this module keeps a full in-memory mirror
//! and rewrites both files whole on [`Directory::flush`] — the same
//! trade-off `kimberlite-storage::index::OffsetIndex::save` makes for its
//! own sorted position array.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kimberlite_io::{FileHandle, IoBackend, IoError, OpenFlags};

use crate::codec;

const IDXR_HEADER_LEN: u64 = 4;

/// The directory: two parallel, key-sorted arrays.
pub struct Directory {
    backend: Arc<dyn IoBackend>,
    idxr_path: PathBuf,
    ctext_path: PathBuf,
    offsets: Vec<u64>,
    keys: Vec<Box<[u8]>>,
}

impl Directory {
    /// Opens (creating if needed) the directory files rooted at `prefix`.
    pub fn open(backend: Arc<dyn IoBackend>, idxr_path: &Path, ctext_path: &Path) -> Result<Self, IoError> {
        let idxr_handle = backend.open(idxr_path, OpenFlags::append_create())?;
        let count = read_count(&backend, &idxr_handle)?;
        let offsets = read_offsets(&backend, &idxr_handle, count)?;
        backend.close(idxr_handle)?;

        let keys = if ctext_path.exists() {
            let bytes = backend.read_all(ctext_path)?;
            read_keys(&bytes, count)
        } else {
            Vec::new()
        };

        Ok(Self {
            backend,
            idxr_path: idxr_path.to_path_buf(),
            ctext_path: ctext_path.to_path_buf(),
            offsets,
            keys,
        })
    }

    /// Number of key/offset slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub fn key_at(&self, slot: usize) -> &[u8] {
        &self.keys[slot]
    }

    #[must_use]
    pub fn offset_at(&self, slot: usize) -> u64 {
        self.offsets[slot]
    }

    pub fn set_offset(&mut self, slot: usize, offset: u64) {
        self.offsets[slot] = offset;
    }

    /// Finds `key`. `Ok(slot)` on a hit, `Err(insertion_point)` on a miss,
    /// matching `[T]::binary_search`'s convention.
    pub fn binary_search(&self, key: &[u8]) -> Result<usize, usize> {
        self.keys.binary_search_by(|candidate| candidate.as_ref().cmp(key))
    }

    /// Inserts a new key/offset pair at `slot`, shifting every later slot
    /// one to the right. Callers driving the bulk `add` algorithm insert
    /// largest-key-first so every shift lands in already-visited territory.
    pub fn insert(&mut self, slot: usize, key: &[u8], offset: u64) {
        self.keys.insert(slot, key.into());
        self.offsets.insert(slot, offset);
    }

    /// Removes the slots at the given (ascending, deduplicated) indices in
    /// a single left-compacting pass.
    pub fn remove_slots(&mut self, sorted_indices: &[usize]) {
        if sorted_indices.is_empty() {
            return;
        }
        let mut write = 0usize;
        let mut remove_iter = sorted_indices.iter().peekable();
        for read in 0..self.offsets.len() {
            if remove_iter.peek() == Some(&&read) {
                remove_iter.next();
                continue;
            }
            if write != read {
                self.offsets[write] = self.offsets[read];
                self.keys.swap(write, read);
            }
            write += 1;
        }
        self.offsets.truncate(write);
        self.keys.truncate(write);
    }

    /// Rewrites both files in full from the in-memory arrays.
    pub fn flush(&self) -> Result<(), IoError> {
        let mut idxr_bytes = Vec::with_capacity(IDXR_HEADER_LEN as usize + self.offsets.len() * 5);
        idxr_bytes.extend_from_slice(&(self.offsets.len() as u32).to_be_bytes());
        for &offset in &self.offsets {
            idxr_bytes.extend_from_slice(&offset.to_le_bytes()[..5]);
        }
        self.backend.write_all(&self.idxr_path, &idxr_bytes)?;

        let mut ctext_bytes = Vec::new();
        for key in &self.keys {
            ctext_bytes.extend_from_slice(codec::encode(key.len() as u32).as_bytes());
            ctext_bytes.extend_from_slice(key);
        }
        self.backend.write_all(&self.ctext_path, &ctext_bytes)?;
        Ok(())
    }
}

fn read_count(backend: &Arc<dyn IoBackend>, handle: &FileHandle) -> Result<u32, IoError> {
    if backend.file_size(handle)? < IDXR_HEADER_LEN {
        return Ok(0);
    }
    let mut header = [0u8; 4];
    backend.read_at(handle, 0, &mut header)?;
    Ok(u32::from_be_bytes(header))
}

fn read_offsets(backend: &Arc<dyn IoBackend>, handle: &FileHandle, count: u32) -> Result<Vec<u64>, IoError> {
    let mut offsets = Vec::with_capacity(count as usize);
    for i in 0..u64::from(count) {
        let mut buf = [0u8; 5];
        backend.read_at(handle, IDXR_HEADER_LEN + i * 5, &mut buf)?;
        let mut widened = [0u8; 8];
        widened[..5].copy_from_slice(&buf);
        offsets.push(u64::from_le_bytes(widened));
    }
    Ok(offsets)
}

fn read_keys(bytes: &[u8], count: u32) -> Vec<Box<[u8]>> {
    let mut keys = Vec::with_capacity(count as usize);
    let mut pos = 0usize;
    for _ in 0..count {
        let (len, next) = codec::decode_at(bytes, pos);
        let len = len as usize;
        keys.push(bytes[next..next + len].into());
        pos = next + len;
    }
    keys
}
