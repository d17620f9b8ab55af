//! The public updatable-value-index API (C4): [`ValueIndex`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kimberlite_io::IoBackend;

use crate::cache::LookupCache;
use crate::config::IndexConfig;
use crate::directory::Directory;
use crate::error::{Result, VIndexError};
use crate::heap::Heap;
use crate::mutate::{self, to_absolute};

/// State guarded by the single-writer monitor: everything but the heap
/// file, whose own internal atomics make it safe to read and overwrite
/// concurrently with mutation elsewhere (see [`crate::heap::Heap`]).
struct Inner {
    directory: Directory,
    cache: LookupCache,
}

/// An updatable, on-disk index from textual keys to sorted sequences of
/// record ids.
///
/// Backed by three files sharing a path prefix: `<prefix>.basex` (the
/// heap of posting lists), `<prefix>r.basex` (the sorted offset array),
/// and `<prefix>l.basex` (the sorted key array). A single
/// [`std::sync::Mutex`] serializes `add`/`delete`/`replace`; `lookup`
/// takes the same lock only long enough to resolve a key to a heap
/// offset (or to consult the cache), then reads the heap file without
/// holding it.
pub struct ValueIndex {
    heap: Heap,
    inner: Mutex<Inner>,
    closed: AtomicBool,
    config: IndexConfig,
}

impl ValueIndex {
    /// Opens (creating if needed) the index rooted at `prefix`.
    pub fn open(backend: Arc<dyn IoBackend>, prefix: &Path, config: IndexConfig) -> Result<Self> {
        let heap = Heap::open(Arc::clone(&backend), &heap_path(prefix))?;
        let directory = Directory::open(Arc::clone(&backend), &idxr_path(prefix), &ctext_path(prefix))?;
        let header_size = heap.size()?;
        if header_size as usize != directory.len() {
            tracing::warn!(
                prefix = %prefix.display(),
                header_size,
                directory_len = directory.len(),
                "heap size header disagrees with directory slot count on open; repairing header"
            );
            heap.set_size(directory.len() as u32)?;
        }
        tracing::info!(prefix = %prefix.display(), keys = directory.len(), "opened value index");
        Ok(Self {
            heap,
            inner: Mutex::new(Inner {
                directory,
                cache: LookupCache::new(config.cache_capacity),
            }),
            closed: AtomicBool::new(false),
            config,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(VIndexError::IndexClosed)
        } else {
            Ok(())
        }
    }

    /// Looks up `key`, returning its sorted record ids, or `None` if the
    /// key is not present.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u32>>> {
        self.ensure_open()?;

        let offset = {
            let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = inner.cache.get(key) {
                Some(entry.heap_offset)
            } else {
                match inner.directory.binary_search(key) {
                    Ok(slot) => Some(inner.directory.offset_at(slot)),
                    Err(_) => None,
                }
            }
        };

        let Some(offset) = offset else {
            return Ok(None);
        };
        let deltas = self.heap.read_nums(offset)?;
        Ok(Some(to_absolute(&deltas)))
    }

    /// Number of distinct keys currently in the index.
    pub fn size(&self) -> Result<usize> {
        self.ensure_open()?;
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner.directory.len())
    }

    /// Bulk-inserts ids into the keys they belong to. See
    /// [`mutate::add`] for the full contract.
    pub fn add(&self, entries: &[(Vec<u8>, Vec<u32>)], should_stop: Option<&dyn Fn() -> bool>) -> Result<()> {
        self.ensure_open()?;
        let poll = if self.config.cooperative_interrupts {
            should_stop
        } else {
            None
        };
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        mutate::add(&mut inner.directory, &self.heap, &mut inner.cache, entries, poll)
    }

    /// Bulk-removes ids from the keys they belong to. See
    /// [`mutate::delete`] for the full contract.
    pub fn delete(&self, entries: &[(Vec<u8>, Vec<u32>)], should_stop: Option<&dyn Fn() -> bool>) -> Result<()> {
        self.ensure_open()?;
        let poll = if self.config.cooperative_interrupts {
            should_stop
        } else {
            None
        };
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        mutate::delete(&mut inner.directory, &self.heap, &mut inner.cache, entries, poll)
    }

    /// Moves a single record id from `old_key` to `new_key`. See
    /// [`mutate::replace`] for the full contract, including the
    /// intentional tolerance of a missing `old_key`/id pair.
    pub fn replace(&self, old_key: &[u8], new_key: &[u8], id: u32) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        mutate::replace(&mut inner.directory, &self.heap, &mut inner.cache, old_key, new_key, id)
    }

    /// Persists the directory to disk. Mutating operations already flush
    /// internally; this exists for callers that want to force a flush at
    /// a specific point (tests, orderly shutdown) without closing.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.directory.flush()?;
        Ok(())
    }

    /// Closes the index. Further operations return [`VIndexError::IndexClosed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.directory.flush()?;
        Ok(())
    }

    /// Ratio of heap bytes no longer reachable from any directory slot to
    /// total heap bytes in use. Advisory only — this index never
    /// compacts itself.
    #[must_use]
    pub fn fragmentation_ratio(&self) -> f64 {
        let size = self.heap.byte_len();
        if size == 0 {
            return 0.0;
        }
        self.heap.dead_bytes() as f64 / size as f64
    }

    /// Whether [`Self::fragmentation_ratio`] has crossed the configured
    /// advisory threshold.
    #[must_use]
    pub fn needs_rebuild(&self, config: &IndexConfig) -> bool {
        self.fragmentation_ratio() >= config.rebuild_dead_ratio
    }
}

impl Drop for ValueIndex {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(err) = inner.directory.flush() {
            tracing::error!(error = %err, "failed to flush directory while dropping value index");
        }
    }
}

fn heap_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, "")
}

fn idxr_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, "r")
}

fn ctext_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, "l")
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    name.push(".basex");
    prefix.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kimberlite_io::SyncBackend;

    fn open_index(dir: &Path, config: IndexConfig) -> ValueIndex {
        let backend: Arc<dyn IoBackend> = Arc::new(SyncBackend::new());
        ValueIndex::open(backend, &dir.join("value"), config).unwrap()
    }

    #[test]
    fn end_to_end_add_lookup_delete() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path(), IndexConfig::without_interrupts());

        index
            .add(&[(b"hello".to_vec(), vec![1, 2, 3]), (b"world".to_vec(), vec![4])], None)
            .unwrap();

        assert_eq!(index.lookup(b"hello").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(index.lookup(b"world").unwrap(), Some(vec![4]));
        assert_eq!(index.lookup(b"missing").unwrap(), None);
        assert_eq!(index.size().unwrap(), 2);

        index.delete(&[(b"hello".to_vec(), vec![2])], None).unwrap();
        assert_eq!(index.lookup(b"hello").unwrap(), Some(vec![1, 3]));

        index.replace(b"world", b"earth", 4).unwrap();
        assert_eq!(index.lookup(b"world").unwrap(), None);
        assert_eq!(index.lookup(b"earth").unwrap(), Some(vec![4]));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(dir.path(), IndexConfig::without_interrupts());
            index.add(&[(b"k".to_vec(), vec![1, 2])], None).unwrap();
            index.close().unwrap();
        }
        let index = open_index(dir.path(), IndexConfig::without_interrupts());
        assert_eq!(index.lookup(b"k").unwrap(), Some(vec![1, 2]));
    }

    #[test]
    fn operations_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path(), IndexConfig::without_interrupts());
        index.close().unwrap();
        let err = index.add(&[(b"k".to_vec(), vec![1])], None).unwrap_err();
        assert!(matches!(err, VIndexError::IndexClosed));
    }

    #[test]
    fn add_respects_cancellation_between_keys() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path(), IndexConfig::default());
        let should_stop: &dyn Fn() -> bool = &|| true;
        index
            .add(&[(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])], Some(should_stop))
            .unwrap();
        // the very first interrupt check fires before any key is processed
        assert_eq!(index.size().unwrap(), 0);
    }
}
