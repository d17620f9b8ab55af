//! The bulk `add`/`delete` algorithms and `replace`'s compound
//! delete-then-insert. Split out of [`crate::index`] because these carry
//! most of the format's invariants, the same way `kimberlite-storage`
//! keeps its densest logic in `pipeline.rs`/`compaction.rs` rather than in
//! `storage.rs` itself.

use crate::cache::{CacheEntry, LookupCache};
use crate::directory::Directory;
use crate::error::{Result, VIndexError};
use crate::heap::{Heap, MustAppend};

/// Converts a delta-encoded id list (first absolute, rest positive deltas
/// from the predecessor) into the absolute ids it represents.
pub(crate) fn to_absolute(deltas: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(deltas.len());
    let mut acc: u32 = 0;
    for (i, &d) in deltas.iter().enumerate() {
        acc = if i == 0 { d } else { acc + d };
        out.push(acc);
    }
    out
}

/// Converts an ascending absolute id list into its delta encoding.
fn to_deltas(absolute: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(absolute.len());
    let mut prev = 0u32;
    for (i, &v) in absolute.iter().enumerate() {
        out.push(if i == 0 { v } else { v - prev });
        prev = v;
    }
    out
}

/// Writes `deltas` to the posting list at `offset`, falling back to an
/// append-and-repoint when the new encoding no longer fits, and returns
/// the offset the data now lives at.
fn store_posting_list(heap: &Heap, offset: u64, deltas: &[u32]) -> Result<u64> {
    match heap.write_nums(offset, deltas)? {
        Ok(()) => Ok(offset),
        Err(MustAppend) => {
            let old_len = heap.encoded_len_at(offset)?;
            heap.mark_dead(old_len);
            tracing::warn!(offset, "posting list grew past its slot, falling back to append");
            Ok(heap.append_nums(deltas)?)
        }
    }
}

fn should_stop_now(should_stop: Option<&dyn Fn() -> bool>) -> bool {
    should_stop.is_some_and(|f| f())
}

/// Bulk-inserts ids into the keys they belong to, creating keys that do
/// not yet exist.
///
/// `entries` need not be pre-sorted; this function sorts by key itself.
/// Each key's id list must be ascending and, for keys that already exist
/// in the index, every id must be greater than that key's current
/// largest id — this operation only ever appends to a key's posting
/// list, it does not merge ids into the middle of one.
///
/// `should_stop` is polled between whole-key iterations (never in the
/// middle of a single key's posting-list update); when it returns `true`
/// the call returns `Ok(())` having applied every key processed so far.
pub fn add(
    directory: &mut Directory,
    heap: &Heap,
    cache: &mut LookupCache,
    entries: &[(Vec<u8>, Vec<u32>)],
    should_stop: Option<&dyn Fn() -> bool>,
) -> Result<()> {
    let mut sorted: Vec<&(Vec<u8>, Vec<u32>)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    // First pass: existing keys only get their posting list extended in
    // place, so the directory's slot count (and every other slot's index)
    // never moves during this pass. New keys are collected for the second
    // pass instead.
    let mut new_keys: Vec<(&[u8], &[u32])> = Vec::new();

    for (key, new_ids) in &sorted {
        if new_ids.is_empty() {
            continue;
        }
        if should_stop_now(should_stop) {
            return Ok(());
        }
        match directory.binary_search(key) {
            Ok(slot) => {
                let old_offset = directory.offset_at(slot);
                let old_deltas = heap.read_nums(old_offset)?;
                let old_absolute = to_absolute(&old_deltas);
                let last_old = *old_absolute.last().ok_or_else(|| VIndexError::CorruptInput {
                    reason: format!("key {key:?} has an empty posting list on disk"),
                })?;

                let mut suffix_deltas = to_deltas(new_ids);
                suffix_deltas[0] = new_ids[0] - last_old;

                let mut combined = old_deltas;
                combined.extend(suffix_deltas);

                let new_offset = store_posting_list(heap, old_offset, &combined)?;
                if new_offset != old_offset {
                    directory.set_offset(slot, new_offset);
                }
                cache.put(
                    key,
                    CacheEntry {
                        count: combined.len() as u32,
                        heap_offset: new_offset,
                    },
                );
            }
            Err(_) => new_keys.push((key.as_slice(), new_ids.as_slice())),
        }
    }

    // Second pass: insert brand-new keys largest-to-smallest. Inserting
    // the largest key first means every subsequent insertion's shift
    // touches only slots this batch has not inserted into yet, which
    // keeps the directory array monotone through the whole pass.
    new_keys.sort_by(|a, b| b.0.cmp(a.0));
    for (key, new_ids) in new_keys {
        if should_stop_now(should_stop) {
            return Ok(());
        }
        let deltas = to_deltas(new_ids);
        let offset = heap.append_nums(&deltas)?;
        let insertion_point = match directory.binary_search(key) {
            Err(insertion_point) => insertion_point,
            Ok(_) => {
                return Err(VIndexError::CorruptInput {
                    reason: format!(
                        "key {key:?} was absent from the directory during add's partition pass \
                         but is present now — duplicate key in the same batch, or prior corruption"
                    ),
                });
            }
        };
        directory.insert(insertion_point, key, offset);
        // Per this index's resolution of its cache-population question,
        // freshly inserted keys are not written into the lookup cache;
        // it warms on first `lookup`.
    }

    heap.set_size(directory.len() as u32)?;
    directory.flush()?;
    Ok(())
}

/// Result of removing `to_remove` from `absolute`, used by both bulk
/// `delete` and `replace`'s delete leg. The lockstep walk this performs
/// requires `to_remove` ascending to line up against `absolute` (itself
/// always ascending); callers need not pre-sort it themselves — a sorted
/// copy is made here, the same latitude `add`/`delete` already give callers
/// for the order of the *keys* in a batch.
fn remove_ids(key: &[u8], absolute: &[u32], to_remove: &[u32], tolerate_missing: bool) -> Result<Vec<u32>> {
    let mut to_remove = to_remove.to_vec();
    to_remove.sort_unstable();
    let mut survivors = Vec::with_capacity(absolute.len());
    let mut remove_iter = to_remove.iter().peekable();
    for &id in absolute {
        if remove_iter.peek() == Some(&&id) {
            remove_iter.next();
        } else {
            survivors.push(id);
        }
    }
    if let Some(&missing) = remove_iter.peek() {
        if tolerate_missing {
            tracing::debug!(?key, id = missing, "id not present under key, ignoring");
        } else {
            return Err(VIndexError::MissingId {
                key: key.to_vec(),
                id: u64::from(*missing),
            });
        }
    }
    Ok(survivors)
}

/// Bulk-removes ids from the keys they belong to.
///
/// Neither `entries` nor the id list under each key need be pre-sorted.
/// Every key named must already exist in the index — an unknown key is
/// fatal to the whole call (already-applied keys from earlier in this same
/// call are not rolled back, per this index's single-writer,
/// no-cross-key-atomicity design). An id named that is not actually
/// present under its key is likewise fatal here (see [`replace`] for the
/// one place that id is tolerated).
pub fn delete(
    directory: &mut Directory,
    heap: &Heap,
    cache: &mut LookupCache,
    entries: &[(Vec<u8>, Vec<u32>)],
    should_stop: Option<&dyn Fn() -> bool>,
) -> Result<()> {
    let mut sorted: Vec<&(Vec<u8>, Vec<u32>)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut empty_slots: Vec<usize> = Vec::new();

    for (key, to_remove) in sorted {
        if to_remove.is_empty() {
            continue;
        }
        if should_stop_now(should_stop) {
            break;
        }
        let slot = directory
            .binary_search(key)
            .map_err(|_| VIndexError::MissingKey { key: key.clone() })?;

        let offset = directory.offset_at(slot);
        let deltas = heap.read_nums(offset)?;
        let absolute = to_absolute(&deltas);
        let survivors = remove_ids(key, &absolute, to_remove, false)?;

        if survivors.is_empty() {
            empty_slots.push(slot);
            cache.evict(key);
        } else {
            let new_deltas = to_deltas(&survivors);
            let new_offset = store_posting_list(heap, offset, &new_deltas)?;
            if new_offset != offset {
                directory.set_offset(slot, new_offset);
            }
            cache.put(
                key,
                CacheEntry {
                    count: survivors.len() as u32,
                    heap_offset: new_offset,
                },
            );
        }
    }

    empty_slots.sort_unstable();
    empty_slots.dedup();
    directory.remove_slots(&empty_slots);
    heap.set_size(directory.len() as u32)?;
    directory.flush()?;
    Ok(())
}

/// Removes `id` from `old_key` (tolerating its absence, whether because
/// `old_key` itself is unknown or because `id` was not under it — this
/// laxity is deliberate, not an oversight: `replace` is meant to succeed
/// at planting `id` under `new_key` even when the caller's bookkeeping of
/// where it used to live was stale) and inserts it under `new_key`.
pub fn replace(
    directory: &mut Directory,
    heap: &Heap,
    cache: &mut LookupCache,
    old_key: &[u8],
    new_key: &[u8],
    id: u32,
) -> Result<()> {
    cache.evict(old_key);

    if let Ok(slot) = directory.binary_search(old_key) {
        let offset = directory.offset_at(slot);
        let deltas = heap.read_nums(offset)?;
        let absolute = to_absolute(&deltas);
        let survivors = remove_ids(old_key, &absolute, &[id], true)?;

        if survivors.is_empty() {
            directory.remove_slots(&[slot]);
        } else if survivors.len() != absolute.len() {
            let new_deltas = to_deltas(&survivors);
            let new_offset = store_posting_list(heap, offset, &new_deltas)?;
            if new_offset != offset {
                directory.set_offset(slot, new_offset);
            }
        }
    }

    match directory.binary_search(new_key) {
        Ok(slot) => {
            let offset = directory.offset_at(slot);
            let deltas = heap.read_nums(offset)?;
            let mut absolute = to_absolute(&deltas);
            let insertion_point = absolute.partition_point(|&existing| existing < id);
            if absolute.get(insertion_point) != Some(&id) {
                absolute.insert(insertion_point, id);
            }
            let new_deltas = to_deltas(&absolute);
            let new_offset = store_posting_list(heap, offset, &new_deltas)?;
            if new_offset != offset {
                directory.set_offset(slot, new_offset);
            }
            cache.put(
                new_key,
                CacheEntry {
                    count: absolute.len() as u32,
                    heap_offset: new_offset,
                },
            );
        }
        Err(insertion_point) => {
            let offset = heap.append_nums(&[id])?;
            directory.insert(insertion_point, new_key, offset);
            // not cached, same rationale as add()'s new-key path.
        }
    }

    heap.set_size(directory.len() as u32)?;
    directory.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use kimberlite_io::{IoBackend, SyncBackend};
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        directory: Directory,
        heap: Heap,
        cache: LookupCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn IoBackend> = Arc::new(SyncBackend::new());
        let heap = Heap::open(Arc::clone(&backend), &dir.path().join("v.basex")).unwrap();
        let directory = Directory::open(
            Arc::clone(&backend),
            &dir.path().join("vr.basex"),
            &dir.path().join("vl.basex"),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            directory,
            heap,
            cache: LookupCache::new(16),
        }
    }

    fn lookup(f: &Fixture, key: &[u8]) -> Option<Vec<u32>> {
        let slot = f.directory.binary_search(key).ok()?;
        let deltas = f.heap.read_nums(f.directory.offset_at(slot)).unwrap();
        Some(to_absolute(&deltas))
    }

    #[test]
    fn add_creates_new_keys_sorted() {
        let mut f = fixture();
        add(
            &mut f.directory,
            &f.heap,
            &mut f.cache,
            &[
                (b"banana".to_vec(), vec![5]),
                (b"apple".to_vec(), vec![1, 2]),
            ],
            None,
        )
        .unwrap();

        assert_eq!(lookup(&f, b"apple"), Some(vec![1, 2]));
        assert_eq!(lookup(&f, b"banana"), Some(vec![5]));
        assert_eq!(f.directory.binary_search(b"apple"), Ok(0));
        assert_eq!(f.directory.binary_search(b"banana"), Ok(1));
    }

    #[test]
    fn add_appends_to_existing_key() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![1, 3])], None).unwrap();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![9])], None).unwrap();
        assert_eq!(lookup(&f, b"k"), Some(vec![1, 3, 9]));
        assert_eq!(f.cache.get(b"k").unwrap().count, 3);
    }

    #[test]
    fn add_does_not_populate_cache_for_new_keys() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![1])], None).unwrap();
        assert!(f.cache.get(b"k").is_none());
    }

    #[test]
    fn delete_removes_ids_and_keeps_survivors() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![1, 2, 3])], None).unwrap();
        delete(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![2])], None).unwrap();
        assert_eq!(lookup(&f, b"k"), Some(vec![1, 3]));
    }

    #[test]
    fn delete_accepts_unsorted_id_list_for_a_key() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![1, 2, 3, 4])], None).unwrap();
        delete(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![4, 1])], None).unwrap();
        assert_eq!(lookup(&f, b"k"), Some(vec![2, 3]));
    }

    #[test]
    fn delete_removes_slot_when_key_becomes_empty() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![1])], None).unwrap();
        delete(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![1])], None).unwrap();
        assert_eq!(f.directory.len(), 0);
        assert!(f.cache.get(b"k").is_none());
    }

    #[test]
    fn delete_missing_key_is_fatal() {
        let mut f = fixture();
        let err = delete(&mut f.directory, &f.heap, &mut f.cache, &[(b"nope".to_vec(), vec![1])], None).unwrap_err();
        assert!(matches!(err, VIndexError::MissingKey { .. }));
    }

    #[test]
    fn delete_missing_id_is_fatal() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![1])], None).unwrap();
        let err = delete(&mut f.directory, &f.heap, &mut f.cache, &[(b"k".to_vec(), vec![99])], None).unwrap_err();
        assert!(matches!(err, VIndexError::MissingId { .. }));
    }

    #[test]
    fn replace_moves_id_between_keys() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"old".to_vec(), vec![7])], None).unwrap();
        replace(&mut f.directory, &f.heap, &mut f.cache, b"old", b"new", 7).unwrap();
        assert_eq!(lookup(&f, b"old"), None);
        assert_eq!(lookup(&f, b"new"), Some(vec![7]));
    }

    #[test]
    fn replace_tolerates_missing_old_key() {
        let mut f = fixture();
        let result = replace(&mut f.directory, &f.heap, &mut f.cache, b"ghost", b"new", 1);
        assert!(result.is_ok());
        assert_eq!(lookup(&f, b"new"), Some(vec![1]));
    }

    #[test]
    fn replace_tolerates_missing_id_under_existing_old_key() {
        let mut f = fixture();
        add(&mut f.directory, &f.heap, &mut f.cache, &[(b"old".to_vec(), vec![1, 2])], None).unwrap();
        let result = replace(&mut f.directory, &f.heap, &mut f.cache, b"old", b"new", 99);
        assert!(result.is_ok());
        assert_eq!(lookup(&f, b"old"), Some(vec![1, 2]));
        assert_eq!(lookup(&f, b"new"), Some(vec![99]));
    }
}
