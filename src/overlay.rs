//! In-memory change levels buffered ahead of the on-disk state.
//!
//! Mutations never touch disk directly. They accumulate in the *current*
//! level, move wholesale to the *staged* level on `stage`, and reach disk
//! only when the staged level commits. Each level keeps, per index:
//!
//! - pending value writes, keyed by `(key, offset)` with offsets compared in
//!   reverse so a whole-value write (offset [`OVERWRITE`]) sorts ahead of the
//!   partial writes for the same key
//! - pending deletes
//! - pending renames, kept in both directions for source and target lookups
//!
//! plus a level-local copy of the caller's extra-data block.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use crate::types::OVERWRITE;

/// Composite key for pending value writes.
///
/// Orders by key ascending, then offset *descending*, which keeps the
/// whole-value sentinel first among a key's entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WriteKey {
    pub(crate) key: Vec<u8>,
    pub(crate) offset: u32,
}

impl Ord for WriteKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| other.offset.cmp(&self.offset))
    }
}

impl PartialOrd for WriteKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending changes against one index within one level.
#[derive(Debug, Default)]
pub(crate) struct IndexChanges {
    /// Pending value writes in `(key asc, offset desc)` order.
    pub(crate) writes: BTreeMap<WriteKey, Vec<u8>>,
    /// Keys to delete.
    pub(crate) deletes: BTreeSet<Vec<u8>>,
    /// Renames, source to target.
    pub(crate) rename_old: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Renames, target to source.
    pub(crate) rename_new: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl IndexChanges {
    /// Range covering every pending write for `key`.
    pub(crate) fn key_range(key: &[u8]) -> RangeInclusive<WriteKey> {
        let first = WriteKey { key: key.to_vec(), offset: OVERWRITE };
        let last = WriteKey { key: key.to_vec(), offset: 0 };
        first..=last
    }

    /// Whether any write is pending for `key`.
    pub(crate) fn has_write(&self, key: &[u8]) -> bool {
        self.writes.range(Self::key_range(key)).next().is_some()
    }

    /// The pending whole-value write for `key`, if any.
    pub(crate) fn full_write(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.writes.get(&WriteKey { key: key.to_vec(), offset: OVERWRITE })
    }

    /// Drop every pending write for `key`, returning the freed byte count.
    pub(crate) fn purge_writes(&mut self, key: &[u8]) -> i64 {
        let doomed: Vec<WriteKey> =
            self.writes.range(Self::key_range(key)).map(|(k, _)| k.clone()).collect();
        let mut freed = 0i64;
        for wk in doomed {
            if let Some(data) = self.writes.remove(&wk) {
                freed += (data.len() + wk.key.len()) as i64;
            }
        }
        freed
    }

    /// Record a write, merging with pending writes for the same key.
    ///
    /// Returns the change in buffered byte footprint.
    pub(crate) fn record_write(&mut self, key: &[u8], offset: u32, data: Vec<u8>) -> i64 {
        self.deletes.remove(key);
        let full = WriteKey { key: key.to_vec(), offset: OVERWRITE };
        if let Some(existing) = self.writes.get_mut(&full) {
            // A whole-value write subsumes everything for this key.
            if offset == OVERWRITE {
                let delta = data.len() as i64 - existing.len() as i64;
                *existing = data;
                return delta;
            }
            let end = offset as usize + data.len();
            let before = existing.len();
            if existing.len() < end {
                existing.resize(end, 0);
            }
            existing[offset as usize..end].copy_from_slice(&data);
            return existing.len() as i64 - before as i64;
        }
        if offset == OVERWRITE {
            // Pending partial writes are obsolete once the whole value is
            // replaced.
            let freed = self.purge_writes(key);
            let added = (data.len() + key.len()) as i64;
            self.writes.insert(full, data);
            return added - freed;
        }
        let wk = WriteKey { key: key.to_vec(), offset };
        let added = (data.len() + key.len()) as i64;
        match self.writes.insert(wk, data) {
            Some(old) => added - (old.len() + key.len()) as i64,
            None => added,
        }
    }

    /// Move every pending write for `old` under `new`.
    pub(crate) fn rekey_writes(&mut self, old: &[u8], new: &[u8]) {
        let moved: Vec<(WriteKey, Vec<u8>)> = {
            let doomed: Vec<WriteKey> =
                self.writes.range(Self::key_range(old)).map(|(k, _)| k.clone()).collect();
            doomed
                .into_iter()
                .filter_map(|wk| self.writes.remove(&wk).map(|data| (wk, data)))
                .collect()
        };
        for (wk, data) in moved {
            self.writes.insert(WriteKey { key: new.to_vec(), offset: wk.offset }, data);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty()
            && self.deletes.is_empty()
            && self.rename_old.is_empty()
            && self.rename_new.is_empty()
    }
}

/// One overlay level: per-index changes plus the extra-data copy.
#[derive(Debug, Default)]
pub(crate) struct Level {
    /// Changes per index id.
    pub(crate) indexes: BTreeMap<u8, IndexChanges>,
    /// This level's view of the extra-data block.
    pub(crate) extra_data: Vec<u8>,
}

impl Level {
    pub(crate) fn new(extra_data: Vec<u8>) -> Level {
        Level { indexes: BTreeMap::new(), extra_data }
    }

    pub(crate) fn index(&mut self, id: u8) -> &mut IndexChanges {
        self.indexes.entry(id).or_default()
    }

    pub(crate) fn changes(&self, id: u8) -> Option<&IndexChanges> {
        self.indexes.get(&id)
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.indexes.values().any(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_key_orders_full_write_first() {
        let full = WriteKey { key: b"k".to_vec(), offset: OVERWRITE };
        let early = WriteKey { key: b"k".to_vec(), offset: 0 };
        let late = WriteKey { key: b"k".to_vec(), offset: 100 };
        assert!(full < late);
        assert!(late < early);
        let other = WriteKey { key: b"l".to_vec(), offset: OVERWRITE };
        assert!(early < other);
    }

    #[test]
    fn test_full_write_subsumes_partials() {
        let mut changes = IndexChanges::default();
        changes.record_write(b"k", 0, b"aa".to_vec());
        changes.record_write(b"k", 4, b"bb".to_vec());
        assert_eq!(changes.writes.len(), 2);

        changes.record_write(b"k", OVERWRITE, b"whole".to_vec());
        assert_eq!(changes.writes.len(), 1);
        assert_eq!(changes.full_write(b"k").unwrap(), b"whole");
    }

    #[test]
    fn test_partial_patches_pending_full_write() {
        let mut changes = IndexChanges::default();
        changes.record_write(b"k", OVERWRITE, b"abcdef".to_vec());
        changes.record_write(b"k", 2, b"XY".to_vec());
        assert_eq!(changes.full_write(b"k").unwrap(), b"abXYef");
        assert_eq!(changes.writes.len(), 1);
    }

    #[test]
    fn test_partial_replaces_same_offset() {
        let mut changes = IndexChanges::default();
        changes.record_write(b"k", 8, b"one".to_vec());
        changes.record_write(b"k", 8, b"two".to_vec());
        assert_eq!(changes.writes.len(), 1);
        let wk = WriteKey { key: b"k".to_vec(), offset: 8 };
        assert_eq!(changes.writes.get(&wk).unwrap(), b"two");
    }

    #[test]
    fn test_write_cancels_pending_delete() {
        let mut changes = IndexChanges::default();
        changes.deletes.insert(b"k".to_vec());
        changes.record_write(b"k", OVERWRITE, b"v".to_vec());
        assert!(changes.deletes.is_empty());
    }

    #[test]
    fn test_footprint_accounting_balances() {
        let mut changes = IndexChanges::default();
        let mut footprint = 0i64;
        footprint += changes.record_write(b"key1", 0, b"aaaa".to_vec());
        footprint += changes.record_write(b"key2", OVERWRITE, b"bbbbbb".to_vec());
        assert_eq!(footprint, (4 + 4 + 6 + 4) as i64);
        footprint += changes.purge_writes(b"key1");
        footprint += changes.purge_writes(b"key2");
        assert_eq!(footprint, 0);
    }

    #[test]
    fn test_rekey_moves_all_offsets() {
        let mut changes = IndexChanges::default();
        changes.record_write(b"old", 0, b"aa".to_vec());
        changes.record_write(b"old", 6, b"bb".to_vec());
        changes.record_write(b"zzz", 0, b"cc".to_vec());

        changes.rekey_writes(b"old", b"new");
        assert!(!changes.has_write(b"old"));
        assert!(changes.has_write(b"new"));
        assert!(changes.has_write(b"zzz"));
        let wk = WriteKey { key: b"new".to_vec(), offset: 6 };
        assert_eq!(changes.writes.get(&wk).unwrap(), b"bb");
    }
}
