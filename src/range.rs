//! Merged range iteration across the overlay levels and the on-disk tree.
//!
//! A range cursor merges five key sources: pending writes and rename targets
//! at the current level, the same pair at the staged level, and a B-tree
//! cursor over the committed index. Each step emits the extreme remaining key
//! (lowest ascending, highest descending) and advances every source sitting
//! on it, so a key present in several sources appears once.
//!
//! Keys are filtered on the way out: tombstones, keys deleted at either
//! level, and keys renamed away at either level are skipped, and staged
//! entries shadowed by a current-level delete or rename are skipped too.
//!
//! The cursor holds the store lock for its whole lifetime; drop it before
//! mutating the store again.

use std::ops::Bound::{Excluded, Included, Unbounded};

use parking_lot::MutexGuard;

use crate::btree::TreeCursor;
use crate::db::Engine;
use crate::error::{Error, Result};
use crate::overlay::{Level, WriteKey};
use crate::types::OVERWRITE;

/// Iterator over the keys of one index within `[min, max]`.
pub struct RangeCursor<'a> {
    engine: MutexGuard<'a, Engine>,
    id: u8,
    min: Vec<u8>,
    max: Vec<u8>,
    descending: bool,
    cur_write: Option<Vec<u8>>,
    cur_rename: Option<Vec<u8>>,
    stg_write: Option<Vec<u8>>,
    stg_rename: Option<Vec<u8>>,
    tree: Option<TreeCursor>,
    tree_key: Option<Vec<u8>>,
    key: Option<Vec<u8>>,
}

/// Whether `level` hides `key` from lower levels.
fn shadows(level: &Level, id: u8, key: &[u8]) -> bool {
    level
        .changes(id)
        .map_or(false, |c| c.deletes.contains(key) || c.rename_old.contains_key(key))
}

impl<'a> RangeCursor<'a> {
    pub(crate) fn position(
        engine: MutexGuard<'a, Engine>,
        id: u8,
        min: Vec<u8>,
        max: Vec<u8>,
        descending: bool,
    ) -> Result<RangeCursor<'a>> {
        let mut cursor = RangeCursor {
            engine,
            id,
            min,
            max,
            descending,
            cur_write: None,
            cur_rename: None,
            stg_write: None,
            stg_rename: None,
            tree: None,
            tree_key: None,
            key: None,
        };
        cursor.cur_write = cursor.writes_candidate(false, None);
        cursor.cur_rename = cursor.renames_candidate(false, None);
        cursor.stg_write = cursor.writes_candidate(true, None);
        cursor.stg_rename = cursor.renames_candidate(true, None);
        cursor.seek_tree()?;
        cursor.settle_tree()?;
        cursor.recompute_key();
        Ok(cursor)
    }

    /// The key under the cursor, or `None` once exhausted.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Read the whole value at the cursor.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        match self.key.clone() {
            Some(key) => self.engine.read_value(self.id, &key),
            None => Ok(None),
        }
    }

    /// Length of the value at the cursor.
    pub fn value_length(&mut self) -> Result<Option<u32>> {
        match self.key.clone() {
            Some(key) => self.engine.value_length(self.id, &key),
            None => Ok(None),
        }
    }

    /// Step to the next key in range. Returns `false` once exhausted.
    pub fn advance(&mut self) -> Result<bool> {
        let emitted = match self.key.clone() {
            Some(k) => k,
            None => return Ok(false),
        };
        if self.cur_write.as_deref() == Some(&emitted[..]) {
            self.cur_write = self.writes_candidate(false, Some(&emitted));
        }
        if self.cur_rename.as_deref() == Some(&emitted[..]) {
            self.cur_rename = self.renames_candidate(false, Some(&emitted));
        }
        if self.stg_write.as_deref() == Some(&emitted[..]) {
            self.stg_write = self.writes_candidate(true, Some(&emitted));
        }
        if self.stg_rename.as_deref() == Some(&emitted[..]) {
            self.stg_rename = self.renames_candidate(true, Some(&emitted));
        }
        if self.tree_key.as_deref() == Some(&emitted[..]) {
            self.step_tree()?;
            self.settle_tree()?;
        }
        self.recompute_key();
        Ok(self.key.is_some())
    }

    // -- overlay candidates -------------------------------------------------

    /// Next distinct pending-write key in direction, within bounds, past
    /// `after` if given. Staged candidates shadowed by current are skipped.
    fn writes_candidate(&self, staged: bool, after: Option<&[u8]>) -> Option<Vec<u8>> {
        let (level, above) = if staged {
            (&self.engine.staged, Some(&self.engine.current))
        } else {
            (&self.engine.current, None)
        };
        let changes = level.changes(self.id)?;
        if self.descending {
            let end = match after {
                Some(k) => Excluded(WriteKey { key: k.to_vec(), offset: OVERWRITE }),
                None => Included(WriteKey { key: self.max.clone(), offset: 0 }),
            };
            for (wk, _) in changes.writes.range((Unbounded, end)).rev() {
                if wk.key < self.min {
                    return None;
                }
                if above.map_or(false, |lvl| shadows(lvl, self.id, &wk.key)) {
                    continue;
                }
                return Some(wk.key.clone());
            }
        } else {
            let start = match after {
                Some(k) => Excluded(WriteKey { key: k.to_vec(), offset: 0 }),
                None => Included(WriteKey { key: self.min.clone(), offset: OVERWRITE }),
            };
            for (wk, _) in changes.writes.range((start, Unbounded)) {
                if wk.key > self.max {
                    return None;
                }
                if above.map_or(false, |lvl| shadows(lvl, self.id, &wk.key)) {
                    continue;
                }
                return Some(wk.key.clone());
            }
        }
        None
    }

    /// Next pending rename-target key, with the same filtering.
    fn renames_candidate(&self, staged: bool, after: Option<&[u8]>) -> Option<Vec<u8>> {
        let (level, above) = if staged {
            (&self.engine.staged, Some(&self.engine.current))
        } else {
            (&self.engine.current, None)
        };
        let changes = level.changes(self.id)?;
        if self.descending {
            let end = match after {
                Some(k) => Excluded(k.to_vec()),
                None => Included(self.max.clone()),
            };
            for (key, _) in changes.rename_new.range((Unbounded, end)).rev() {
                if key.as_slice() < self.min.as_slice() {
                    return None;
                }
                if above.map_or(false, |lvl| shadows(lvl, self.id, key)) {
                    continue;
                }
                return Some(key.clone());
            }
        } else {
            let start = match after {
                Some(k) => Excluded(k.to_vec()),
                None => Included(self.min.clone()),
            };
            for (key, _) in changes.rename_new.range((start, Unbounded)) {
                if key.as_slice() > self.max.as_slice() {
                    return None;
                }
                if above.map_or(false, |lvl| shadows(lvl, self.id, key)) {
                    continue;
                }
                return Some(key.clone());
            }
        }
        None
    }

    // -- tree candidate -----------------------------------------------------

    fn seek_tree(&mut self) -> Result<()> {
        let engine = &mut *self.engine;
        let index = engine.indexes.get_mut(&self.id).ok_or(Error::UnknownIndex { id: self.id })?;
        let pager = &mut engine.pager;
        self.tree = if self.descending {
            TreeCursor::seek_last(index, pager, &self.max)?
        } else {
            TreeCursor::seek_first(index, pager, &self.min)?
        };
        Ok(())
    }

    fn step_tree(&mut self) -> Result<()> {
        let engine = &mut *self.engine;
        if let Some(cursor) = self.tree.as_mut() {
            let index =
                engine.indexes.get_mut(&self.id).ok_or(Error::UnknownIndex { id: self.id })?;
            let pager = &mut engine.pager;
            let stepped =
                if self.descending { cursor.prev(index, pager)? } else { cursor.next(index, pager)? };
            if !stepped {
                self.tree = None;
            }
        }
        Ok(())
    }

    /// Move the tree cursor forward past tombstones and shadowed keys, and
    /// refresh `tree_key`.
    fn settle_tree(&mut self) -> Result<()> {
        loop {
            let cursor = match self.tree.as_mut() {
                Some(c) => c,
                None => {
                    self.tree_key = None;
                    return Ok(());
                },
            };
            let engine = &mut *self.engine;
            let index =
                engine.indexes.get_mut(&self.id).ok_or(Error::UnknownIndex { id: self.id })?;
            let pager = &mut engine.pager;
            let el = cursor.element(index, pager)?;
            let out_of_range =
                if self.descending { el.key < self.min } else { el.key > self.max };
            if out_of_range {
                self.tree = None;
                self.tree_key = None;
                return Ok(());
            }
            let hidden = el.value.is_deleted()
                || shadows(&engine.current, self.id, &el.key)
                || shadows(&engine.staged, self.id, &el.key);
            if !hidden {
                self.tree_key = Some(el.key);
                return Ok(());
            }
            let stepped =
                if self.descending { cursor.prev(index, pager)? } else { cursor.next(index, pager)? };
            if !stepped {
                self.tree = None;
                self.tree_key = None;
                return Ok(());
            }
        }
    }

    fn recompute_key(&mut self) {
        let candidates = [
            self.cur_write.as_ref(),
            self.cur_rename.as_ref(),
            self.stg_write.as_ref(),
            self.stg_rename.as_ref(),
            self.tree_key.as_ref(),
        ];
        let mut best: Option<&Vec<u8>> = None;
        for candidate in candidates.into_iter().flatten() {
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let better = if self.descending {
                        candidate > current
                    } else {
                        candidate < current
                    };
                    Some(if better { candidate } else { current })
                },
            };
        }
        self.key = best.cloned();
    }
}
