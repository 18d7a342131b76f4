//! The store engine and its public API.
//!
//! A [`Store`] is a single-writer embedded key/value store: fixed-size keys
//! per index, arbitrary byte values, several independent B-tree indexes over
//! one shared value heap. All mutations buffer in the in-memory overlay
//! (see [`crate::overlay`]) and reach disk only on commit, under a pre-image
//! journal that makes every commit atomic across process crashes.
//!
//! Typical lifecycle:
//!
//! ```no_run
//! use chainstore::{Store, StoreConfig};
//!
//! let store = Store::open("/var/lib/node/db", StoreConfig::default())?;
//! let headers = store.load_index(0, 32, 1 << 20)?;
//! store.write(headers, &[0u8; 32], b"block header bytes")?;
//! store.stage()?;
//! store.commit()?;
//! # Ok::<(), chainstore::Error>(())
//! ```
//!
//! One `parking_lot::Mutex` guards the whole engine; the handle is `Sync` and
//! can be shared across threads, with writes serialized by the lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::btree::{Element, Index};
use crate::error::{Error, Result};
use crate::free_list::FreeList;
use crate::journal::{self, JournalHeader};
use crate::overlay::{IndexChanges, Level};
use crate::pager::{FileKey, Pager};
use crate::range::RangeCursor;
use crate::types::{IndexId, ValueRef, OVERWRITE};

/// Size of the `val_0.dat` header preceding the extra-data block.
const DATA_HEADER_SIZE: u32 = 6;

/// Tuning knobs for a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Size of the caller-owned extra-data block kept in `val_0.dat`.
    pub extra_data_size: u32,
    /// Staged footprint in bytes above which `stage` commits immediately.
    pub cache_limit: usize,
    /// Maximum age of the last commit before `stage` commits again.
    pub commit_gap: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            extra_data_size: 0,
            cache_limit: 10 << 20,
            commit_gap: Duration::from_secs(60),
        }
    }
}

/// Which overlay level an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Current,
    Staged,
}

/// An open store. Cheap to share behind an `Arc`; all methods lock
/// internally.
pub struct Store {
    inner: Mutex<Engine>,
}

impl Store {
    /// Open (or create) a store in `dir`, running crash recovery first.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created, a store file is corrupted,
    /// or an interrupted commit cannot be rolled back.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Store> {
        Ok(Store { inner: Mutex::new(Engine::open(dir.as_ref(), config)?) })
    }

    /// Load (or create) the index with on-disk id `id` and fixed key size
    /// `key_size`, caching nodes up to `cache_limit` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the id is already loaded or the index file is corrupted.
    pub fn load_index(&self, id: u8, key_size: u8, cache_limit: usize) -> Result<IndexId> {
        self.inner.lock().load_index(id, key_size, cache_limit)
    }

    /// Queue a whole-value write for `key`.
    pub fn write(&self, index: IndexId, key: &[u8], value: &[u8]) -> Result<()> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, key)?;
        engine.write_value(Target::Current, index.0, key, OVERWRITE, value.to_vec());
        Ok(())
    }

    /// Queue a write of `value` into `key`'s value at byte `offset`.
    pub fn write_at(&self, index: IndexId, key: &[u8], offset: u32, value: &[u8]) -> Result<()> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, key)?;
        engine.write_value(Target::Current, index.0, key, offset, value.to_vec());
        Ok(())
    }

    /// Read the whole value for `key`, through the overlay levels.
    pub fn read(&self, index: IndexId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, key)?;
        engine.read_value(index.0, key)
    }

    /// Read `len` bytes of `key`'s value starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfRange`] when the requested range exceeds the
    /// value's length.
    pub fn read_at(&self, index: IndexId, key: &[u8], offset: u32, len: u32) -> Result<Option<Vec<u8>>> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, key)?;
        let value = match engine.read_value(index.0, key)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let end = offset as usize + len as usize;
        if end > value.len() {
            return Err(Error::OutOfRange { offset, len, value_len: value.len() as u32 });
        }
        Ok(Some(value[offset as usize..end].to_vec()))
    }

    /// Length of `key`'s value, or `None` if the key does not exist.
    pub fn value_length(&self, index: IndexId, key: &[u8]) -> Result<Option<u32>> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, key)?;
        engine.value_length(index.0, key)
    }

    /// Queue a delete of `key`. A no-op when the key does not exist.
    pub fn remove(&self, index: IndexId, key: &[u8]) -> Result<()> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, key)?;
        engine.remove_value(Target::Current, index.0, key)
    }

    /// Queue a rename of `old` to `new` without copying value bytes.
    pub fn rename(&self, index: IndexId, old: &[u8], new: &[u8]) -> Result<()> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, old)?;
        engine.check_key(index.0, new)?;
        engine.change_key(Target::Current, index.0, old, new)
    }

    /// Copy of the extra-data block as the current level sees it.
    pub fn extra_data(&self) -> Vec<u8> {
        self.inner.lock().current.extra_data.clone()
    }

    /// Write into the extra-data block at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfRange`] when the write exceeds the block.
    pub fn write_extra_data(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.inner.lock().write_extra_data(offset, data)
    }

    /// Move the current level into the staged level, committing if the
    /// staged footprint or commit age crossed their thresholds.
    pub fn stage(&self) -> Result<()> {
        self.inner.lock().stage()
    }

    /// Discard the current level, restoring its extra data from staged.
    pub fn revert(&self) {
        self.inner.lock().revert();
    }

    /// Force the staged level to disk now.
    pub fn commit(&self) -> Result<()> {
        self.inner.lock().commit()
    }

    /// Iterate keys of `index` within `[min, max]`.
    ///
    /// The cursor holds the store lock until dropped.
    pub fn range(
        &self,
        index: IndexId,
        min: &[u8],
        max: &[u8],
        descending: bool,
    ) -> Result<RangeCursor<'_>> {
        let mut engine = self.inner.lock();
        engine.check_key(index.0, min)?;
        engine.check_key(index.0, max)?;
        RangeCursor::position(engine, index.0, min.to_vec(), max.to_vec(), descending)
    }

    /// Close the store, committing staged changes first.
    ///
    /// Changes still in the current level are discarded, matching `revert`.
    pub fn close(self) -> Result<()> {
        let mut engine = self.inner.into_inner();
        if engine.has_staged {
            engine.commit()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// All store state, guarded by the `Store` mutex.
pub(crate) struct Engine {
    pub(crate) pager: Pager,
    pub(crate) free_list: FreeList,
    pub(crate) indexes: BTreeMap<u8, Index>,
    pub(crate) current: Level,
    pub(crate) staged: Level,
    /// Extra data as currently on disk, diffed against at commit.
    disk_extra: Vec<u8>,
    /// Value heap append position.
    last_file: u16,
    last_size: u32,
    extra_data_size: u32,
    cache_limit: usize,
    commit_gap: Duration,
    staged_size: i64,
    has_staged: bool,
    last_commit: Instant,
    /// Set when a commit fails mid-apply; cleared only by reopening.
    poisoned: bool,
}

impl Engine {
    fn open(dir: &Path, config: StoreConfig) -> Result<Engine> {
        fs::create_dir_all(dir)?;
        journal::recover(dir)?;
        tracing::debug!(dir = %dir.display(), "opening store");

        let mut pager = Pager::new(dir.to_path_buf());
        let data0 = FileKey::Data(0);
        let (last_file, last_size, disk_extra);
        if pager.file_len(data0)? == 0 {
            last_file = 0;
            last_size = DATA_HEADER_SIZE + config.extra_data_size;
            let mut header = [0u8; DATA_HEADER_SIZE as usize];
            LittleEndian::write_u16(&mut header[0..2], last_file);
            LittleEndian::write_u32(&mut header[2..6], last_size);
            pager.append(data0, &header)?;
            pager.append_zeros(data0, config.extra_data_size as usize)?;
            pager.sync(data0)?;
            pager.sync_store_dir()?;
            disk_extra = vec![0u8; config.extra_data_size as usize];
        } else {
            let mut header = [0u8; DATA_HEADER_SIZE as usize];
            pager.read(data0, 0, &mut header)?;
            last_file = LittleEndian::read_u16(&header[0..2]);
            last_size = LittleEndian::read_u32(&header[2..6]);
            let mut extra = vec![0u8; config.extra_data_size as usize];
            pager.read(data0, DATA_HEADER_SIZE, &mut extra)?;
            disk_extra = extra;
        }
        let free_list = FreeList::load(&mut pager)?;

        Ok(Engine {
            pager,
            free_list,
            indexes: BTreeMap::new(),
            current: Level::new(disk_extra.clone()),
            staged: Level::new(disk_extra.clone()),
            disk_extra,
            last_file,
            last_size,
            extra_data_size: config.extra_data_size,
            cache_limit: config.cache_limit,
            commit_gap: config.commit_gap,
            staged_size: 0,
            has_staged: false,
            last_commit: Instant::now(),
            poisoned: false,
        })
    }

    /// Reject every operation once a failed commit left memory and disk out
    /// of step.
    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    fn load_index(&mut self, id: u8, key_size: u8, cache_limit: usize) -> Result<IndexId> {
        self.check_usable()?;
        if self.indexes.contains_key(&id) {
            return Err(Error::IndexAlreadyLoaded { id });
        }
        let index = Index::load(&mut self.pager, id, key_size, cache_limit)?;
        self.indexes.insert(id, index);
        Ok(IndexId(id))
    }

    pub(crate) fn check_key(&self, id: u8, key: &[u8]) -> Result<()> {
        self.check_usable()?;
        let index = self.indexes.get(&id).ok_or(Error::UnknownIndex { id })?;
        if key.len() != index.key_size() as usize {
            return Err(Error::KeySizeMismatch { expected: index.key_size(), actual: key.len() });
        }
        Ok(())
    }

    fn level_mut(&mut self, target: Target) -> &mut Level {
        match target {
            Target::Current => &mut self.current,
            Target::Staged => &mut self.staged,
        }
    }

    /// Look `key` up directly in the on-disk index.
    pub(crate) fn disk_find(&mut self, id: u8, key: &[u8]) -> Result<Option<Element>> {
        let Engine { ref mut indexes, ref mut pager, .. } = *self;
        let index = indexes.get_mut(&id).ok_or(Error::UnknownIndex { id })?;
        index.find(pager, key)
    }

    /// Whether `key` exists in any level below `target`.
    fn exists_below(&mut self, target: Target, id: u8, key: &[u8]) -> Result<bool> {
        if target == Target::Current {
            if let Some(changes) = self.staged.changes(id) {
                if changes.deletes.contains(key) {
                    return Ok(false);
                }
                if changes.has_write(key) || changes.rename_new.contains_key(key) {
                    return Ok(true);
                }
                if changes.rename_old.contains_key(key) {
                    return Ok(false);
                }
            }
        }
        Ok(matches!(self.disk_find(id, key)?, Some(el) if !el.value.is_deleted()))
    }

    // -- overlay mutations --------------------------------------------------

    fn write_value(&mut self, target: Target, id: u8, key: &[u8], offset: u32, data: Vec<u8>) {
        let delta = self.level_mut(target).index(id).record_write(key, offset, data);
        if target == Target::Staged {
            self.staged_size += delta;
        }
    }

    fn remove_value(&mut self, target: Target, id: u8, key: &[u8]) -> Result<()> {
        let changes = self.level_mut(target).index(id);
        let freed = changes.purge_writes(key);
        // A key renamed away at this level no longer exists under its old
        // name; the rename itself tombstones the old slot at commit.
        let renamed_away = changes.rename_old.contains_key(key);
        // A delete of a rename's target deletes the source key instead.
        let rename_source = changes.rename_new.remove(key);
        if let Some(source) = rename_source {
            changes.rename_old.remove(&source);
            changes.deletes.insert(source);
        } else if !renamed_away && self.exists_below(target, id, key)? {
            self.level_mut(target).index(id).deletes.insert(key.to_vec());
        }
        if target == Target::Staged {
            self.staged_size -= freed;
        }
        Ok(())
    }

    fn change_key(&mut self, target: Target, id: u8, old: &[u8], new: &[u8]) -> Result<()> {
        let changes = self.level_mut(target).index(id);
        // If `old` is itself the target of a pending rename, redirect that
        // rename instead of chaining a second one.
        if let Some(source) = changes.rename_new.remove(old) {
            changes.rename_old.insert(source.clone(), new.to_vec());
            changes.rename_new.insert(new.to_vec(), source);
        } else if self.exists_below(target, id, old)? {
            let changes = self.level_mut(target).index(id);
            changes.rename_old.insert(old.to_vec(), new.to_vec());
            changes.rename_new.insert(new.to_vec(), old.to_vec());
        }
        let changes = self.level_mut(target).index(id);
        changes.rekey_writes(old, new);
        changes.deletes.remove(new);
        Ok(())
    }

    fn write_extra_data(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let end = offset as usize + data.len();
        if end > self.extra_data_size as usize {
            return Err(Error::OutOfRange {
                offset,
                len: data.len() as u32,
                value_len: self.extra_data_size,
            });
        }
        self.current.extra_data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    pub(crate) fn value_length(&mut self, id: u8, key: &[u8]) -> Result<Option<u32>> {
        let mut key = key.to_vec();
        for level in [&self.current, &self.staged] {
            if let Some(changes) = level.changes(id) {
                if changes.deletes.contains(&key) {
                    return Ok(None);
                }
                if let Some(data) = changes.full_write(&key) {
                    return Ok(Some(data.len() as u32));
                }
                if let Some(source) = changes.rename_new.get(&key) {
                    key = source.clone();
                }
            }
        }
        match self.disk_find(id, &key)? {
            Some(el) if !el.value.is_deleted() => Ok(Some(el.value.len)),
            _ => Ok(None),
        }
    }

    /// Read the whole value for `key` through the overlay.
    pub(crate) fn read_value(&mut self, id: u8, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.compose_value(id, key, 0)
    }

    /// Compose `key`'s value as seen from overlay depth `depth`
    /// (0 = current, 1 = staged, 2 = disk).
    fn compose_value(&mut self, id: u8, key: &[u8], depth: usize) -> Result<Option<Vec<u8>>> {
        if depth == 2 {
            let el = match self.disk_find(id, key)? {
                Some(el) if !el.value.is_deleted() => el,
                _ => return Ok(None),
            };
            let mut buf = vec![0u8; el.value.len as usize];
            self.pager.read(FileKey::Data(el.value.file), el.value.pos, &mut buf)?;
            return Ok(Some(buf));
        }
        let level = if depth == 0 { &self.current } else { &self.staged };
        let (full, lower_key, partials) = match level.changes(id) {
            Some(changes) => {
                if changes.deletes.contains(key) {
                    return Ok(None);
                }
                let full = changes.full_write(key).cloned();
                let lower_key = changes
                    .rename_new
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| key.to_vec());
                let partials: Vec<(u32, Vec<u8>)> = changes
                    .writes
                    .range(IndexChanges::key_range(key))
                    .filter(|(wk, _)| wk.offset != OVERWRITE)
                    .map(|(wk, data)| (wk.offset, data.clone()))
                    .collect();
                (full, lower_key, partials)
            },
            None => (None, key.to_vec(), Vec::new()),
        };
        let base = match full {
            Some(data) => Some(data),
            None => self.compose_value(id, &lower_key, depth + 1)?,
        };
        if base.is_none() && partials.is_empty() {
            return Ok(None);
        }
        let mut buf = base.unwrap_or_default();
        for (offset, data) in partials {
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(&data);
        }
        Ok(Some(buf))
    }

    // -- staging ------------------------------------------------------------

    fn stage(&mut self) -> Result<()> {
        self.check_usable()?;
        let current = std::mem::replace(&mut self.current, Level::default());
        for (id, changes) in &current.indexes {
            // Renames first so writes and deletes land under final names.
            for (old, new) in &changes.rename_old {
                self.change_key(Target::Staged, *id, old, new)?;
            }
            for (wk, data) in &changes.writes {
                self.write_value(Target::Staged, *id, &wk.key, wk.offset, data.clone());
            }
            for key in &changes.deletes {
                self.remove_value(Target::Staged, *id, key)?;
            }
        }
        self.staged.extra_data = current.extra_data.clone();
        self.current = Level::new(current.extra_data);
        self.has_staged = true;

        if self.staged_size > self.cache_limit as i64 || self.last_commit.elapsed() > self.commit_gap {
            self.commit()?;
        }
        Ok(())
    }

    fn revert(&mut self) {
        self.current = Level::new(self.staged.extra_data.clone());
    }

    // -- commit -------------------------------------------------------------

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.check_usable()?;
        let staged = std::mem::replace(&mut self.staged, Level::default());
        match self.apply_commit(&staged) {
            Ok(()) => {
                self.staged = Level::new(staged.extra_data);
                self.staged_size = 0;
                self.has_staged = false;
                self.last_commit = Instant::now();
                Ok(())
            },
            Err(err) => {
                // Memory and disk have diverged; the journal is still active
                // and the next open rolls the partial commit back.
                self.poisoned = true;
                Err(err)
            },
        }
    }

    fn apply_commit(&mut self, staged: &Level) -> Result<()> {
        let prev_last_file = self.last_file;
        let prev_last_size = self.last_size;

        let mut header_indexes = Vec::with_capacity(staged.indexes.len());
        for id in staged.indexes.keys() {
            let index = self.indexes.get(id).ok_or(Error::UnknownIndex { id: *id })?;
            let (file, size) = index.header_state();
            header_indexes.push((*id, file, size));
        }
        let header = JournalHeader {
            free_list_len: self.pager.file_len(FileKey::FreeList)? as u32,
            data_last_file: prev_last_file,
            data_last_size: prev_last_size,
            indexes: header_indexes,
        };
        tracing::debug!(indexes = staged.indexes.len(), "committing staged changes");
        self.pager.begin_journal(&header.encode())?;

        for (id, changes) in &staged.indexes {
            self.commit_index(*id, changes)?;
        }

        // Value heap header, free-list count, extra data.
        if self.last_file != prev_last_file || self.last_size != prev_last_size {
            let mut buf = [0u8; DATA_HEADER_SIZE as usize];
            LittleEndian::write_u16(&mut buf[0..2], self.last_file);
            LittleEndian::write_u32(&mut buf[2..6], self.last_size);
            self.pager.overwrite(FileKey::Data(0), 0, &buf)?;
        }
        self.free_list.flush_count(&mut self.pager)?;
        let mut i = 0;
        while i < staged.extra_data.len() {
            if staged.extra_data[i] == self.disk_extra[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < staged.extra_data.len() && staged.extra_data[i] != self.disk_extra[i] {
                i += 1;
            }
            self.pager.overwrite(
                FileKey::Data(0),
                DATA_HEADER_SIZE + start as u32,
                &staged.extra_data[start..i],
            )?;
        }
        self.disk_extra = staged.extra_data.clone();

        // Durability order: data, then journal, then directory, then the
        // flag flip that makes the commit final.
        self.pager.sync_all()?;
        self.pager.sync_journal()?;
        self.pager.sync_store_dir()?;
        self.pager.end_journal()?;
        Ok(())
    }

    /// Apply one index's staged changes: renames, then writes, then deletes.
    fn commit_index(&mut self, id: u8, changes: &IndexChanges) -> Result<()> {
        let Engine {
            ref mut pager,
            ref mut free_list,
            ref mut indexes,
            ref mut last_file,
            ref mut last_size,
            ..
        } = *self;
        let index = indexes.get_mut(&id).ok_or(Error::UnknownIndex { id })?;

        for (old, new) in &changes.rename_old {
            let path = index.find_with_parents(pager, old)?;
            if !path.found || path.node.elements[path.idx].value.is_deleted() {
                return Err(Error::KeyNotFound);
            }
            let moved = path.node.elements[path.idx].value;
            index.tombstone(pager, path.loc, path.idx)?;

            let new_path = index.find_with_parents(pager, new)?;
            if new_path.found {
                let existing = new_path.node.elements[new_path.idx].value;
                if !existing.is_deleted() {
                    free_list.add(pager, existing.file, existing.pos, existing.len)?;
                }
                index.set_element_value(pager, new_path.loc, new_path.idx, moved)?;
            } else {
                index.insert(pager, new_path, Element { value: moved, key: new.clone() })?;
            }
        }

        for (wk, data) in &changes.writes {
            let full = wk.offset == OVERWRITE;
            let write_len = data.len() as u32;
            let path = index.find_with_parents(pager, &wk.key)?;
            let existing = path.found.then(|| path.node.elements[path.idx].value);

            let fits_in_place = match existing {
                Some(el) if !el.is_deleted() => {
                    let end = if full { write_len } else { wk.offset + write_len };
                    el.len >= end
                },
                _ => false,
            };

            if let (true, Some(el)) = (fits_in_place, existing) {
                let at = el.pos + if full { 0 } else { wk.offset };
                pager.overwrite(FileKey::Data(el.file), at, data)?;
                if full && write_len < el.len {
                    // Shrinking overwrite: the tail becomes free space.
                    free_list.add(pager, el.file, el.pos + write_len, el.len - write_len)?;
                    index.set_element_value(
                        pager,
                        path.loc,
                        path.idx,
                        ValueRef { file: el.file, pos: el.pos, len: write_len },
                    )?;
                }
                continue;
            }

            if let Some(el) = existing {
                if !el.is_deleted() {
                    free_list.add(pager, el.file, el.pos, el.len)?;
                }
            }
            let (file, pos, appended) =
                alloc_value(pager, free_list, last_file, last_size, write_len)?;
            if appended {
                pager.append(FileKey::Data(file), data)?;
            } else {
                pager.overwrite(FileKey::Data(file), pos, data)?;
            }
            let value = ValueRef { file, pos, len: write_len };
            if path.found {
                index.set_element_value(pager, path.loc, path.idx, value)?;
            } else {
                index.insert(pager, path, Element { value, key: wk.key.clone() })?;
            }
        }

        for key in &changes.deletes {
            let path = index.find_with_parents(pager, key)?;
            if !path.found || path.node.elements[path.idx].value.is_deleted() {
                return Err(Error::KeyNotFound);
            }
            let el = path.node.elements[path.idx].value;
            free_list.add(pager, el.file, el.pos, el.len)?;
            index.tombstone(pager, path.loc, path.idx)?;
        }

        index.flush_header(pager)?;
        Ok(())
    }
}

/// Place `len` bytes in the value heap: largest free section first, then the
/// append position, rolling to a new file when the offset would overflow.
fn alloc_value(
    pager: &mut Pager,
    free_list: &mut FreeList,
    last_file: &mut u16,
    last_size: &mut u32,
    len: u32,
) -> Result<(u16, u32, bool)> {
    if len > 0 {
        if let Some((file, pos)) = free_list.take(pager, len)? {
            return Ok((file, pos, false));
        }
    }
    if *last_size > u32::MAX - len {
        *last_file += 1;
        *last_size = 0;
    }
    let pos = *last_size;
    *last_size += len;
    Ok((*last_file, pos, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> (Store, IndexId) {
        let store = Store::open(dir, StoreConfig::default()).unwrap();
        let index = store.load_index(0, 4, 1 << 20).unwrap();
        (store, index)
    }

    #[test]
    fn test_write_read_through_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", b"hello").unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"hello");
        assert_eq!(store.value_length(index, b"key1").unwrap(), Some(5));
        assert_eq!(store.read(index, b"key2").unwrap(), None);
    }

    #[test]
    fn test_round_trip_after_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, index) = open_store(dir.path());
            for n in 0..200u32 {
                store.write(index, &n.to_be_bytes(), format!("value-{n}").as_bytes()).unwrap();
            }
            store.stage().unwrap();
            store.commit().unwrap();
            store.close().unwrap();
        }
        let (store, index) = open_store(dir.path());
        for n in 0..200u32 {
            assert_eq!(
                store.read(index, &n.to_be_bytes()).unwrap().unwrap(),
                format!("value-{n}").as_bytes()
            );
        }
    }

    #[test]
    fn test_partial_writes_compose() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", b"abcdefgh").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        // Two non-overlapping sub-range writes over the committed value.
        store.write_at(index, b"key1", 0, b"AB").unwrap();
        store.write_at(index, b"key1", 6, b"GH").unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"ABcdefGH");

        store.stage().unwrap();
        store.commit().unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"ABcdefGH");
        // In-place overwrite: the value's length never changed.
        assert_eq!(store.value_length(index, b"key1").unwrap(), Some(8));
    }

    #[test]
    fn test_read_at_slices_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", b"0123456789").unwrap();
        assert_eq!(store.read_at(index, b"key1", 3, 4).unwrap().unwrap(), b"3456");
        assert!(matches!(
            store.read_at(index, b"key1", 8, 5),
            Err(Error::OutOfRange { .. })
        ));
        assert_eq!(store.read_at(index, b"none", 0, 1).unwrap(), None);
    }

    #[test]
    fn test_current_shadows_staged_shadows_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", b"disk").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.write(index, b"key1", b"staged").unwrap();
        store.stage().unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"staged");

        store.write(index, b"key1", b"current").unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"current");

        store.revert();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"staged");

        store.commit().unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"staged");
    }

    #[test]
    fn test_remove_is_idempotent_and_layered() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", b"v").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.remove(index, b"key1").unwrap();
        store.remove(index, b"key1").unwrap();
        assert_eq!(store.read(index, b"key1").unwrap(), None);
        assert_eq!(store.value_length(index, b"key1").unwrap(), None);

        store.stage().unwrap();
        store.commit().unwrap();
        assert_eq!(store.read(index, b"key1").unwrap(), None);

        // Removing a key that never existed stays a no-op through commit.
        store.remove(index, b"gone").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();
        assert_eq!(store.read(index, b"gone").unwrap(), None);
    }

    #[test]
    fn test_write_after_remove_resurrects() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", b"one").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.remove(index, b"key1").unwrap();
        store.write(index, b"key1", b"two").unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"two");
        store.stage().unwrap();
        store.commit().unwrap();
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"two");
    }

    #[test]
    fn test_rename_moves_value_without_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"aaaa", b"payload").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.rename(index, b"aaaa", b"bbbb").unwrap();
        assert_eq!(store.read(index, b"bbbb").unwrap().unwrap(), b"payload");
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.read(index, b"bbbb").unwrap().unwrap(), b"payload");
        assert_eq!(store.read(index, b"aaaa").unwrap(), None);
    }

    #[test]
    fn test_rename_chain_collapses() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"aaaa", b"payload").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.rename(index, b"aaaa", b"bbbb").unwrap();
        store.rename(index, b"bbbb", b"cccc").unwrap();
        assert_eq!(store.read(index, b"cccc").unwrap().unwrap(), b"payload");
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.read(index, b"cccc").unwrap().unwrap(), b"payload");
        assert_eq!(store.read(index, b"bbbb").unwrap(), None);
        assert_eq!(store.read(index, b"aaaa").unwrap(), None);
    }

    #[test]
    fn test_remove_of_rename_target_deletes_source() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"aaaa", b"payload").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.rename(index, b"aaaa", b"bbbb").unwrap();
        store.remove(index, b"bbbb").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.read(index, b"aaaa").unwrap(), None);
        assert_eq!(store.read(index, b"bbbb").unwrap(), None);
    }

    #[test]
    fn test_remove_of_renamed_source_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"aaaa", b"payload").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        // The source key no longer exists once renamed away; removing it must
        // not queue a delete that would fail the commit.
        store.rename(index, b"aaaa", b"bbbb").unwrap();
        store.remove(index, b"aaaa").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.read(index, b"bbbb").unwrap().unwrap(), b"payload");
        assert_eq!(store.read(index, b"aaaa").unwrap(), None);
    }

    #[test]
    fn test_repeated_rename_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"aaaa", b"payload").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.rename(index, b"aaaa", b"bbbb").unwrap();
        store.rename(index, b"aaaa", b"bbbb").unwrap();
        {
            let mut engine = store.inner.lock();
            let changes = engine.current.index(0);
            assert_eq!(changes.rename_old.len(), 1);
            assert_eq!(changes.rename_new.len(), 1);
        }
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.read(index, b"bbbb").unwrap().unwrap(), b"payload");
        assert_eq!(store.read(index, b"aaaa").unwrap(), None);
    }

    #[test]
    fn test_failed_commit_poisons_store_until_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());
        store.write(index, b"key1", b"v").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        // Force a mid-apply failure: a staged delete of a key that exists
        // nowhere fails the delete pass with KeyNotFound.
        {
            let mut engine = store.inner.lock();
            engine.staged.index(0).deletes.insert(b"none".to_vec());
            engine.has_staged = true;
        }
        assert!(matches!(store.commit(), Err(Error::KeyNotFound)));

        // Every further operation is refused.
        assert!(matches!(store.write(index, b"key2", b"w"), Err(Error::Poisoned)));
        assert!(matches!(store.read(index, b"key1"), Err(Error::Poisoned)));
        assert!(matches!(store.stage(), Err(Error::Poisoned)));
        assert!(matches!(store.commit(), Err(Error::Poisoned)));
        drop(store);

        // Reopening replays the still-active journal and recovers.
        let (store, index) = open_store(dir.path());
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"v");
        store.write(index, b"key2", b"w").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();
    }

    #[test]
    fn test_free_list_reuse_keeps_heap_from_growing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", &[7u8; 64]).unwrap();
        store.stage().unwrap();
        store.commit().unwrap();
        let size_after_first = store.inner.lock().last_size;

        // Delete and rewrite an equal-size value: the freed section is
        // reused, so the append position must not move.
        store.remove(index, b"key1").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();
        store.write(index, b"key2", &[9u8; 64]).unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.inner.lock().last_size, size_after_first);
        assert_eq!(store.read(index, b"key2").unwrap().unwrap(), vec![9u8; 64]);
    }

    #[test]
    fn test_shrinking_overwrite_frees_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());

        store.write(index, b"key1", &[1u8; 100]).unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        store.write(index, b"key1", &[2u8; 40]).unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.value_length(index, b"key1").unwrap(), Some(40));
        assert_eq!(store.inner.lock().free_list.free_bytes(), 60);
    }

    #[test]
    fn test_extra_data_survives_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig { extra_data_size: 16, ..StoreConfig::default() };
        {
            let store = Store::open(dir.path(), config.clone()).unwrap();
            store.write_extra_data(4, b"tip-hash").unwrap();
            assert_eq!(&store.extra_data()[4..12], b"tip-hash");
            store.stage().unwrap();
            store.commit().unwrap();
            store.close().unwrap();
        }
        let store = Store::open(dir.path(), config).unwrap();
        assert_eq!(&store.extra_data()[4..12], b"tip-hash");
        assert_eq!(&store.extra_data()[0..4], &[0u8; 4]);
    }

    #[test]
    fn test_extra_data_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig { extra_data_size: 8, ..StoreConfig::default() };
        let store = Store::open(dir.path(), config).unwrap();
        assert!(matches!(store.write_extra_data(6, b"abc"), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn test_key_size_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = open_store(dir.path());
        assert!(matches!(
            store.write(index, b"toolong", b"v"),
            Err(Error::KeySizeMismatch { expected: 4, actual: 7 })
        ));
    }

    #[test]
    fn test_unknown_index_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        let bogus = IndexId(9);
        assert!(matches!(store.read(bogus, b"key1"), Err(Error::UnknownIndex { id: 9 })));
    }

    #[test]
    fn test_duplicate_index_load_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        assert!(matches!(
            store.load_index(0, 4, 0),
            Err(Error::IndexAlreadyLoaded { id: 0 })
        ));
    }

    #[test]
    fn test_two_indexes_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        let short = store.load_index(0, 4, 1 << 20).unwrap();
        let long = store.load_index(1, 8, 1 << 20).unwrap();

        store.write(short, b"key1", b"short index").unwrap();
        store.write(long, b"key1key1", b"long index").unwrap();
        store.stage().unwrap();
        store.commit().unwrap();

        assert_eq!(store.read(short, b"key1").unwrap().unwrap(), b"short index");
        assert_eq!(store.read(long, b"key1key1").unwrap().unwrap(), b"long index");
        assert_eq!(store.read(long, b"key1\0\0\0\0").unwrap(), None);
    }

    #[test]
    fn test_close_commits_staged() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, index) = open_store(dir.path());
            store.write(index, b"key1", b"kept").unwrap();
            store.stage().unwrap();
            store.close().unwrap();
        }
        let (store, index) = open_store(dir.path());
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), b"kept");
    }

    #[test]
    fn test_stage_auto_commits_past_footprint_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig { cache_limit: 64, ..StoreConfig::default() };
        let store = Store::open(dir.path(), config).unwrap();
        let index = store.load_index(0, 4, 1 << 20).unwrap();

        store.write(index, b"key1", &[5u8; 256]).unwrap();
        store.stage().unwrap();
        // The staged footprint exceeded the limit, so stage committed.
        assert!(!store.inner.lock().has_staged);
        assert_eq!(store.read(index, b"key1").unwrap().unwrap(), vec![5u8; 256]);
    }

    #[test]
    fn test_many_keys_disk_only_reads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, index) = open_store(dir.path());
            for n in 0..1500u32 {
                store.write(index, &n.to_be_bytes(), &n.to_le_bytes()).unwrap();
            }
            store.stage().unwrap();
            store.commit().unwrap();
        }
        // Reopen with a zero node-cache budget to force disk descents.
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        let index = store.load_index(0, 4, 0).unwrap();
        for n in (0..1500u32).step_by(97) {
            assert_eq!(store.read(index, &n.to_be_bytes()).unwrap().unwrap(), n.to_le_bytes());
        }
    }
}
