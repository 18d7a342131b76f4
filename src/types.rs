//! Core value addressing types and on-disk sentinels.
//!
//! Values live in numbered data files and are addressed by `(file, pos, len)`
//! triples stored in the B-tree indexes. A handful of sentinel values are
//! shared across the engine:
//!
//! - [`OVERWRITE`] as a write offset means "replace the whole value"
//! - [`DELETED`] as an indexed length marks a tombstoned element
//! - [`NO_LAST_FILE`] in the journal header means "no data files existed yet"

/// Write offset sentinel: replace the entire value rather than a sub-range.
pub const OVERWRITE: u32 = u32::MAX;

/// Indexed length sentinel: the element is a tombstone.
pub const DELETED: u32 = u32::MAX;

/// Journal header sentinel: the store had no data files at commit start.
pub const NO_LAST_FILE: u16 = u16::MAX;

/// Handle to a loaded index, returned by `Store::load_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(pub(crate) u8);

impl IndexId {
    /// The on-disk identifier of this index.
    pub fn id(self) -> u8 {
        self.0
    }
}

/// Location and length of a stored value inside the data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRef {
    /// Data file number (`val_<file>.dat`).
    pub file: u16,
    /// Byte offset of the value within its file.
    pub pos: u32,
    /// Stored length in bytes, or [`DELETED`] for a tombstone.
    pub len: u32,
}

impl ValueRef {
    /// Whether this element has been tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.len == DELETED
    }
}
