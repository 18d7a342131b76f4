//! Free list over deleted value sections (`del.dat`).
//!
//! Every freed value becomes a span `(file, offset, len)` recorded both in
//! memory and in an 11-byte slot of `del.dat`. Allocation always takes the
//! largest active span and carves the requested size out of its tail, so the
//! span ordering puts the best candidate last. Slots are never removed from
//! the file; a fully consumed span is deactivated in place and its slot is
//! reused by the next free.
//!
//! On-disk layout:
//!
//! ```text
//! del.dat: [count: u32 LE] then count slots of
//!          [active: u8][len: u32 BE][file: u16 LE][offset: u32 LE]
//! ```
//!
//! The big-endian length makes the raw slot bytes compare in the same order
//! as the in-memory spans.

use std::collections::BTreeSet;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::pager::{FileKey, Pager};

/// Size of one slot in `del.dat`.
pub(crate) const SLOT_SIZE: u32 = 11;

/// A freed (or previously freed, now inactive) section of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FreeSpan {
    /// Inactive spans sort first and are never allocated from.
    pub(crate) active: bool,
    /// Remaining free length.
    pub(crate) len: u32,
    /// Data file holding the span.
    pub(crate) file: u16,
    /// Offset of the span within its file.
    pub(crate) offset: u32,
    /// Slot position within `del.dat`, kept for in-place updates.
    pub(crate) slot: u32,
}

impl FreeSpan {
    fn slot_offset(&self) -> u32 {
        4 + SLOT_SIZE * self.slot
    }

    fn encode(&self) -> [u8; 11] {
        let mut buf = [0u8; 11];
        buf[0] = u8::from(self.active);
        BigEndian::write_u32(&mut buf[1..5], self.len);
        LittleEndian::write_u16(&mut buf[5..7], self.file);
        LittleEndian::write_u32(&mut buf[7..11], self.offset);
        buf
    }

    fn decode(buf: &[u8], slot: u32) -> FreeSpan {
        FreeSpan {
            active: buf[0] != 0,
            len: BigEndian::read_u32(&buf[1..5]),
            file: LittleEndian::read_u16(&buf[5..7]),
            offset: LittleEndian::read_u32(&buf[7..11]),
            slot,
        }
    }
}

/// In-memory mirror of `del.dat`.
#[derive(Debug)]
pub(crate) struct FreeList {
    spans: BTreeSet<FreeSpan>,
    /// Number of slots in the file, active or not.
    count: u32,
    /// Count currently recorded in the file header.
    disk_count: u32,
}

impl FreeList {
    /// Load `del.dat`, creating an empty one on first open.
    pub(crate) fn load(pager: &mut Pager) -> Result<FreeList> {
        let len = pager.file_len(FileKey::FreeList)?;
        if len == 0 {
            pager.append(FileKey::FreeList, &[0u8; 4])?;
            return Ok(FreeList { spans: BTreeSet::new(), count: 0, disk_count: 0 });
        }
        let mut header = [0u8; 4];
        pager.read(FileKey::FreeList, 0, &mut header)?;
        let count = LittleEndian::read_u32(&header);
        if 4 + u64::from(SLOT_SIZE) * u64::from(count) > len {
            return Err(Error::Corrupted {
                reason: format!("free list claims {count} slots but file is {len} bytes"),
            });
        }
        let mut spans = BTreeSet::new();
        let mut buf = [0u8; 11];
        for slot in 0..count {
            pager.read(FileKey::FreeList, 4 + SLOT_SIZE * slot, &mut buf)?;
            spans.insert(FreeSpan::decode(&buf, slot));
        }
        Ok(FreeList { spans, count, disk_count: count })
    }

    /// Record a freed section, reusing an inactive slot when one exists.
    pub(crate) fn add(&mut self, pager: &mut Pager, file: u16, offset: u32, len: u32) -> Result<()> {
        let reusable = self.spans.first().filter(|s| !s.active).copied();
        match reusable {
            Some(old) => {
                self.spans.remove(&old);
                let span = FreeSpan { active: len > 0, len, file, offset, slot: old.slot };
                pager.overwrite(FileKey::FreeList, span.slot_offset(), &span.encode())?;
                self.spans.insert(span);
            },
            None => {
                let slot = self.count;
                self.count += 1;
                let span = FreeSpan { active: len > 0, len, file, offset, slot };
                pager.append(FileKey::FreeList, &span.encode())?;
                self.spans.insert(span);
            },
        }
        Ok(())
    }

    /// Take `want` bytes from the tail of the largest active span.
    ///
    /// Returns the `(file, offset)` to write at, or `None` when no span is
    /// large enough. The span shrinks in place; an exact fit deactivates it.
    pub(crate) fn take(&mut self, pager: &mut Pager, want: u32) -> Result<Option<(u16, u32)>> {
        let candidate = match self.spans.last().copied() {
            Some(span) if span.active && span.len >= want => span,
            _ => return Ok(None),
        };
        self.spans.remove(&candidate);
        let remaining = candidate.len - want;
        let shrunk = FreeSpan {
            active: remaining > 0,
            len: remaining,
            ..candidate
        };
        // Only the activity flag and length change; file and offset stay.
        pager.overwrite(FileKey::FreeList, shrunk.slot_offset(), &shrunk.encode()[..5])?;
        self.spans.insert(shrunk);
        Ok(Some((candidate.file, candidate.offset + remaining)))
    }

    /// Rewrite the slot-count header if it changed since load.
    pub(crate) fn flush_count(&mut self, pager: &mut Pager) -> Result<()> {
        if self.count != self.disk_count {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, self.count);
            pager.overwrite(FileKey::FreeList, 0, &buf)?;
            self.disk_count = self.count;
        }
        Ok(())
    }

    /// Total active free bytes, used by tests and stats.
    pub(crate) fn free_bytes(&self) -> u64 {
        self.spans.iter().filter(|s| s.active).map(|s| u64::from(s.len)).sum()
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> u32 {
        self.count
    }
}
