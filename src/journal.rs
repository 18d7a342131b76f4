//! Commit journal format and crash recovery.
//!
//! `log.dat` is a pre-image journal written fresh for every commit:
//!
//! ```text
//! [active: u8]
//! [free_list_len: u32][data_last_file: u16][data_last_size: u32]
//! [index_count: u8] then per index [id: u8][last_file: u16][last_size: u32]
//! records: [file_type: u8][index_id: u8][file_id: u16][offset: u32]
//!          [len: u32][pre-image bytes]
//! ```
//!
//! The active byte is the commit's atomicity boundary. While it is set, the
//! journal holds everything needed to rewind: the previous file sizes (so
//! appends can be truncated away) and the previous contents of every
//! overwritten byte range. Recovery runs before the store touches anything
//! else: truncate, replay, fsync, clear the flag.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::pager::{self, FILE_TYPE_DATA, FILE_TYPE_FREE_LIST, FILE_TYPE_INDEX};
use crate::types::NO_LAST_FILE;

/// Fixed header bytes following the active flag.
const HEADER_FIXED: usize = 11;
/// Bytes per index entry in the header.
const PER_INDEX: usize = 7;
/// Bytes of a record before its pre-image payload.
const RECORD_FIXED: usize = 12;

/// Pre-commit state recorded at the start of the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JournalHeader {
    /// Byte length of `del.dat` before the commit.
    pub(crate) free_list_len: u32,
    /// Last data file before the commit, or [`NO_LAST_FILE`].
    pub(crate) data_last_file: u16,
    /// Byte length of that data file before the commit.
    pub(crate) data_last_size: u32,
    /// Per touched index: `(id, last_file, last_size)` before the commit.
    pub(crate) indexes: Vec<(u8, u16, u32)>,
}

impl JournalHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_FIXED + PER_INDEX * self.indexes.len()];
        LittleEndian::write_u32(&mut buf[0..4], self.free_list_len);
        LittleEndian::write_u16(&mut buf[4..6], self.data_last_file);
        LittleEndian::write_u32(&mut buf[6..10], self.data_last_size);
        buf[10] = self.indexes.len() as u8;
        for (i, (id, file, size)) in self.indexes.iter().enumerate() {
            let at = HEADER_FIXED + i * PER_INDEX;
            buf[at] = *id;
            LittleEndian::write_u16(&mut buf[at + 1..at + 3], *file);
            LittleEndian::write_u32(&mut buf[at + 3..at + 7], *size);
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<JournalHeader> {
        if buf.len() < HEADER_FIXED {
            return Err(Error::Corrupted { reason: "journal header truncated".to_string() });
        }
        let count = buf[10] as usize;
        if buf.len() < HEADER_FIXED + count * PER_INDEX {
            return Err(Error::Corrupted { reason: "journal index list truncated".to_string() });
        }
        let mut indexes = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_FIXED + i * PER_INDEX;
            indexes.push((
                buf[at],
                LittleEndian::read_u16(&buf[at + 1..at + 3]),
                LittleEndian::read_u32(&buf[at + 3..at + 7]),
            ));
        }
        Ok(JournalHeader {
            free_list_len: LittleEndian::read_u32(&buf[0..4]),
            data_last_file: LittleEndian::read_u16(&buf[4..6]),
            data_last_size: LittleEndian::read_u32(&buf[6..10]),
            indexes,
        })
    }
}

/// Truncate `name` to `len` bytes if it exists.
fn truncate_file(dir: &Path, name: &str, len: u64) -> Result<()> {
    let path = dir.join(name);
    if path.exists() {
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Remove every numbered file past `last` in the given naming scheme.
fn remove_past(dir: &Path, mut name: impl FnMut(u16) -> String, last: u16) -> Result<()> {
    let mut n = last;
    loop {
        n = match n.checked_add(1) {
            Some(n) => n,
            None => return Ok(()),
        };
        let path = dir.join(name(n));
        if !path.exists() {
            return Ok(());
        }
        fs::remove_file(path)?;
    }
}

/// Roll back a commit the journal says never finished.
///
/// Returns `true` when an active journal was found and replayed. Must run
/// before any store file is opened for use.
pub(crate) fn recover(dir: &Path) -> Result<bool> {
    let log_path = dir.join("log.dat");
    if !log_path.exists() {
        return Ok(false);
    }
    let data = fs::read(&log_path)?;
    if data.is_empty() || data[0] == 0 {
        return Ok(false);
    }
    tracing::warn!(dir = %dir.display(), "active commit journal found, rolling back");

    let header = JournalHeader::decode(&data[1..])?;

    // Appends made by the interrupted commit vanish with the truncation;
    // files it created past the recorded last ids are deleted outright.
    truncate_file(dir, "del.dat", u64::from(header.free_list_len))?;
    if header.data_last_file != NO_LAST_FILE {
        truncate_file(
            dir,
            &format!("val_{}.dat", header.data_last_file),
            u64::from(header.data_last_size),
        )?;
        remove_past(dir, |n| format!("val_{n}.dat"), header.data_last_file)?;
    }
    for (id, last_file, last_size) in &header.indexes {
        truncate_file(dir, &format!("idx_{id}_{last_file}.dat"), u64::from(*last_size))?;
        remove_past(dir, |n| format!("idx_{id}_{n}.dat"), *last_file)?;
    }

    // Replay pre-images in order. A torn trailing record means its overwrite
    // never ran, so stopping there is safe.
    let mut pos = 1 + HEADER_FIXED + PER_INDEX * header.indexes.len();
    while pos + RECORD_FIXED <= data.len() {
        let file_type = data[pos];
        let index_id = data[pos + 1];
        let file_id = LittleEndian::read_u16(&data[pos + 2..pos + 4]);
        let offset = LittleEndian::read_u32(&data[pos + 4..pos + 8]);
        let len = LittleEndian::read_u32(&data[pos + 8..pos + 12]) as usize;
        if pos + RECORD_FIXED + len > data.len() {
            break;
        }
        let pre_image = &data[pos + RECORD_FIXED..pos + RECORD_FIXED + len];
        let name = match file_type {
            FILE_TYPE_DATA => format!("val_{file_id}.dat"),
            FILE_TYPE_FREE_LIST => "del.dat".to_string(),
            FILE_TYPE_INDEX => format!("idx_{index_id}_{file_id}.dat"),
            other => {
                return Err(Error::Corrupted {
                    reason: format!("journal record with unknown file type {other}"),
                });
            },
        };
        write_pre_image(&dir.join(name), u64::from(offset), pre_image)?;
        pos += RECORD_FIXED + len;
    }

    pager::sync_dir(dir)?;

    // All pre-images are durable; the journal is spent.
    let log = OpenOptions::new().write(true).open(&log_path)?;
    write_at(&log, 0, &[0u8])?;
    log.sync_all()?;
    Ok(true)
}

fn write_pre_image(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    write_at(&file, offset, data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
