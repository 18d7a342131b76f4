//! File access layer: the on-disk file set and journaled writes.
//!
//! All store files live in one directory:
//!
//! - `val_<n>.dat`: value data files
//! - `del.dat`: free-list (deletion index) file
//! - `idx_<i>_<n>.dat`: B-tree files for index `i`
//! - `log.dat`: pre-image commit journal
//!
//! The pager owns the open file handles and routes every write through one of
//! two primitives: `overwrite`, which records the pre-image of the target
//! bytes in the journal before writing in place, and `append`, which extends
//! a file without journaling (recovery truncates files back to their recorded
//! sizes, so appended bytes need no pre-image).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;

/// Journal record tag for the data files.
pub(crate) const FILE_TYPE_DATA: u8 = 1;
/// Journal record tag for the free-list file.
pub(crate) const FILE_TYPE_FREE_LIST: u8 = 2;
/// Journal record tag for index files.
pub(crate) const FILE_TYPE_INDEX: u8 = 3;

/// Identifies one on-disk file of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FileKey {
    /// `val_<n>.dat`
    Data(u16),
    /// `del.dat`
    FreeList,
    /// `idx_<i>_<n>.dat`
    Index(u8, u16),
}

impl FileKey {
    /// File name within the store directory.
    pub(crate) fn file_name(&self) -> String {
        match self {
            FileKey::Data(n) => format!("val_{n}.dat"),
            FileKey::FreeList => "del.dat".to_string(),
            FileKey::Index(id, n) => format!("idx_{id}_{n}.dat"),
        }
    }

    /// Journal record header fields: `(file_type, index_id, file_id)`.
    fn record_ids(&self) -> (u8, u8, u16) {
        match self {
            FileKey::Data(n) => (FILE_TYPE_DATA, 0, *n),
            FileKey::FreeList => (FILE_TYPE_FREE_LIST, 0, 0),
            FileKey::Index(id, n) => (FILE_TYPE_INDEX, *id, *n),
        }
    }
}

// ---------------------------------------------------------------------------
// Positional I/O helpers: pread/pwrite on Unix, seek_read/seek_write on
// Windows
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        pos += n;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_write(&buf[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

/// Fsync the directory so renames/creations of store files are durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StoreFile
// ---------------------------------------------------------------------------

/// An open store file with its tracked length.
#[derive(Debug)]
pub(crate) struct StoreFile {
    file: File,
    len: u64,
}

impl StoreFile {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(StoreFile { file, len })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at_offset(&self.file, buf, offset)?;
        Ok(())
    }

    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at_offset(&self.file, data, offset)?;
        let end = offset + data.len() as u64;
        if end > self.len {
            self.len = end;
        }
        Ok(())
    }

    pub(crate) fn append(&mut self, data: &[u8]) -> Result<()> {
        write_all_at_offset(&self.file, data, self.len)?;
        self.len += data.len() as u64;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pager
// ---------------------------------------------------------------------------

/// Owns the open file handles and the active journal, if any.
///
/// While a journal is active (between `begin_journal` and `end_journal`),
/// every `overwrite` appends a pre-image record before touching the target
/// file. Appends are never journaled.
#[derive(Debug)]
pub(crate) struct Pager {
    dir: PathBuf,
    files: HashMap<FileKey, StoreFile>,
    journal: Option<StoreFile>,
}

impl Pager {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Pager { dir, files: HashMap::new(), journal: None }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open (creating if absent) and cache the handle for `key`.
    pub(crate) fn file(&mut self, key: FileKey) -> Result<&mut StoreFile> {
        if !self.files.contains_key(&key) {
            let file = StoreFile::open(&self.dir.join(key.file_name()))?;
            self.files.insert(key, file);
        }
        // Entry is guaranteed present after the insert above
        match self.files.get_mut(&key) {
            Some(f) => Ok(f),
            None => unreachable!(),
        }
    }

    pub(crate) fn file_len(&mut self, key: FileKey) -> Result<u64> {
        Ok(self.file(key)?.len())
    }

    pub(crate) fn read(&mut self, key: FileKey, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.file(key)?.read_at(u64::from(offset), buf)
    }

    /// Overwrite bytes in place, journaling the pre-image first.
    pub(crate) fn overwrite(&mut self, key: FileKey, offset: u32, data: &[u8]) -> Result<()> {
        if self.journal.is_some() {
            let mut prior = vec![0u8; data.len()];
            self.file(key)?.read_at(u64::from(offset), &mut prior)?;
            let (file_type, index_id, file_id) = key.record_ids();
            let mut record = Vec::with_capacity(12 + prior.len());
            record.push(file_type);
            record.push(index_id);
            let mut fixed = [0u8; 10];
            LittleEndian::write_u16(&mut fixed[0..2], file_id);
            LittleEndian::write_u32(&mut fixed[2..6], offset);
            LittleEndian::write_u32(&mut fixed[6..10], prior.len() as u32);
            record.extend_from_slice(&fixed);
            record.extend_from_slice(&prior);
            if let Some(journal) = self.journal.as_mut() {
                journal.append(&record)?;
            }
        }
        self.file(key)?.write_at(u64::from(offset), data)
    }

    /// Append bytes at the end of the file. Not journaled.
    pub(crate) fn append(&mut self, key: FileKey, data: &[u8]) -> Result<()> {
        self.file(key)?.append(data)
    }

    /// Append `count` zero bytes. Not journaled.
    pub(crate) fn append_zeros(&mut self, key: FileKey, count: usize) -> Result<()> {
        self.file(key)?.append(&vec![0u8; count])
    }

    pub(crate) fn sync(&mut self, key: FileKey) -> Result<()> {
        self.file(key)?.sync()
    }

    /// Fsync every file the pager has open.
    pub(crate) fn sync_all(&mut self) -> Result<()> {
        for file in self.files.values() {
            file.sync()?;
        }
        Ok(())
    }

    pub(crate) fn sync_store_dir(&self) -> Result<()> {
        sync_dir(&self.dir)
    }

    // -- journal control ----------------------------------------------------

    /// Create a fresh journal containing the active flag and `header`.
    pub(crate) fn begin_journal(&mut self, header: &[u8]) -> Result<()> {
        let path = self.dir.join("log.dat");
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        let mut journal = StoreFile { file, len: 0 };
        let mut prefix = Vec::with_capacity(1 + header.len());
        prefix.push(1u8);
        prefix.extend_from_slice(header);
        journal.append(&prefix)?;
        self.journal = Some(journal);
        Ok(())
    }

    pub(crate) fn journal_active(&self) -> bool {
        self.journal.is_some()
    }

    pub(crate) fn sync_journal(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.as_ref() {
            journal.sync()?;
        }
        Ok(())
    }

    /// Clear the active flag and fsync, completing the commit.
    pub(crate) fn end_journal(&mut self) -> Result<()> {
        if let Some(mut journal) = self.journal.take() {
            journal.write_at(0, &[0u8])?;
            journal.sync()?;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::new(dir.path().to_path_buf());

        pager.append(FileKey::Data(0), b"hello world").unwrap();
        let mut buf = [0u8; 5];
        pager.read(FileKey::Data(0), 6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(pager.file_len(FileKey::Data(0)).unwrap(), 11);
    }

    #[test]
    fn test_overwrite_without_journal_is_direct() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::new(dir.path().to_path_buf());

        pager.append(FileKey::Data(0), b"aaaa").unwrap();
        pager.overwrite(FileKey::Data(0), 1, b"bb").unwrap();
        let mut buf = [0u8; 4];
        pager.read(FileKey::Data(0), 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abba");
        assert!(!dir.path().join("log.dat").exists());
    }

    #[test]
    fn test_journal_records_pre_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::new(dir.path().to_path_buf());

        pager.append(FileKey::Index(7, 2), b"original").unwrap();
        pager.begin_journal(&[0xAB, 0xCD]).unwrap();
        pager.overwrite(FileKey::Index(7, 2), 2, b"XXX").unwrap();
        pager.end_journal().unwrap();

        let log = std::fs::read(dir.path().join("log.dat")).unwrap();
        // inactive flag + header
        assert_eq!(log[0], 0);
        assert_eq!(&log[1..3], &[0xAB, 0xCD]);
        // one record: type, index id, file id, offset, len, pre-image
        assert_eq!(log[3], FILE_TYPE_INDEX);
        assert_eq!(log[4], 7);
        assert_eq!(LittleEndian::read_u16(&log[5..7]), 2);
        assert_eq!(LittleEndian::read_u32(&log[7..11]), 2);
        assert_eq!(LittleEndian::read_u32(&log[11..15]), 3);
        assert_eq!(&log[15..18], b"igi");

        let mut buf = [0u8; 8];
        pager.read(FileKey::Index(7, 2), 0, &mut buf).unwrap();
        assert_eq!(&buf, b"orXXXnal");
    }

    #[test]
    fn test_appends_are_not_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::new(dir.path().to_path_buf());

        pager.begin_journal(&[]).unwrap();
        pager.append(FileKey::Data(3), b"fresh bytes").unwrap();
        pager.append_zeros(FileKey::Data(3), 4).unwrap();
        pager.end_journal().unwrap();

        let log = std::fs::read(dir.path().join("log.dat")).unwrap();
        assert_eq!(log.len(), 1, "journal should hold only the flag byte");
        assert_eq!(pager.file_len(FileKey::Data(3)).unwrap(), 15);
    }
}
