//! Append-only record files (`blk00000.dat`, `rev00000.dat`, ...).
//!
//! Each record is `magic(4) || len(4, LE) || payload`. A `FilePos` points at
//! the payload, so readers can check the framing that precedes it.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::StorageError;

const RECORD_HEADER_LEN: u64 = 8;

/// Location of one record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePos {
    pub file: u32,
    pub offset: u64,
    pub len: u32,
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: &'static str,
    magic: [u8; 4],
    max_file_size: u64,
    current_file: u32,
    current_len: u64,
}

impl FlatFileStore {
    pub fn open<P: AsRef<Path>>(
        dir: P,
        prefix: &'static str,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut current_file = 0u32;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(".dat"))
                .and_then(|digits| digits.parse::<u32>().ok())
            else {
                continue;
            };
            current_file = current_file.max(id);
        }

        let mut store = FlatFileStore { dir, prefix, magic, max_file_size, current_file, current_len: 0 };
        let path = store.path(current_file);
        if path.exists() {
            store.current_len = fs::metadata(&path)?.len();
        }
        Ok(store)
    }

    fn path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("{}{:05}.dat", self.prefix, file))
    }

    pub fn current_file(&self) -> u32 {
        self.current_file
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<FilePos, StorageError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Corrupt("record larger than 4 GiB".into()))?;
        let record_len = RECORD_HEADER_LEN + payload.len() as u64;

        if self.current_len > 0 && self.current_len + record_len > self.max_file_size {
            self.current_file += 1;
            self.current_len = 0;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(self.current_file))?;
        let mut record = Vec::with_capacity(record_len as usize);
        record.extend_from_slice(&self.magic);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(payload);
        file.write_all(&record)?;

        let pos = FilePos {
            file: self.current_file,
            offset: self.current_len + RECORD_HEADER_LEN,
            len,
        };
        self.current_len += record_len;
        Ok(pos)
    }

    pub fn read(&self, pos: FilePos) -> Result<Vec<u8>, StorageError> {
        if pos.offset < RECORD_HEADER_LEN {
            return Err(StorageError::Corrupt(format!("bad record offset {}", pos.offset)));
        }
        let mut file = File::open(self.path(pos.file))?;
        file.seek(SeekFrom::Start(pos.offset - RECORD_HEADER_LEN))?;

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[..4] != self.magic {
            return Err(StorageError::Corrupt(format!(
                "bad magic in {}{:05}.dat at {}",
                self.prefix, pos.file, pos.offset
            )));
        }
        let stored_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if stored_len != pos.len {
            return Err(StorageError::Corrupt(format!(
                "record length mismatch ({} vs {})",
                stored_len, pos.len
            )));
        }

        let mut payload = vec![0u8; pos.len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// fsync the file currently being appended to.
    pub fn sync(&self) -> Result<(), StorageError> {
        let path = self.path(self.current_file);
        if path.exists() {
            OpenOptions::new().append(true).open(path)?.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [1, 2, 3, 4];

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path(), "blk", MAGIC, 1 << 20).unwrap();
        let a = store.append(b"first").unwrap();
        let b = store.append(b"second record").unwrap();
        assert_eq!(store.read(a).unwrap(), b"first");
        assert_eq!(store.read(b).unwrap(), b"second record");
        assert_eq!(a.file, b.file);
    }

    #[test]
    fn test_rolls_to_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path(), "rev", MAGIC, 32).unwrap();
        let a = store.append(&[7u8; 20]).unwrap();
        let b = store.append(&[8u8; 20]).unwrap();
        assert_eq!(a.file, 0);
        assert_eq!(b.file, 1);
        assert_eq!(store.read(a).unwrap(), vec![7u8; 20]);
        assert_eq!(store.read(b).unwrap(), vec![8u8; 20]);
    }

    #[test]
    fn test_reopen_continues_appending() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let mut store = FlatFileStore::open(dir.path(), "blk", MAGIC, 1 << 20).unwrap();
            let pos = store.append(b"persisted").unwrap();
            store.sync().unwrap();
            pos
        };
        let mut store = FlatFileStore::open(dir.path(), "blk", MAGIC, 1 << 20).unwrap();
        let second = store.append(b"later").unwrap();
        assert!(second.offset > first.offset);
        assert_eq!(store.read(first).unwrap(), b"persisted");
        assert_eq!(store.read(second).unwrap(), b"later");
    }

    #[test]
    fn test_detects_bad_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path(), "blk", MAGIC, 1 << 20).unwrap();
        let pos = store.append(b"payload").unwrap();
        let wrong_len = FilePos { len: pos.len + 1, ..pos };
        assert!(matches!(store.read(wrong_len), Err(StorageError::Corrupt(_))));
        let wrong_offset = FilePos { offset: pos.offset + 1, ..pos };
        assert!(store.read(wrong_offset).is_err());
    }
}
