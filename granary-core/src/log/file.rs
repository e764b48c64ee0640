//! Log file handles

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use super::record::{FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::platform;
use crate::types::{DayEpoch, Key, Record};
use crate::{Error, Result};

/// One append-only log file. Appends are serialized by the owning store;
/// positioned reads are safe from any thread and keep working after the
/// path is unlinked.
#[derive(Debug)]
pub struct LogFile {
    id: u32,
    path: PathBuf,
    file: File,
    /// Write cursor; also the current file length.
    cursor: Mutex<u64>,
    len: AtomicU64,
    sealed: AtomicBool,
}

/// Result of scanning a log at open time.
#[derive(Debug)]
pub struct ScanOutcome {
    /// The opened log.
    pub log: LogFile,
    /// Every valid record found, in file order.
    pub records: Vec<Record>,
}

impl LogFile {
    /// Create a fresh, empty log.
    pub fn create(dir: &Path, id: u32) -> Result<LogFile> {
        let path = dir.join(super::log_file_name(id));
        let file = platform::create_file(&path)?;
        Ok(LogFile {
            id,
            path,
            file,
            cursor: Mutex::new(0),
            len: AtomicU64::new(0),
            sealed: AtomicBool::new(false),
        })
    }

    /// Open an existing log, walking its frames. A bad final record is
    /// truncated away; corruption with valid data after it refuses to open.
    pub fn open(dir: &Path, id: u32) -> Result<ScanOutcome> {
        let path = dir.join(super::log_file_name(id));
        let file = platform::open_read_write(&path)?;
        let file_len = file.metadata()?.len();

        let mut records = Vec::new();
        let mut offset = 0u64;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];

        while offset < file_len {
            // a frame that cannot fit its header is a torn tail
            if file_len - offset < FRAME_HEADER_SIZE as u64 {
                Self::truncate_tail(&path, &file, offset, file_len)?;
                break;
            }
            platform::read_exact_at(&file, &mut header_buf, offset)?;
            let header = FrameHeader::decode(&header_buf)?;

            let end = offset
                .saturating_add(FRAME_HEADER_SIZE as u64)
                .saturating_add(header.length as u64);
            if header.length == 0 || header.length > MAX_PAYLOAD_SIZE || end > file_len {
                Self::truncate_tail(&path, &file, offset, file_len)?;
                break;
            }

            let mut payload = vec![0u8; header.length as usize];
            platform::read_exact_at(&file, &mut payload, offset + FRAME_HEADER_SIZE as u64)?;

            if let Err(err) = header.verify(&header_buf, &payload) {
                if end == file_len {
                    Self::truncate_tail(&path, &file, offset, file_len)?;
                    break;
                }
                // corruption before the tail is not recoverable
                return Err(Error::Corrupt(format!(
                    "log {id} record at offset {offset}: {err}"
                )));
            }

            records.push(Record {
                key: header.key,
                log_id: id,
                offset,
                length: header.length,
                created: header.created,
                expires: header.expires,
                flags: header.flags,
            });
            offset = end;
        }

        let final_len = file.metadata()?.len();
        Ok(ScanOutcome {
            log: LogFile {
                id,
                path,
                file,
                cursor: Mutex::new(final_len),
                len: AtomicU64::new(final_len),
                sealed: AtomicBool::new(false),
            },
            records,
        })
    }

    fn truncate_tail(path: &Path, file: &File, offset: u64, file_len: u64) -> Result<()> {
        warn!(
            "truncating {} torn bytes at end of {}",
            file_len - offset,
            path.display()
        );
        file.set_len(offset)?;
        platform::fsync(file)?;
        Ok(())
    }

    /// Log id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length in bytes.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the log as no longer accepting appends.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Whether the log has been sealed.
    pub fn sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Append one framed record and return its table reference.
    pub fn append(
        &self,
        key: Key,
        expires: DayEpoch,
        created: DayEpoch,
        flags: u8,
        payload: &[u8],
    ) -> Result<Record> {
        if self.sealed() {
            return Err(Error::Conflict(format!("log {} is sealed", self.id)));
        }
        let frame = FrameHeader::encode_frame(key, expires, created, flags, payload);

        let mut cursor = self.cursor.lock();
        let offset = *cursor;
        platform::write_all_at(&self.file, &frame, offset)?;
        *cursor += frame.len() as u64;
        self.len.store(*cursor, Ordering::Release);

        Ok(Record {
            key,
            log_id: self.id,
            offset,
            length: payload.len() as u32,
            created,
            expires,
            flags,
        })
    }

    /// Read a record's payload in full.
    pub fn read_payload(&self, rec: &Record) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; rec.length as usize];
        self.read_payload_at(rec, 0, &mut buf)?;
        Ok(buf)
    }

    /// Read part of a record's payload starting at `pos` within the
    /// payload.
    pub fn read_payload_at(&self, rec: &Record, pos: u64, buf: &mut [u8]) -> Result<()> {
        if pos + buf.len() as u64 > rec.length as u64 {
            return Err(Error::InvalidArgument(format!(
                "read of {} bytes at {} exceeds payload length {}",
                buf.len(),
                pos,
                rec.length
            )));
        }
        let off = rec.offset + FRAME_HEADER_SIZE as u64 + pos;
        platform::read_exact_at(&self.file, buf, off)?;
        Ok(())
    }

    /// Flush appended bytes to stable storage.
    pub fn sync(&self) -> Result<()> {
        platform::fsync(&self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(b: u8) -> Key {
        [b; 32]
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = LogFile::create(dir.path(), 1).unwrap();

        let rec = log.append(key(1), 0, 100, 0, b"first").unwrap();
        assert_eq!(rec.offset, 0);
        assert_eq!(rec.length, 5);
        let rec2 = log.append(key(2), 7, 101, 0b1, b"second!").unwrap();
        assert_eq!(rec2.offset, (FRAME_HEADER_SIZE + 5) as u64);

        assert_eq!(log.read_payload(&rec).unwrap(), b"first");
        assert_eq!(log.read_payload(&rec2).unwrap(), b"second!");

        let mut part = [0u8; 3];
        log.read_payload_at(&rec2, 2, &mut part).unwrap();
        assert_eq!(&part, b"con");
    }

    #[test]
    fn test_open_scan_recovers_records() {
        let dir = TempDir::new().unwrap();
        {
            let log = LogFile::create(dir.path(), 3).unwrap();
            log.append(key(1), 0, 100, 0, b"aaaa").unwrap();
            log.append(key(2), 5, 200, 1, b"bb").unwrap();
            log.sync().unwrap();
        }

        let outcome = LogFile::open(dir.path(), 3).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].key, key(1));
        assert_eq!(outcome.records[1].expires, 5);
        assert_eq!(outcome.records[1].flags, 1);
        assert_eq!(
            outcome.log.read_payload(&outcome.records[0]).unwrap(),
            b"aaaa"
        );
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let good_len;
        {
            let log = LogFile::create(dir.path(), 9).unwrap();
            log.append(key(1), 0, 100, 0, b"kept").unwrap();
            good_len = log.len();
            log.append(key(2), 0, 100, 0, b"torn").unwrap();
            log.sync().unwrap();
        }

        // chop the last record mid-payload
        let path = dir.path().join(super::super::log_file_name(9));
        let file = platform::open_read_write(&path).unwrap();
        file.set_len(good_len + FRAME_HEADER_SIZE as u64 + 2).unwrap();
        drop(file);

        let outcome = LogFile::open(dir.path(), 9).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.log.len(), good_len);

        // the log accepts appends again after recovery
        let rec = outcome.log.append(key(3), 0, 101, 0, b"new").unwrap();
        assert_eq!(rec.offset, good_len);
    }

    #[test]
    fn test_corrupt_last_record_is_truncated() {
        let dir = TempDir::new().unwrap();
        let good_len;
        {
            let log = LogFile::create(dir.path(), 4).unwrap();
            log.append(key(1), 0, 100, 0, b"kept").unwrap();
            good_len = log.len();
            log.append(key(2), 0, 100, 0, b"mangled").unwrap();
            log.sync().unwrap();
        }

        // flip a payload byte of the final record
        let path = dir.path().join(super::super::log_file_name(4));
        let file = platform::open_read_write(&path).unwrap();
        let mut b = [0u8; 1];
        let off = good_len + FRAME_HEADER_SIZE as u64 + 1;
        platform::read_exact_at(&file, &mut b, off).unwrap();
        b[0] ^= 0xFF;
        platform::write_all_at(&file, &b, off).unwrap();
        drop(file);

        let outcome = LogFile::open(dir.path(), 4).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.log.len(), good_len);
    }

    #[test]
    fn test_corruption_before_tail_is_hard_error() {
        let dir = TempDir::new().unwrap();
        {
            let log = LogFile::create(dir.path(), 5).unwrap();
            log.append(key(1), 0, 100, 0, b"first").unwrap();
            log.append(key(2), 0, 100, 0, b"second").unwrap();
            log.sync().unwrap();
        }

        // flip a byte inside the first record's payload
        let path = dir.path().join(super::super::log_file_name(5));
        let file = platform::open_read_write(&path).unwrap();
        let mut b = [0u8; 1];
        let off = FRAME_HEADER_SIZE as u64;
        platform::read_exact_at(&file, &mut b, off).unwrap();
        b[0] ^= 0xFF;
        platform::write_all_at(&file, &b, off).unwrap();
        drop(file);

        let err = LogFile::open(dir.path(), 5).unwrap_err();
        assert!(err.is_corruption(), "got: {err}");
    }

    #[test]
    fn test_sealed_log_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let log = LogFile::create(dir.path(), 6).unwrap();
        log.seal();
        assert!(matches!(
            log.append(key(1), 0, 100, 0, b"x"),
            Err(Error::Conflict(_))
        ));
    }
}
