//! On-disk open-addressed hash table
//!
//! A power-of-two array of fixed-width slots mapping a key to its log
//! location. Slot index comes from the top bits of the key; collisions
//! probe forward; a lookup stops at the first empty slot. Inserts are
//! write-through: the in-memory slot array and the backing file are updated
//! together. A replacement table is always built under a temporary name and
//! atomically renamed into place by the store.

mod slot;

pub use slot::{SLOT_SIZE, TBL_HEADER_SIZE};

use std::fs::File;
use std::path::Path;

use parking_lot::Mutex;

use crate::platform;
use crate::types::{Key, Record};
use crate::{Error, Result};

/// Load factor above which the store grows the table.
pub const LOAD_FACTOR_MAX: f64 = 0.75;

/// Smallest table: 2^6 = 64 slots.
pub const MIN_LG_SIZE: u8 = 6;

/// Largest table: 2^40 slots.
pub const MAX_LG_SIZE: u8 = 40;

/// Aggregate statistics for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TableStats {
    /// Bytes occupied by the table file.
    pub table_size: u64,
    /// Live records referenced by the table.
    pub records: u64,
    /// Payload bytes referenced by the table.
    pub bytes_referenced: u64,
    /// Records currently flagged as trash.
    pub trash_records: u64,
    /// Headroom a compaction of this table needs.
    pub free_required: u64,
}

#[derive(Debug)]
struct Inner {
    file: File,
    slots: Vec<Option<Record>>,
    used: usize,
    bytes_referenced: u64,
    trash_records: u64,
}

/// One hash table, shared between readers as an `Arc` snapshot.
#[derive(Debug)]
pub struct HashTbl {
    lg_size: u8,
    mask: u64,
    inner: Mutex<Inner>,
}

impl HashTbl {
    /// Create an empty table backed by the file at `path`.
    pub fn create(path: &Path, lg_size: u8) -> Result<HashTbl> {
        if !(MIN_LG_SIZE..=MAX_LG_SIZE).contains(&lg_size) {
            return Err(Error::Config(format!(
                "table lg_size {lg_size} out of range"
            )));
        }
        let file = platform::create_file(path)?;
        let num_slots = 1u64 << lg_size;
        file.set_len(TBL_HEADER_SIZE as u64 + num_slots * SLOT_SIZE as u64)?;
        platform::write_all_at(&file, &slot::encode_header(lg_size), 0)?;
        platform::fsync(&file)?;

        Ok(HashTbl {
            lg_size,
            mask: num_slots - 1,
            inner: Mutex::new(Inner {
                file,
                slots: vec![None; num_slots as usize],
                used: 0,
                bytes_referenced: 0,
                trash_records: 0,
            }),
        })
    }

    /// Open an existing table, verifying every occupied slot's checksum.
    pub fn open(path: &Path) -> Result<HashTbl> {
        let file = platform::open_read_write(path)?;
        let mut header = [0u8; TBL_HEADER_SIZE];
        platform::read_exact_at(&file, &mut header, 0)
            .map_err(|_| Error::Corrupt("hash table header unreadable".to_string()))?;
        let lg_size = slot::decode_header(&header)?;
        let num_slots = 1usize << lg_size;

        let mut raw = vec![0u8; num_slots * SLOT_SIZE];
        platform::read_exact_at(&file, &mut raw, TBL_HEADER_SIZE as u64)
            .map_err(|_| Error::Corrupt("hash table truncated".to_string()))?;

        let mut slots = vec![None; num_slots];
        let mut used = 0;
        let mut bytes_referenced = 0;
        let mut trash_records = 0;
        for (i, chunk) in raw.chunks_exact(SLOT_SIZE).enumerate() {
            if let Some(rec) = slot::decode(chunk)? {
                used += 1;
                bytes_referenced += rec.length as u64;
                if rec.trash() {
                    trash_records += 1;
                }
                slots[i] = Some(rec);
            }
        }

        Ok(HashTbl {
            lg_size,
            mask: num_slots as u64 - 1,
            inner: Mutex::new(Inner {
                file,
                slots,
                used,
                bytes_referenced,
                trash_records,
            }),
        })
    }

    /// log2 of the slot count.
    pub fn lg_size(&self) -> u8 {
        self.lg_size
    }

    /// Total slots.
    pub fn num_slots(&self) -> u64 {
        self.mask + 1
    }

    /// Live records.
    pub fn len(&self) -> u64 {
        self.inner.lock().used as u64
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the table file occupies.
    pub fn size_bytes(&self) -> u64 {
        TBL_HEADER_SIZE as u64 + self.num_slots() * SLOT_SIZE as u64
    }

    /// Whether an additional insert should trigger growth.
    pub fn over_load_target(&self) -> bool {
        let inner = self.inner.lock();
        (inner.used + 1) as f64 / self.num_slots() as f64 > LOAD_FACTOR_MAX
    }

    fn slot_index(&self, key: &Key) -> u64 {
        let prefix = u64::from_be_bytes(key[0..8].try_into().unwrap());
        prefix >> (64 - self.lg_size as u32)
    }

    /// Look a key up.
    pub fn lookup(&self, key: &Key) -> Option<Record> {
        let inner = self.inner.lock();
        let mut idx = self.slot_index(key);
        for _ in 0..=self.mask {
            match &inner.slots[idx as usize] {
                None => return None,
                Some(rec) if rec.key == *key => return Some(*rec),
                Some(_) => idx = (idx + 1) & self.mask,
            }
        }
        None
    }

    /// Insert or overwrite a record, writing the slot through to disk.
    pub fn insert(&self, rec: Record) -> Result<()> {
        if rec.length == 0 {
            return Err(Error::InvalidArgument(
                "record length must be > 0".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let mut idx = self.slot_index(&rec.key);
        for _ in 0..=self.mask {
            match inner.slots[idx as usize] {
                Some(existing) if existing.key != rec.key => {
                    idx = (idx + 1) & self.mask;
                    continue;
                }
                Some(existing) => {
                    inner.bytes_referenced -= existing.length as u64;
                    if existing.trash() {
                        inner.trash_records -= 1;
                    }
                }
                None => {
                    inner.used += 1;
                }
            }
            inner.bytes_referenced += rec.length as u64;
            if rec.trash() {
                inner.trash_records += 1;
            }
            inner.slots[idx as usize] = Some(rec);
            let off = TBL_HEADER_SIZE as u64 + idx * SLOT_SIZE as u64;
            platform::write_all_at(&inner.file, &slot::encode(&rec), off)?;
            return Ok(());
        }
        Err(Error::Capacity(format!(
            "hash table full ({} slots)",
            self.num_slots()
        )))
    }

    /// Snapshot every live record, in slot order.
    pub fn records(&self) -> Vec<Record> {
        let inner = self.inner.lock();
        inner.slots.iter().filter_map(|s| *s).collect()
    }

    /// Statistics with the headroom multiplier applied.
    pub fn stats(&self, rewrite_multiple: f64) -> TableStats {
        let inner = self.inner.lock();
        let table_size = self.size_bytes();
        TableStats {
            table_size,
            records: inner.used as u64,
            bytes_referenced: inner.bytes_referenced,
            trash_records: inner.trash_records,
            free_required: ((2.0 + rewrite_multiple) * table_size as f64) as u64,
        }
    }

    /// Flush slot writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        platform::fsync(&self.inner.lock().file)
    }

    /// The lg_size a fresh table needs to hold `live` records under the
    /// load target.
    pub fn lg_size_for(live: u64) -> u8 {
        let mut lg = MIN_LG_SIZE;
        while lg < MAX_LG_SIZE
            && (live + 1) as f64 / (1u64 << lg) as f64 > LOAD_FACTOR_MAX
        {
            lg += 1;
        }
        lg
    }
}
