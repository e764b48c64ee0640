//! Store: one hash table plus its set of log files
//!
//! A store accepts new records into its active log, serves positioned reads
//! through table lookups, and rewrites itself during compaction. The write
//! lock covers the active log pointer and the table pointer swap; readers
//! take an `Arc` snapshot of the current table and never block.

mod compact;

pub use compact::RetainInfo;

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::log::{self, LogFile, SyncPolicy};
use crate::tbl::{HashTbl, TableStats};
use crate::types::{day_epoch, days_ceil, DayEpoch, Key, Record, FLAG_TRASH};
use crate::{Error, Result};

/// Which on-disk index backs a store. Only the open-addressed hash table
/// exists today; the knob leaves room for a successor format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableKind {
    /// The open-addressed on-disk hash table.
    #[default]
    Hash,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Index implementation backing the store.
    pub table_kind: TableKind,
    /// Size at which the active log is sealed and a successor allocated.
    pub log_target_size: u64,
    /// Minimum time between trash-mark and physical removal.
    pub trash_grace: Duration,
    /// Sync behavior for committed records.
    pub sync_policy: SyncPolicy,
    /// Multiplier inside `free_required = (2 + m) * table_size`.
    pub rewrite_multiple: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_kind: TableKind::default(),
            log_target_size: crate::config::LOG_TARGET_SIZE,
            trash_grace: crate::config::TRASH_GRACE,
            sync_policy: SyncPolicy::default(),
            rewrite_multiple: crate::config::REWRITE_MULTIPLE,
        }
    }
}

struct WriteState {
    active: Arc<LogFile>,
    next_log_id: u32,
    commits_since_sync: usize,
}

/// One half of a DB: a hash table plus its log files.
pub struct Store {
    dir: PathBuf,
    cfg: StoreConfig,
    clock: Arc<dyn Clock>,
    tbl: RwLock<Arc<HashTbl>>,
    logs: RwLock<HashMap<u32, Arc<LogFile>>>,
    write: Mutex<WriteState>,
}

impl Store {
    /// Open (or create) the store rooted at `dir`.
    pub fn open(dir: &Path, cfg: StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<Store>> {
        std::fs::create_dir_all(dir)?;

        // clear out an interrupted compaction
        let tmp = dir.join("tbl.tmp");
        if tmp.exists() {
            warn!("removing in-flight compaction output {}", tmp.display());
            std::fs::remove_file(&tmp)?;
        }

        // walk every log, truncating torn tails
        let mut logs = HashMap::new();
        let mut scanned: Vec<Record> = Vec::new();
        let mut max_id = 0u32;
        let mut names: Vec<u32> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = log::parse_log_file_name(name) {
                    names.push(id);
                }
            }
        }
        names.sort_unstable();
        for id in names {
            let outcome = LogFile::open(dir, id)?;
            outcome.log.seal();
            scanned.extend(outcome.records);
            logs.insert(id, Arc::new(outcome.log));
            max_id = max_id.max(id);
        }

        // the table is authoritative when present (it carries trash flags
        // applied after append); otherwise rebuild it from the scan
        let tbl_path = dir.join("tbl");
        let tbl = match cfg.table_kind {
            TableKind::Hash if tbl_path.exists() => HashTbl::open(&tbl_path)?,
            TableKind::Hash => {
                let tbl =
                    HashTbl::create(&tbl_path, HashTbl::lg_size_for(scanned.len() as u64))?;
                for rec in &scanned {
                    tbl.insert(*rec)?;
                }
                tbl.sync()?;
                tbl
            }
        };

        let next_log_id = max_id + 1;
        let active = Arc::new(LogFile::create(dir, next_log_id)?);
        logs.insert(next_log_id, active.clone());

        info!(
            dir = %dir.display(),
            records = tbl.len(),
            logs = logs.len(),
            "opened store"
        );

        Ok(Arc::new(Store {
            dir: dir.to_path_buf(),
            cfg,
            clock,
            tbl: RwLock::new(Arc::new(tbl)),
            logs: RwLock::new(logs),
            write: Mutex::new(WriteState {
                active,
                next_log_id: next_log_id + 1,
                commits_since_sync: 0,
            }),
        }))
    }

    /// Directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Begin writing a record. Nothing is visible until `finish`.
    pub fn create(self: &Arc<Self>, key: Key, expires: DayEpoch) -> StoreWriter {
        StoreWriter {
            store: self.clone(),
            key,
            expires,
            buf: BytesMut::new(),
        }
    }

    /// Look up a key and expose its payload.
    pub fn read(&self, key: &Key) -> Result<Option<ReadHandle>> {
        let tbl = self.tbl.read().clone();
        let Some(rec) = tbl.lookup(key) else {
            return Ok(None);
        };
        let log = self.log_for(rec.log_id)?;
        Ok(Some(ReadHandle { log, rec, pos: 0 }))
    }

    /// Live record count.
    pub fn record_count(&self) -> u64 {
        self.tbl.read().len()
    }

    /// Table statistics with the compaction headroom applied.
    pub fn stats(&self) -> TableStats {
        self.tbl.read().stats(self.cfg.rewrite_multiple)
    }

    /// Bytes occupied by this store's log files.
    pub fn log_bytes(&self) -> u64 {
        self.logs.read().values().map(|l| l.len()).sum()
    }

    /// Mark a key as trash, starting the grace window. Returns false when
    /// the record was already trash (marking twice is a no-op).
    pub fn set_trash(&self, key: &Key, now: SystemTime) -> Result<bool> {
        let _write = self.write.lock();
        let tbl = self.tbl.read().clone();
        let Some(mut rec) = tbl.lookup(key) else {
            return Err(Error::NotFound("no record for key".to_string()));
        };
        if rec.trash() {
            return Ok(false);
        }
        rec.flags |= FLAG_TRASH;
        rec.expires = day_epoch(now) + days_ceil(self.cfg.trash_grace);
        tbl.insert(rec)?;
        Ok(true)
    }

    /// Clear the trash flag iff the grace window has not yet lapsed.
    pub fn restore(&self, key: &Key, now: SystemTime) -> Result<bool> {
        let _write = self.write.lock();
        let tbl = self.tbl.read().clone();
        let Some(mut rec) = tbl.lookup(key) else {
            return Err(Error::NotFound("no record for key".to_string()));
        };
        if !rec.trash() {
            return Ok(false);
        }
        if rec.expired(day_epoch(now)) {
            return Err(Error::NotFound(
                "trash grace window exhausted".to_string(),
            ));
        }
        rec.flags &= !FLAG_TRASH;
        rec.expires = 0;
        tbl.insert(rec)?;
        Ok(true)
    }

    /// Whether the key currently resolves to a record.
    pub fn contains(&self, key: &Key) -> bool {
        self.tbl.read().lookup(key).is_some()
    }

    /// The table record for a key, if any.
    pub fn lookup(&self, key: &Key) -> Option<Record> {
        self.tbl.read().lookup(key)
    }

    fn log_for(&self, id: u32) -> Result<Arc<LogFile>> {
        if let Some(log) = self.logs.read().get(&id) {
            return Ok(log.clone());
        }
        // the handle cache lost this log (external interference); re-open
        // lazily from the path
        let outcome = LogFile::open(&self.dir, id)?;
        outcome.log.seal();
        let log = Arc::new(outcome.log);
        self.logs.write().insert(id, log.clone());
        Ok(log)
    }

    fn commit(&self, key: Key, expires: DayEpoch, flags: u8, payload: &[u8]) -> Result<Record> {
        if payload.is_empty() {
            return Err(Error::InvalidArgument(
                "record payload must not be empty".to_string(),
            ));
        }
        let mut write = self.write.lock();
        let created = day_epoch(self.clock.now());
        let rec = write.active.append(key, expires, created, flags, payload)?;

        match self.cfg.sync_policy {
            SyncPolicy::Immediate => write.active.sync()?,
            SyncPolicy::EveryN(n) => {
                write.commits_since_sync += 1;
                if write.commits_since_sync >= n {
                    write.active.sync()?;
                    write.commits_since_sync = 0;
                }
            }
            SyncPolicy::None => {}
        }

        // the table insert is the atomic commit point
        let tbl = self.tbl.read().clone();
        tbl.insert(rec)?;
        if tbl.over_load_target() {
            // the record is already committed; growth failure only delays
            // the rebuild until the next commit or compaction
            if let Err(err) = self.grow_table(&tbl) {
                warn!("table growth failed: {err}");
            }
        }

        if write.active.len() >= self.cfg.log_target_size {
            write.active.seal();
            let id = write.next_log_id;
            write.next_log_id += 1;
            let fresh = Arc::new(LogFile::create(&self.dir, id)?);
            self.logs.write().insert(id, fresh.clone());
            info!(sealed = write.active.id(), active = id, "rotated log");
            write.active = fresh;
        }

        Ok(rec)
    }

    /// Rebuild the table one size up. Caller holds the write lock, so no
    /// insert can race the swap.
    fn grow_table(&self, current: &Arc<HashTbl>) -> Result<()> {
        let lg = current.lg_size() + 1;
        info!(lg_size = lg, "growing hash table");
        let tmp = self.dir.join("tbl.tmp");
        let grown = match self.build_table(&tmp, lg, current) {
            Ok(grown) => grown,
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(err);
            }
        };
        *self.tbl.write() = Arc::new(grown);
        Ok(())
    }

    fn build_table(&self, tmp: &Path, lg: u8, current: &Arc<HashTbl>) -> Result<HashTbl> {
        let grown = HashTbl::create(tmp, lg)?;
        for rec in current.records() {
            grown.insert(rec)?;
        }
        grown.sync()?;
        std::fs::rename(tmp, self.dir.join("tbl"))?;
        if let Err(err) = crate::platform::fsync_dir(&self.dir) {
            warn!("directory sync failed after table swap: {err}");
        }
        Ok(grown)
    }
}

/// In-progress record write; buffers until `finish`.
pub struct StoreWriter {
    store: Arc<Store>,
    key: Key,
    expires: DayEpoch,
    buf: BytesMut,
}

impl StoreWriter {
    /// Append bytes to the pending payload.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Bytes buffered so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The key this writer will commit under.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Commit the buffered payload. Dropping the writer instead leaves no
    /// visible record.
    pub fn finish(self) -> Result<Record> {
        self.store.commit(self.key, self.expires, 0, &self.buf)
    }
}

/// Bounded reader over one record's payload.
#[derive(Debug)]
pub struct ReadHandle {
    log: Arc<LogFile>,
    rec: Record,
    pos: u64,
}

impl ReadHandle {
    /// The record this handle reads.
    pub fn record(&self) -> &Record {
        &self.rec
    }

    /// Whether the record is flagged as trash.
    pub fn trash(&self) -> bool {
        self.rec.trash()
    }

    /// Payload length.
    pub fn size(&self) -> u64 {
        self.rec.length as u64
    }

    /// Read the whole payload.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.log.read_payload(&self.rec)
    }

    /// Read an exact range at an absolute payload position.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.log.read_payload_at(&self.rec, pos, buf)
    }
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.rec.length as u64 - self.pos;
        if remaining == 0 {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(remaining) as usize;
        self.log
            .read_payload_at(&self.rec, self.pos, &mut buf[..n])
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}
