//! Store compaction
//!
//! Rewrites the store: every live record is re-evaluated against its
//! expiration, the trash grace window, and the satellite's current bloom
//! filter, then survivors are appended into a freshly allocated log and a
//! replacement hash table is atomically renamed into place. The write lock
//! is held throughout, so creators wait while readers continue against the
//! prior table snapshot.

use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Store;
use crate::bloom::BloomFilter;
use crate::log::LogFile;
use crate::platform;
use crate::tbl::HashTbl;
use crate::types::{day_epoch, days_ceil, FLAG_TRASH};
use crate::{Error, Result};

/// The retention filter consulted while compacting: the satellite's latest
/// bloom filter and when it was created.
pub struct RetainInfo<'a> {
    /// Keys present in the filter are retained.
    pub filter: &'a BloomFilter,
    /// Creation time of the filter; only records created at or before this
    /// are eligible for trashing.
    pub created: SystemTime,
}

/// What one compaction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactOutcome {
    /// Records rewritten into the new log.
    pub kept: u64,
    /// Records dropped (expired, or trash past grace).
    pub dropped: u64,
    /// Records newly flagged as trash by the bloom filter.
    pub trashed: u64,
}

impl Store {
    /// Run one compaction pass. Cancellation or failure before the table
    /// rename unlinks the partial output and leaves the prior state
    /// authoritative.
    pub fn compact(
        &self,
        token: &CancellationToken,
        retain: Option<RetainInfo<'_>>,
        restore_before: SystemTime,
    ) -> Result<CompactOutcome> {
        let mut write = self.write.lock();
        let records = self.tbl.read().records();

        let out_id = write.next_log_id;
        write.next_log_id += 1;
        let out = Arc::new(LogFile::create(&self.dir, out_id)?);
        let tmp = self.dir.join("tbl.tmp");

        let (outcome, new_tbl) =
            match self.rewrite(token, records, retain, restore_before, &out, &tmp) {
                Ok(result) => result,
                Err(err) => {
                    let _ = platform::remove(out.path());
                    let _ = std::fs::remove_file(&tmp);
                    return Err(err);
                }
            };

        // the rename inside rewrite made the new table authoritative
        *self.tbl.write() = Arc::new(new_tbl);

        // retire every prior log; in-flight readers hold their own handles
        let old_logs: Vec<Arc<LogFile>> = {
            let mut logs = self.logs.write();
            let old = logs.values().cloned().collect();
            logs.clear();
            logs.insert(out_id, out.clone());
            old
        };
        for log in old_logs {
            if let Err(err) = platform::remove(log.path()) {
                warn!("failed to unlink obsolete log {}: {err}", log.path().display());
            }
        }
        write.active = out;

        info!(
            dir = %self.dir.display(),
            kept = outcome.kept,
            dropped = outcome.dropped,
            trashed = outcome.trashed,
            "compaction finished"
        );
        Ok(outcome)
    }

    /// Apply the per-record policy, rewrite survivors into `out`, and
    /// build and rename the replacement table under `tmp`.
    fn rewrite(
        &self,
        token: &CancellationToken,
        records: Vec<crate::types::Record>,
        retain: Option<RetainInfo<'_>>,
        restore_before: SystemTime,
        out: &LogFile,
        tmp: &std::path::Path,
    ) -> Result<(CompactOutcome, HashTbl)> {
        let today = day_epoch(self.clock.now());
        let grace_days = days_ceil(self.cfg.trash_grace);
        let restore_day = day_epoch(restore_before);

        let mut outcome = CompactOutcome::default();
        let mut kept = Vec::with_capacity(records.len());
        for mut rec in records {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // expired records and trash past its grace window drop out
            if rec.expired(today) {
                outcome.dropped += 1;
                continue;
            }

            // a key absent from a filter that post-dates its creation is
            // garbage, unless the restore window shields it
            if let Some(ref retain) = retain {
                let filter_day = day_epoch(retain.created);
                if !rec.trash()
                    && rec.created <= filter_day
                    && !retain.filter.may_contain(&rec.key)
                    && rec.created > restore_day
                {
                    rec.flags |= FLAG_TRASH;
                    rec.expires = today + grace_days;
                    outcome.trashed += 1;
                }
            }

            let payload = match self
                .log_for(rec.log_id)
                .and_then(|log| log.read_payload(&rec))
            {
                Ok(payload) => payload,
                Err(err) => {
                    // a dangling reference (e.g. past a truncated tail) is
                    // unrecoverable garbage
                    warn!(
                        log_id = rec.log_id,
                        offset = rec.offset,
                        "dropping unreadable record: {err}"
                    );
                    outcome.dropped += 1;
                    continue;
                }
            };

            kept.push(out.append(rec.key, rec.expires, rec.created, rec.flags, &payload)?);
            outcome.kept += 1;
        }
        out.sync()?;

        // the new table becomes authoritative at the rename
        let new_tbl = HashTbl::create(tmp, HashTbl::lg_size_for(kept.len() as u64))?;
        for rec in &kept {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            new_tbl.insert(*rec)?;
        }
        new_tbl.sync()?;
        std::fs::rename(tmp, self.dir.join("tbl"))?;
        // past the rename the new table is authoritative; a directory sync
        // failure must not trigger output cleanup
        if let Err(err) = platform::fsync_dir(&self.dir) {
            warn!("directory sync failed after table swap: {err}");
        }

        Ok((outcome, new_tbl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use crate::store::StoreConfig;
    use crate::types::Key;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn key(b: u8) -> Key {
        let mut k = [b; 32];
        k[0] = b.wrapping_mul(83);
        k
    }

    fn store_at_day(dir: &std::path::Path, day: u64) -> (Arc<Store>, Arc<FakeClock>) {
        let clock = FakeClock::new(UNIX_EPOCH + DAY * day as u32);
        let store = Store::open(dir, StoreConfig::default(), clock.clone()).unwrap();
        (store, clock)
    }

    fn put(store: &Arc<Store>, k: Key, expires: u32, data: &[u8]) {
        let mut wr = store.create(k, expires);
        wr.write(data);
        wr.finish().unwrap();
    }

    #[test]
    fn test_compact_keeps_live_records() {
        let dir = TempDir::new().unwrap();
        let (store, _clock) = store_at_day(dir.path(), 20_000);
        put(&store, key(1), 0, b"one");
        put(&store, key(2), 0, b"two");

        let outcome = store
            .compact(&CancellationToken::new(), None, UNIX_EPOCH)
            .unwrap();
        assert_eq!(outcome, CompactOutcome { kept: 2, dropped: 0, trashed: 0 });

        assert_eq!(store.read(&key(1)).unwrap().unwrap().read_all().unwrap(), b"one");
        assert_eq!(store.read(&key(2)).unwrap().unwrap().read_all().unwrap(), b"two");
        // all data now lives in a single log
        assert_eq!(store.logs.read().len(), 1);
    }

    #[test]
    fn test_compact_drops_expired() {
        let dir = TempDir::new().unwrap();
        let (store, _clock) = store_at_day(dir.path(), 20_000);
        put(&store, key(1), 19_999, b"stale");
        put(&store, key(2), 20_001, b"fresh");
        put(&store, key(3), 0, b"forever");

        let outcome = store
            .compact(&CancellationToken::new(), None, UNIX_EPOCH)
            .unwrap();
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.kept, 2);
        assert!(store.read(&key(1)).unwrap().is_none());
        assert!(store.read(&key(2)).unwrap().is_some());
        assert!(store.read(&key(3)).unwrap().is_some());
    }

    #[test]
    fn test_bloom_filter_marks_trash_two_phase() {
        let dir = TempDir::new().unwrap();
        let (store, clock) = store_at_day(dir.path(), 20_000);
        put(&store, key(1), 0, b"retained");
        put(&store, key(2), 0, b"garbage");

        let mut filter = BloomFilter::optimal(100, 0.01);
        filter.add(&key(1));
        let retain = RetainInfo {
            filter: &filter,
            created: clock.now() + DAY,
        };

        let token = CancellationToken::new();
        let outcome = store.compact(&token, Some(retain), UNIX_EPOCH).unwrap();
        assert_eq!(outcome.trashed, 1);
        assert_eq!(outcome.kept, 2);

        // phase one: still readable, flagged as trash
        let handle = store.read(&key(2)).unwrap().unwrap();
        assert!(handle.trash());
        assert_eq!(handle.read_all().unwrap(), b"garbage");
        assert!(!store.read(&key(1)).unwrap().unwrap().trash());

        // phase two: after the grace window the record drops
        clock.advance(crate::config::TRASH_GRACE + DAY);
        let outcome = store.compact(&token, None, UNIX_EPOCH).unwrap();
        assert_eq!(outcome.dropped, 1);
        assert!(store.read(&key(2)).unwrap().is_none());
        assert!(store.read(&key(1)).unwrap().is_some());
    }

    #[test]
    fn test_restore_window_shields_from_trash() {
        let dir = TempDir::new().unwrap();
        let (store, clock) = store_at_day(dir.path(), 20_000);
        put(&store, key(1), 0, b"shielded");

        // empty filter created in the future would trash everything, but
        // the restore window covers the record's creation day
        let filter = BloomFilter::optimal(100, 0.01);
        let retain = RetainInfo {
            filter: &filter,
            created: clock.now() + DAY,
        };
        let restore_before = clock.now() + DAY;

        let outcome = store
            .compact(&CancellationToken::new(), Some(retain), restore_before)
            .unwrap();
        assert_eq!(outcome.trashed, 0);
        assert!(!store.read(&key(1)).unwrap().unwrap().trash());
    }

    #[test]
    fn test_filter_older_than_record_does_not_trash() {
        let dir = TempDir::new().unwrap();
        let (store, clock) = store_at_day(dir.path(), 20_000);
        put(&store, key(1), 0, b"new piece");

        // a filter created before the record existed says nothing about it
        let filter = BloomFilter::optimal(100, 0.01);
        let retain = RetainInfo {
            filter: &filter,
            created: clock.now() - 2 * DAY,
        };

        let outcome = store
            .compact(&CancellationToken::new(), Some(retain), UNIX_EPOCH)
            .unwrap();
        assert_eq!(outcome.trashed, 0);
    }

    #[test]
    fn test_cancellation_preserves_prior_state() {
        let dir = TempDir::new().unwrap();
        let (store, _clock) = store_at_day(dir.path(), 20_000);
        put(&store, key(1), 0, b"survives");

        let token = CancellationToken::new();
        token.cancel();
        let err = store.compact(&token, None, UNIX_EPOCH).unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // prior state still authoritative, no stray output files
        assert_eq!(store.read(&key(1)).unwrap().unwrap().read_all().unwrap(), b"survives");
        assert!(!dir.path().join("tbl.tmp").exists());
    }

    #[test]
    fn test_readers_survive_compaction() {
        let dir = TempDir::new().unwrap();
        let (store, _clock) = store_at_day(dir.path(), 20_000);
        put(&store, key(1), 0, b"still here");

        let handle = store.read(&key(1)).unwrap().unwrap();
        store
            .compact(&CancellationToken::new(), None, UNIX_EPOCH)
            .unwrap();

        // the pre-compaction handle reads through the unlinked log
        assert_eq!(handle.read_all().unwrap(), b"still here");
    }

    #[test]
    fn test_free_required_accounting() {
        let dir = TempDir::new().unwrap();
        let cfg = StoreConfig {
            rewrite_multiple: 2.0,
            ..StoreConfig::default()
        };
        let clock = FakeClock::new(UNIX_EPOCH + DAY * 20_000);
        let store = Store::open(dir.path(), cfg, clock).unwrap();
        put(&store, key(1), 0, b"x");

        let stats = store.stats();
        assert!(stats.table_size > 0);
        assert_eq!(stats.free_required, 4 * stats.table_size);
    }
}
