//! DB: two stores behind one namespace
//!
//! A DB owns the s0/s1 store pair for one satellite. Writes land in the
//! store currently holding fewer records (ties to s0), reads consult both
//! with the newer record winning, and compaction runs the two stores
//! sequentially so the namespace never needs headroom for more than one
//! table rewrite at a time.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::store::{ReadHandle, RetainInfo, Store, StoreConfig, StoreWriter};
use crate::tbl::TableStats;
use crate::types::{DayEpoch, Key, NodeId};
use crate::{Error, Result};

/// Aggregate statistics for a DB.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    /// Live records across both stores.
    pub records: u64,
    /// Bytes used by logs and tables.
    pub used_total: u64,
    /// Bytes used by the two hash tables.
    pub used_for_metadata: u64,
    /// Headroom required for the next compaction.
    pub reserved: u64,
}

/// Two stores for one namespace.
pub struct Db {
    node_id: NodeId,
    s0: Arc<Store>,
    s1: Arc<Store>,
    compacting: AtomicBool,
}

impl Db {
    /// Open the DB under `<root>/<namespace-hex>/`.
    pub fn open(
        root: &Path,
        node_id: NodeId,
        cfg: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Db>> {
        let dir = root.join(node_id.hex());
        let s0 = Store::open(&dir.join("s0"), cfg.clone(), clock.clone())?;
        let s1 = Store::open(&dir.join("s1"), cfg, clock)?;
        info!(namespace = %node_id, "opened db");
        Ok(Arc::new(Db {
            node_id,
            s0,
            s1,
            compacting: AtomicBool::new(false),
        }))
    }

    /// The namespace this DB serves.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Begin writing a record into the currently active store: the one
    /// holding fewer records, ties to s0.
    pub fn create(&self, key: Key, expires: DayEpoch) -> StoreWriter {
        if self.s1.record_count() < self.s0.record_count() {
            self.s1.create(key, expires)
        } else {
            self.s0.create(key, expires)
        }
    }

    /// Read a key, consulting both stores; if both hit, the newer record
    /// wins.
    pub fn read(&self, key: &Key) -> Result<Option<ReadHandle>> {
        self.owning_store(key).read(key)
    }

    /// Whether either store holds the key.
    pub fn contains(&self, key: &Key) -> bool {
        self.s0.contains(key) || self.s1.contains(key)
    }

    /// The store whose record for `key` a read would return.
    fn owning_store(&self, key: &Key) -> &Arc<Store> {
        match (self.s0.lookup(key), self.s1.lookup(key)) {
            (Some(a), Some(b)) => {
                if b.created > a.created || (b.created == a.created && a.trash() && !b.trash()) {
                    &self.s1
                } else {
                    &self.s0
                }
            }
            (None, Some(_)) => &self.s1,
            _ => &self.s0,
        }
    }

    /// Mark a key as trash in whichever store holds it.
    pub fn set_trash(&self, key: &Key, now: SystemTime) -> Result<bool> {
        self.owning_store(key).set_trash(key, now)
    }

    /// Clear a key's trash flag iff the grace window still runs.
    pub fn restore(&self, key: &Key, now: SystemTime) -> Result<bool> {
        self.owning_store(key).restore(key, now)
    }

    /// Compact both stores sequentially. A second concurrent call is
    /// rejected; this is what keeps `reserved` a max rather than a sum.
    pub fn compact(
        &self,
        token: &CancellationToken,
        retain: Option<RetainInfo<'_>>,
        restore_before: SystemTime,
    ) -> Result<()> {
        if self.compacting.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict(format!(
                "namespace {} is already compacting",
                self.node_id
            )));
        }
        let _guard = CompactGuard(&self.compacting);

        for store in [&self.s0, &self.s1] {
            let retain = retain.as_ref().map(|r| RetainInfo {
                filter: r.filter,
                created: r.created,
            });
            store.compact(token, retain, restore_before)?;
        }
        Ok(())
    }

    /// Aggregate and per-store statistics.
    pub fn stats(&self) -> (DbStats, TableStats, TableStats) {
        let t0 = self.s0.stats();
        let t1 = self.s1.stats();
        let log_bytes = self.s0.log_bytes() + self.s1.log_bytes();
        let metadata = t0.table_size + t1.table_size;
        let db = DbStats {
            records: t0.records + t1.records,
            used_total: log_bytes + metadata,
            used_for_metadata: metadata,
            reserved: t0.free_required.max(t1.free_required),
        };
        (db, t0, t1)
    }
}

struct CompactGuard<'a>(&'a AtomicBool);

impl Drop for CompactGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, FakeClock};
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn key(b: u8) -> Key {
        let mut k = [b; 32];
        k[0] = b.wrapping_mul(83);
        k
    }

    fn put(db: &Db, k: Key, data: &[u8]) {
        let mut wr = db.create(k, 0);
        wr.write(data);
        wr.finish().unwrap();
    }

    #[test]
    fn test_writes_balance_across_stores() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), NodeId::default(), StoreConfig::default(), system_clock()).unwrap();

        for i in 0..10u8 {
            put(&db, key(i), b"data");
        }

        // fewest-records-wins keeps the pair balanced
        assert_eq!(db.s0.record_count(), 5);
        assert_eq!(db.s1.record_count(), 5);

        for i in 0..10u8 {
            assert!(db.read(&key(i)).unwrap().is_some());
        }
    }

    #[test]
    fn test_newer_record_wins_on_double_hit() {
        let dir = TempDir::new().unwrap();
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(20_000 * 86_400));
        let db = Db::open(dir.path(), NodeId::default(), StoreConfig::default(), clock.clone()).unwrap();

        // place the same key in both stores with different creation days
        {
            let mut wr = db.s0.create(key(1), 0);
            wr.write(b"old");
            wr.finish().unwrap();
        }
        clock.advance(Duration::from_secs(2 * 86_400));
        {
            let mut wr = db.s1.create(key(1), 0);
            wr.write(b"new");
            wr.finish().unwrap();
        }

        let handle = db.read(&key(1)).unwrap().unwrap();
        assert_eq!(handle.read_all().unwrap(), b"new");
    }

    #[test]
    fn test_trash_routes_to_owning_store() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), NodeId::default(), StoreConfig::default(), system_clock()).unwrap();

        put(&db, key(1), b"a");
        put(&db, key(2), b"b");

        assert!(db.set_trash(&key(2), SystemTime::now()).unwrap());
        assert!(db.read(&key(2)).unwrap().unwrap().trash());
        assert!(!db.read(&key(1)).unwrap().unwrap().trash());

        assert!(db.restore(&key(2), SystemTime::now()).unwrap());
        assert!(!db.read(&key(2)).unwrap().unwrap().trash());
    }

    #[test]
    fn test_trash_missing_key_not_found() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), NodeId::default(), StoreConfig::default(), system_clock()).unwrap();
        assert!(db.set_trash(&key(9), SystemTime::now()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_compact_both_stores_and_accounting() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), NodeId::default(), StoreConfig::default(), system_clock()).unwrap();

        for i in 0..6u8 {
            put(&db, key(i), &[i; 64]);
        }
        db.compact(&CancellationToken::new(), None, UNIX_EPOCH).unwrap();

        for i in 0..6u8 {
            assert!(db.read(&key(i)).unwrap().is_some());
        }

        let (stats, t0, t1) = db.stats();
        assert_eq!(stats.used_for_metadata, t0.table_size + t1.table_size);
        assert_eq!(stats.reserved, t0.free_required.max(t1.free_required));
        assert!(stats.used_total > stats.used_for_metadata);
    }

    #[test]
    fn test_concurrent_compaction_rejected() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), NodeId::default(), StoreConfig::default(), system_clock()).unwrap();

        db.compacting.store(true, Ordering::SeqCst);
        let err = db.compact(&CancellationToken::new(), None, UNIX_EPOCH).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        db.compacting.store(false, Ordering::SeqCst);
        db.compact(&CancellationToken::new(), None, UNIX_EPOCH).unwrap();
    }
}
