//! Retain subsystem: bloom filter and restore time managers
//!
//! The bloom filter manager keeps the most recent retention filter the
//! satellite delivered for each namespace; the restore time manager keeps a
//! per-namespace "do not trash anything created before this" timestamp set
//! when an operator restores. Compaction snapshots both. State persists as
//! one small file per namespace, overwritten via tmp → fsync → rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::bloom::BloomFilter;
use crate::platform;
use crate::types::NodeId;
use crate::{Error, Result};

/// A retention filter push from the satellite.
#[derive(Debug, Clone)]
pub struct RetainRequest {
    /// When the satellite created the filter; pieces newer than this are
    /// never trashed by it.
    pub creation: SystemTime,
    /// Wire-format filter bytes.
    pub filter: Vec<u8>,
}

/// Snapshot of the current filter for one namespace.
pub struct BloomEntry {
    /// Filter creation time.
    pub created: SystemTime,
    /// The decoded filter.
    pub filter: BloomFilter,
}

/// Holds the latest retention filter per namespace.
pub struct BloomFilterManager {
    dir: PathBuf,
    entries: RwLock<HashMap<NodeId, Arc<BloomEntry>>>,
}

impl BloomFilterManager {
    /// Load persisted filters from `dir`.
    pub fn new(dir: &Path) -> Result<BloomFilterManager> {
        std::fs::create_dir_all(dir)?;
        let mut entries = HashMap::new();
        for (node_id, ns_dir) in namespace_dirs(dir)? {
            let path = ns_dir.join("bf");
            if !path.exists() {
                continue;
            }
            match load_bloom_file(&path) {
                Ok(entry) => {
                    entries.insert(node_id, Arc::new(entry));
                }
                Err(err) => warn!("skipping unreadable filter {}: {err}", path.display()),
            }
        }
        info!(filters = entries.len(), "loaded bloom filter manager");
        Ok(BloomFilterManager {
            dir: dir.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    /// Store a new filter for the namespace, replacing any prior one.
    pub fn queue(&self, node_id: NodeId, req: &RetainRequest) -> Result<()> {
        let filter = BloomFilter::from_bytes(&req.filter)?;

        let ns_dir = self.dir.join(node_id.hex());
        std::fs::create_dir_all(&ns_dir)?;
        let secs = req
            .creation
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut data = Vec::with_capacity(8 + req.filter.len());
        data.extend_from_slice(&secs.to_be_bytes());
        data.extend_from_slice(&req.filter);
        write_atomic(&ns_dir.join("bf"), &data)?;

        self.entries.write().insert(
            node_id,
            Arc::new(BloomEntry {
                created: req.creation,
                filter,
            }),
        );
        info!(namespace = %node_id, "queued retention filter");
        Ok(())
    }

    /// Atomic snapshot of the namespace's current filter.
    pub fn snapshot(&self, node_id: NodeId) -> Option<Arc<BloomEntry>> {
        self.entries.read().get(&node_id).cloned()
    }
}

/// Holds the per-namespace restore window start.
pub struct RestoreTimeManager {
    dir: PathBuf,
    entries: RwLock<HashMap<NodeId, SystemTime>>,
}

impl RestoreTimeManager {
    /// Load persisted restore times from `dir`.
    pub fn new(dir: &Path) -> Result<RestoreTimeManager> {
        std::fs::create_dir_all(dir)?;
        let mut entries = HashMap::new();
        for (node_id, ns_dir) in namespace_dirs(dir)? {
            let path = ns_dir.join("restore");
            if !path.exists() {
                continue;
            }
            match std::fs::read(&path) {
                Ok(data) if data.len() == 8 => {
                    let secs = BigEndian::read_u64(&data);
                    entries.insert(node_id, UNIX_EPOCH + Duration::from_secs(secs));
                }
                Ok(_) => warn!("skipping malformed restore file {}", path.display()),
                Err(err) => warn!("skipping unreadable restore file {}: {err}", path.display()),
            }
        }
        Ok(RestoreTimeManager {
            dir: dir.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    /// Record that keys created before `restore_before` must not be
    /// trashed. Setting it in the past has no effect on compaction;
    /// setting it in the future disables trashing for now.
    pub fn set_restore_time(&self, node_id: NodeId, restore_before: SystemTime) -> Result<()> {
        let ns_dir = self.dir.join(node_id.hex());
        std::fs::create_dir_all(&ns_dir)?;
        let secs = restore_before
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        write_atomic(&ns_dir.join("restore"), &secs.to_be_bytes())?;

        self.entries.write().insert(node_id, restore_before);
        info!(namespace = %node_id, "set restore time");
        Ok(())
    }

    /// The namespace's restore window start; the epoch when never set.
    pub fn restore_before(&self, node_id: NodeId) -> SystemTime {
        self.entries
            .read()
            .get(&node_id)
            .copied()
            .unwrap_or(UNIX_EPOCH)
    }
}

fn namespace_dirs(dir: &Path) -> Result<Vec<(NodeId, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        match NodeId::from_hex(name) {
            Ok(node_id) => out.push((node_id, entry.path())),
            Err(_) => warn!("ignoring foreign directory {name}"),
        }
    }
    Ok(out)
}

fn load_bloom_file(path: &Path) -> Result<BloomEntry> {
    let data = std::fs::read(path)?;
    if data.len() < 8 {
        return Err(Error::Corrupt(format!(
            "retain file {} too short",
            path.display()
        )));
    }
    let secs = BigEndian::read_u64(&data[..8]);
    Ok(BloomEntry {
        created: UNIX_EPOCH + Duration::from_secs(secs),
        filter: BloomFilter::from_bytes(&data[8..])?,
    })
}

/// Overwrite-in-place with crash safety: tmp file → fsync → rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let file = platform::create_file(&tmp)?;
    platform::write_all_at(&file, data, 0)?;
    platform::fsync(&file)?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        platform::fsync_dir(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    fn request(secs: u64, keys: &[[u8; 32]]) -> RetainRequest {
        let mut filter = BloomFilter::optimal(1000, 0.01);
        for k in keys {
            filter.add(k);
        }
        RetainRequest {
            creation: UNIX_EPOCH + Duration::from_secs(secs),
            filter: filter.to_bytes(),
        }
    }

    #[test]
    fn test_queue_and_snapshot() {
        let dir = TempDir::new().unwrap();
        let bfm = BloomFilterManager::new(dir.path()).unwrap();

        assert!(bfm.snapshot(node(1)).is_none());

        bfm.queue(node(1), &request(5000, &[[7u8; 32]])).unwrap();
        let entry = bfm.snapshot(node(1)).unwrap();
        assert_eq!(entry.created, UNIX_EPOCH + Duration::from_secs(5000));
        assert!(entry.filter.may_contain(&[7u8; 32]));
        assert!(!entry.filter.may_contain(&[9u8; 32]));

        // namespaces are independent
        assert!(bfm.snapshot(node(2)).is_none());
    }

    #[test]
    fn test_queue_overwrites() {
        let dir = TempDir::new().unwrap();
        let bfm = BloomFilterManager::new(dir.path()).unwrap();

        bfm.queue(node(1), &request(1000, &[[1u8; 32]])).unwrap();
        bfm.queue(node(1), &request(2000, &[[2u8; 32]])).unwrap();

        let entry = bfm.snapshot(node(1)).unwrap();
        assert_eq!(entry.created, UNIX_EPOCH + Duration::from_secs(2000));
        assert!(entry.filter.may_contain(&[2u8; 32]));
    }

    #[test]
    fn test_bloom_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let bfm = BloomFilterManager::new(dir.path()).unwrap();
            bfm.queue(node(3), &request(7777, &[[3u8; 32]])).unwrap();
        }

        let bfm = BloomFilterManager::new(dir.path()).unwrap();
        let entry = bfm.snapshot(node(3)).unwrap();
        assert_eq!(entry.created, UNIX_EPOCH + Duration::from_secs(7777));
        assert!(entry.filter.may_contain(&[3u8; 32]));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let dir = TempDir::new().unwrap();
        let bfm = BloomFilterManager::new(dir.path()).unwrap();
        let req = RetainRequest {
            creation: UNIX_EPOCH,
            filter: vec![],
        };
        assert!(bfm.queue(node(1), &req).is_err());
    }

    #[test]
    fn test_restore_time_set_and_default() {
        let dir = TempDir::new().unwrap();
        let rtm = RestoreTimeManager::new(dir.path()).unwrap();

        assert_eq!(rtm.restore_before(node(1)), UNIX_EPOCH);

        let t = UNIX_EPOCH + Duration::from_secs(123_456);
        rtm.set_restore_time(node(1), t).unwrap();
        assert_eq!(rtm.restore_before(node(1)), t);
    }

    #[test]
    fn test_restore_time_persistence() {
        let dir = TempDir::new().unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(987_654);
        {
            let rtm = RestoreTimeManager::new(dir.path()).unwrap();
            rtm.set_restore_time(node(5), t).unwrap();
        }

        let rtm = RestoreTimeManager::new(dir.path()).unwrap();
        assert_eq!(rtm.restore_before(node(5)), t);
    }
}
