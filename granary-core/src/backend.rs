//! Piece backend: the storage-node-facing API
//!
//! Wraps one DB per namespace and binds piece integrity to the stored
//! payload: user bytes are hashed as they stream in, and a trailing piece
//! header (declared hash, algorithm, order limit) is appended at commit.
//! `piece_valid` re-derives everything from the stored bytes alone.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::db::Db;
use crate::retain::{BloomFilterManager, RestoreTimeManager};
use crate::store::{ReadHandle, RetainInfo, StoreConfig};
use crate::types::{day_epoch, DayEpoch, HashAlgorithm, NodeId, PieceId};
use crate::{Error, Result};

/// Fixed encoded size of a piece header (version, algorithm, hash length,
/// 32-byte hash, 32-byte order-limit piece id, creation seconds).
const HEADER_ENCODED_SIZE: usize = 1 + 1 + 1 + 32 + 32 + 8;

const HEADER_VERSION: u8 = 1;

/// Order limit the satellite signed for the upload; only the piece id
/// matters for validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderLimit {
    /// The piece the limit was issued for; zero when absent.
    pub piece_id: PieceId,
}

/// Metadata appended at the end of every stored piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceHeader {
    /// Declared hash algorithm.
    pub hash_algorithm: HashAlgorithm,
    /// Declared hash of the data portion; empty or all-zero means "use the
    /// writer's running hash".
    pub hash: Vec<u8>,
    /// The satellite's order limit.
    pub order_limit: OrderLimit,
    /// When the piece was created.
    pub created_at: SystemTime,
}

impl Default for PieceHeader {
    fn default() -> Self {
        PieceHeader {
            hash_algorithm: HashAlgorithm::Sha256,
            hash: Vec::new(),
            order_limit: OrderLimit::default(),
            created_at: UNIX_EPOCH,
        }
    }
}

impl PieceHeader {
    /// Serialize the header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.hash.len() != self.hash_algorithm.digest_len() {
            return Err(Error::InvalidArgument(format!(
                "hash length {} does not match algorithm",
                self.hash.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(HEADER_ENCODED_SIZE);
        buf.put_u8(HEADER_VERSION);
        buf.put_u8(self.hash_algorithm as u8);
        buf.put_u8(self.hash.len() as u8);
        buf.put_slice(&self.hash);
        buf.put_slice(&self.order_limit.piece_id.0);
        let secs = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        buf.put_u64(secs);
        Ok(buf.to_vec())
    }

    /// Strictly parse a header: every field present, nothing trailing.
    pub fn decode(data: &[u8]) -> Result<PieceHeader> {
        if data.len() != HEADER_ENCODED_SIZE {
            return Err(Error::InvalidArgument(format!(
                "piece header length {} invalid",
                data.len()
            )));
        }
        let mut cursor = data;
        let version = cursor.get_u8();
        if version != HEADER_VERSION {
            return Err(Error::InvalidArgument(format!(
                "unknown piece header version {version}"
            )));
        }
        let hash_algorithm = HashAlgorithm::try_from(cursor.get_u8())?;
        let hash_len = cursor.get_u8() as usize;
        if hash_len != hash_algorithm.digest_len() {
            return Err(Error::InvalidArgument(format!(
                "declared hash length {hash_len} does not match algorithm"
            )));
        }
        let mut hash = vec![0u8; hash_len];
        cursor.copy_to_slice(&mut hash);
        let mut piece_id = [0u8; 32];
        cursor.copy_to_slice(&mut piece_id);
        let secs = cursor.get_u64();
        Ok(PieceHeader {
            hash_algorithm,
            hash,
            order_limit: OrderLimit {
                piece_id: PieceId(piece_id),
            },
            created_at: UNIX_EPOCH + Duration::from_secs(secs),
        })
    }
}

/// Validate a stored payload against a piece id: extract the trailing
/// header, recompute the declared hash over the data portion, and compare.
/// Any byte modification of the data portion and any truncation fails.
pub fn piece_valid(piece: &PieceId, bytes: &[u8]) -> bool {
    if bytes.len() < 2 {
        return false;
    }
    let hlen = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]) as usize;
    if bytes.len() < 2 + hlen {
        return false;
    }
    let data_len = bytes.len() - 2 - hlen;
    let Ok(header) = PieceHeader::decode(&bytes[data_len..bytes.len() - 2]) else {
        return false;
    };
    let digest = compute_digest(header.hash_algorithm, &bytes[..data_len]);
    if digest != header.hash {
        return false;
    }
    if !header.order_limit.piece_id.is_zero() && header.order_limit.piece_id != *piece {
        return false;
    }
    true
}

fn compute_digest(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
    }
}

#[derive(Clone)]
enum PieceHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl PieceHasher {
    fn new(algorithm: HashAlgorithm) -> PieceHasher {
        match algorithm {
            HashAlgorithm::Sha256 => PieceHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => PieceHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            PieceHasher::Sha256(h) => h.update(data),
            PieceHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(&self) -> Vec<u8> {
        match self {
            PieceHasher::Sha256(h) => h.clone().finalize().to_vec(),
            PieceHasher::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Space the backend occupies and needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Bytes used by logs and tables across all namespaces.
    pub used_total: u64,
    /// Bytes used by hash tables.
    pub used_for_metadata: u64,
    /// Headroom compaction may need, summed over namespaces.
    pub reserved: u64,
}

/// The storage-node-facing piece store.
pub struct PieceBackend {
    root: PathBuf,
    cfg: StoreConfig,
    clock: Arc<dyn Clock>,
    bfm: Option<Arc<BloomFilterManager>>,
    rtm: Option<Arc<RestoreTimeManager>>,
    dbs: RwLock<HashMap<NodeId, Arc<Db>>>,
}

impl PieceBackend {
    /// Open the backend rooted at `root`, loading every existing
    /// namespace.
    pub fn new(
        root: &Path,
        cfg: StoreConfig,
        clock: Arc<dyn Clock>,
        bfm: Option<Arc<BloomFilterManager>>,
        rtm: Option<Arc<RestoreTimeManager>>,
    ) -> Result<PieceBackend> {
        std::fs::create_dir_all(root)?;

        let mut dbs = HashMap::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(node_id) = NodeId::from_hex(name) else {
                warn!("ignoring foreign directory {name}");
                continue;
            };
            match Db::open(root, node_id, cfg.clone(), clock.clone()) {
                Ok(db) => {
                    dbs.insert(node_id, db);
                }
                Err(err) => warn!(namespace = %node_id, "failed to load namespace: {err}"),
            }
        }
        info!(namespaces = dbs.len(), "opened piece backend");

        Ok(PieceBackend {
            root: root.to_path_buf(),
            cfg,
            clock,
            bfm,
            rtm,
            dbs: RwLock::new(dbs),
        })
    }

    /// Get or lazily open the DB for a namespace.
    pub fn db(&self, node_id: NodeId) -> Result<Arc<Db>> {
        if let Some(db) = self.dbs.read().get(&node_id) {
            return Ok(db.clone());
        }
        // the write lock serializes first-open so two callers never race
        // the same directory
        let mut dbs = self.dbs.write();
        if let Some(db) = dbs.get(&node_id) {
            return Ok(db.clone());
        }
        let db = Db::open(&self.root, node_id, self.cfg.clone(), self.clock.clone())?;
        dbs.insert(node_id, db.clone());
        Ok(db)
    }

    /// Begin writing a piece.
    pub fn writer(
        &self,
        node_id: NodeId,
        piece: PieceId,
        algorithm: HashAlgorithm,
        expiration: Option<SystemTime>,
    ) -> Result<PieceWriter> {
        let db = self.db(node_id)?;
        Ok(PieceWriter {
            db,
            piece,
            algorithm,
            expires: expiration.map(day_epoch).unwrap_or(0),
            hasher: PieceHasher::new(algorithm),
            buf: BytesMut::new(),
            clock: self.clock.clone(),
        })
    }

    /// Open a piece for reading.
    pub fn reader(&self, node_id: NodeId, piece: PieceId) -> Result<PieceReader> {
        let db = self.db(node_id)?;
        let handle = db
            .read(&piece.key())?
            .ok_or_else(|| Error::NotFound(format!("piece {piece:?} not stored")))?;
        PieceReader::new(handle)
    }

    /// Flag a piece as trash; compaction drops it after the grace window.
    pub fn trash(&self, node_id: NodeId, piece: PieceId, now: SystemTime) -> Result<()> {
        self.db(node_id)?.set_trash(&piece.key(), now)?;
        Ok(())
    }

    /// Un-trash a piece, if its grace window still runs.
    pub fn restore(&self, node_id: NodeId, piece: PieceId) -> Result<()> {
        let now = self.clock.now();
        self.db(node_id)?.restore(&piece.key(), now)?;
        Ok(())
    }

    /// Compact one namespace, consulting the retain subsystem.
    pub fn compact(&self, node_id: NodeId, token: &CancellationToken) -> Result<()> {
        let db = self.db(node_id)?;
        let snapshot = self.bfm.as_ref().and_then(|bfm| bfm.snapshot(node_id));
        let restore_before = self
            .rtm
            .as_ref()
            .map(|rtm| rtm.restore_before(node_id))
            .unwrap_or(UNIX_EPOCH);
        let retain = snapshot.as_ref().map(|entry| RetainInfo {
            filter: &entry.filter,
            created: entry.created,
        });
        db.compact(token, retain, restore_before)
    }

    /// Compact every namespace in turn.
    pub fn compact_all(&self, token: &CancellationToken) -> Result<()> {
        let namespaces: Vec<NodeId> = self.dbs.read().keys().copied().collect();
        for node_id in namespaces {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.compact(node_id, token)?;
        }
        Ok(())
    }

    /// Background compaction at a fixed cadence until cancelled.
    pub async fn run_compaction_loop(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(err) = self.compact_all(&token) {
                if matches!(err, Error::Cancelled) {
                    return;
                }
                warn!("background compaction failed: {err}");
            }
        }
    }

    /// Aggregate space accounting across namespaces.
    pub fn space_usage(&self) -> SpaceUsage {
        let dbs = self.dbs.read();
        let mut usage = SpaceUsage::default();
        for db in dbs.values() {
            let (stats, _, _) = db.stats();
            usage.used_total += stats.used_total;
            usage.used_for_metadata += stats.used_for_metadata;
            usage.reserved += stats.reserved;
        }
        usage
    }
}

/// In-progress piece upload; hashes user bytes as they arrive.
pub struct PieceWriter {
    db: Arc<Db>,
    piece: PieceId,
    algorithm: HashAlgorithm,
    expires: DayEpoch,
    hasher: PieceHasher,
    buf: BytesMut,
    clock: Arc<dyn Clock>,
}

impl PieceWriter {
    /// Append user bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.buf.put_slice(data);
    }

    /// The running hash over everything written so far.
    pub fn hash(&self) -> Vec<u8> {
        self.hasher.finalize()
    }

    /// Commit the piece: bind the header to the data and store both.
    /// Dropping the writer instead leaves nothing visible.
    pub fn commit(self, mut header: PieceHeader) -> Result<()> {
        let computed = self.hasher.finalize();
        if header.hash.is_empty() || header.hash.iter().all(|b| *b == 0) {
            header.hash = computed;
        } else if header.hash != computed {
            return Err(Error::InvalidArgument(
                "declared hash does not match written data".to_string(),
            ));
        }
        if header.created_at == UNIX_EPOCH {
            header.created_at = self.clock.now();
        }
        if header.hash_algorithm != self.algorithm {
            return Err(Error::InvalidArgument(
                "header algorithm does not match writer".to_string(),
            ));
        }
        let header_bytes = header.encode()?;

        // re-committing a live piece is rejected rather than silently
        // overwritten
        if let Some(existing) = self.db.read(&self.piece.key())? {
            if !existing.trash() {
                return Err(Error::Conflict(format!(
                    "piece {:?} already stored",
                    self.piece
                )));
            }
        }

        let mut wr = self.db.create(self.piece.key(), self.expires);
        wr.write(&self.buf);
        wr.write(&header_bytes);
        wr.write(&(header_bytes.len() as u16).to_be_bytes());
        wr.finish()?;
        Ok(())
    }
}

/// Reader over a stored piece's data portion.
#[derive(Debug)]
pub struct PieceReader {
    handle: ReadHandle,
    data_len: u64,
    pos: u64,
}

impl PieceReader {
    fn new(handle: ReadHandle) -> Result<PieceReader> {
        let total = handle.size();
        if total < 2 {
            return Err(Error::Corrupt("piece too short for trailer".to_string()));
        }
        let mut len_buf = [0u8; 2];
        handle.read_at(total - 2, &mut len_buf)?;
        let hlen = u16::from_be_bytes(len_buf) as u64;
        if total < 2 + hlen {
            return Err(Error::Corrupt(format!(
                "piece trailer length {hlen} exceeds payload"
            )));
        }
        Ok(PieceReader {
            handle,
            data_len: total - 2 - hlen,
            pos: 0,
        })
    }

    /// Whether the underlying record is flagged as trash.
    pub fn trash(&self) -> bool {
        self.handle.trash()
    }

    /// Length of the data portion.
    pub fn size(&self) -> u64 {
        self.data_len
    }

    /// Decode the stored piece header.
    pub fn header(&self) -> Result<PieceHeader> {
        let hlen = (self.handle.size() - 2 - self.data_len) as usize;
        let mut buf = vec![0u8; hlen];
        self.handle.read_at(self.data_len, &mut buf)?;
        PieceHeader::decode(&buf)
    }
}

impl Read for PieceReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.data_len - self.pos;
        if remaining == 0 {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(remaining) as usize;
        self.handle
            .read_at(self.pos, &mut buf[..n])
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}
