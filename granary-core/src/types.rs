//! Core identifier and timestamp types

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque 32-byte key under which a piece is stored.
pub type Key = [u8; 32];

/// Seconds in a day; on-disk timestamps are day-granular.
pub const SECS_PER_DAY: u64 = 86_400;

/// Day-granular timestamp: days since the Unix epoch, 0 meaning "never"
/// when used as an expiration.
pub type DayEpoch = u32;

/// Convert a wall-clock time to its day epoch.
pub fn day_epoch(t: SystemTime) -> DayEpoch {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() / SECS_PER_DAY) as DayEpoch,
        Err(_) => 0,
    }
}

/// Convert seconds since the Unix epoch to a day epoch.
pub fn day_epoch_from_secs(secs: u64) -> DayEpoch {
    (secs / SECS_PER_DAY) as DayEpoch
}

/// Number of whole days covering the duration, rounding up.
pub fn days_ceil(d: Duration) -> u32 {
    (d.as_secs().div_ceil(SECS_PER_DAY)) as u32
}

/// Identifier of a namespace: the 32-byte node id of the satellite a DB
/// stores pieces for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Hex form used for directory names.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Parse the directory-name form back into an id.
    pub fn from_hex(s: &str) -> Result<NodeId> {
        if s.len() != 64 {
            return Err(Error::InvalidArgument(format!(
                "node id must be 64 hex digits, got {}",
                s.len()
            )));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0])?;
            let lo = hex_digit(chunk[1])?;
            out[i] = (hi << 4) | lo;
        }
        Ok(NodeId(out))
    }
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::InvalidArgument(format!("invalid hex digit {b:#04x}"))),
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.hex()[..12])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex()[..12])
    }
}

/// Identifier of a stored piece; doubles as the store key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PieceId(pub [u8; 32]);

impl PieceId {
    /// The store key for this piece.
    pub fn key(&self) -> Key {
        self.0
    }

    /// True when every byte is zero (unset order-limit field).
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", NodeId(self.0))
    }
}

/// Hash algorithm a piece header may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256 = 0,
    /// BLAKE3
    Blake3 = 1,
}

impl HashAlgorithm {
    /// Digest width in bytes.
    pub fn digest_len(&self) -> usize {
        32
    }
}

impl TryFrom<u8> for HashAlgorithm {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(HashAlgorithm::Sha256),
            1 => Ok(HashAlgorithm::Blake3),
            _ => Err(Error::InvalidArgument(format!(
                "unknown hash algorithm: {value}"
            ))),
        }
    }
}

/// Flag bit marking a record as trash (two-phase delete).
pub const FLAG_TRASH: u8 = 0b0000_0001;

/// A reference to a stored piece: where its framed record lives and the
/// metadata the hash table keeps alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Store key.
    pub key: Key,
    /// Log file holding the framed record.
    pub log_id: u32,
    /// Byte offset of the record frame inside the log.
    pub offset: u64,
    /// Payload length in bytes; always > 0 for a live record.
    pub length: u32,
    /// Day epoch the record was created.
    pub created: DayEpoch,
    /// Day epoch after which the record may be dropped; 0 = never. For a
    /// trashed record this is the end of the grace window.
    pub expires: DayEpoch,
    /// Flag bits; bit 0 = trash.
    pub flags: u8,
}

impl Record {
    /// Whether the trash flag is set.
    pub fn trash(&self) -> bool {
        self.flags & FLAG_TRASH != 0
    }

    /// Whether the record has expired as of the given day.
    pub fn expired(&self, today: DayEpoch) -> bool {
        self.expires != 0 && self.expires <= today
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_round_trip() {
        let mut id = NodeId::default();
        for (i, b) in id.0.iter_mut().enumerate() {
            *b = i as u8;
        }
        let hex = id.hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_node_id_from_bad_hex() {
        assert!(NodeId::from_hex("abc").is_err());
        assert!(NodeId::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_day_epoch() {
        let t = UNIX_EPOCH + Duration::from_secs(3 * SECS_PER_DAY + 7);
        assert_eq!(day_epoch(t), 3);
        assert_eq!(days_ceil(Duration::from_secs(1)), 1);
        assert_eq!(days_ceil(Duration::from_secs(SECS_PER_DAY)), 1);
        assert_eq!(days_ceil(Duration::from_secs(SECS_PER_DAY + 1)), 2);
    }

    #[test]
    fn test_record_flags() {
        let mut rec = Record {
            key: [0; 32],
            log_id: 1,
            offset: 0,
            length: 10,
            created: 100,
            expires: 0,
            flags: 0,
        };
        assert!(!rec.trash());
        assert!(!rec.expired(u32::MAX));
        rec.flags |= FLAG_TRASH;
        rec.expires = 101;
        assert!(rec.trash());
        assert!(!rec.expired(100));
        assert!(rec.expired(101));
    }
}
