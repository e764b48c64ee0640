//! Record framing
//!
//! Frame layout (big-endian):
//! `key[32] | length u32 | expires_at u32 | created_at u32 | flags u8 | crc64 u64 | payload`
//! The crc64 (CRC-64/XZ) covers the header bytes before the crc field plus
//! the payload.

use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;

use crate::types::{DayEpoch, Key};
use crate::{Error, Result};

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 32 + 4 + 4 + 4 + 1 + 8;

/// Upper bound on a single payload; anything larger is treated as framing
/// corruption.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

/// Decoded frame header of a single log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Store key.
    pub key: Key,
    /// Payload length; always > 0.
    pub length: u32,
    /// Expiration day epoch, 0 = never.
    pub expires: DayEpoch,
    /// Creation day epoch.
    pub created: DayEpoch,
    /// Flag bits; bit 0 = trash.
    pub flags: u8,
    /// CRC-64/XZ over the header prefix and payload.
    pub crc: u64,
}

impl FrameHeader {
    /// Serialize the header and payload into one frame.
    pub fn encode_frame(
        key: Key,
        expires: DayEpoch,
        created: DayEpoch,
        flags: u8,
        payload: &[u8],
    ) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&key);
        buf.put_u32(payload.len() as u32);
        buf.put_u32(expires);
        buf.put_u32(created);
        buf.put_u8(flags);

        let mut digest = CRC64.digest();
        digest.update(&buf);
        digest.update(payload);
        buf.put_u64(digest.finalize());

        buf.put_slice(payload);
        buf
    }

    /// Decode a header from its fixed-size serialization. The crc is not
    /// verified here; the caller checks it once the payload is in hand.
    pub fn decode(data: &[u8]) -> Result<FrameHeader> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::Corrupt("short frame header".to_string()));
        }
        let mut cursor = &data[..FRAME_HEADER_SIZE];
        let mut key = [0u8; 32];
        cursor.copy_to_slice(&mut key);
        let length = cursor.get_u32();
        let expires = cursor.get_u32();
        let created = cursor.get_u32();
        let flags = cursor.get_u8();
        let crc = cursor.get_u64();
        Ok(FrameHeader {
            key,
            length,
            expires,
            created,
            flags,
            crc,
        })
    }

    /// Verify the stored crc against the header prefix and payload.
    pub fn verify(&self, header_bytes: &[u8], payload: &[u8]) -> Result<()> {
        let mut digest = CRC64.digest();
        digest.update(&header_bytes[..FRAME_HEADER_SIZE - 8]);
        digest.update(payload);
        let actual = digest.finalize();
        if actual != self.crc {
            return Err(Error::ChecksumMismatch {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }
}
