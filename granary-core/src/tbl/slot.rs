//! Slot and header encoding for the hash table file
//!
//! Slot layout (big-endian, 64 bytes):
//! `key[32] | log_id u32 | offset u64 | length u32 | created u32 |
//! expires u32 | flags u8 | crc32 u32 | pad[3]`
//! The crc32 covers bytes 0..57. A slot whose length field is zero is
//! empty; empty slots are all-zero and skip the checksum.

use bytes::{Buf, BufMut};

use crate::types::Record;
use crate::{Error, Result};

/// Width of one slot on disk.
pub const SLOT_SIZE: usize = 64;

/// Width of the table file header.
pub const TBL_HEADER_SIZE: usize = 16;

const MAGIC: &[u8; 4] = b"GHT1";

/// Encode the table file header.
pub fn encode_header(lg_size: u8) -> [u8; TBL_HEADER_SIZE] {
    let mut out = [0u8; TBL_HEADER_SIZE];
    out[0..4].copy_from_slice(MAGIC);
    out[4] = lg_size;
    out
}

/// Decode and validate the table file header, returning lg_size.
pub fn decode_header(data: &[u8; TBL_HEADER_SIZE]) -> Result<u8> {
    if &data[0..4] != MAGIC {
        return Err(Error::Corrupt("bad hash table magic".to_string()));
    }
    Ok(data[4])
}

/// Encode a record into its slot bytes.
pub fn encode(rec: &Record) -> [u8; SLOT_SIZE] {
    let mut out = [0u8; SLOT_SIZE];
    {
        let mut buf = &mut out[..];
        buf.put_slice(&rec.key);
        buf.put_u32(rec.log_id);
        buf.put_u64(rec.offset);
        buf.put_u32(rec.length);
        buf.put_u32(rec.created);
        buf.put_u32(rec.expires);
        buf.put_u8(rec.flags);
    }
    let crc = crc32fast::hash(&out[0..57]);
    out[57..61].copy_from_slice(&crc.to_be_bytes());
    out
}

/// Decode one slot; `None` for an empty slot, `Err` on checksum mismatch.
pub fn decode(data: &[u8]) -> Result<Option<Record>> {
    debug_assert_eq!(data.len(), SLOT_SIZE);
    let mut cursor = data;
    let mut key = [0u8; 32];
    cursor.copy_to_slice(&mut key);
    let log_id = cursor.get_u32();
    let offset = cursor.get_u64();
    let length = cursor.get_u32();
    let created = cursor.get_u32();
    let expires = cursor.get_u32();
    let flags = cursor.get_u8();
    let crc = cursor.get_u32();

    if length == 0 {
        return Ok(None);
    }

    let actual = crc32fast::hash(&data[0..57]);
    if actual != crc {
        return Err(Error::ChecksumMismatch {
            expected: crc as u64,
            actual: actual as u64,
        });
    }

    Ok(Some(Record {
        key,
        log_id,
        offset,
        length,
        created,
        expires,
        flags,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_round_trip() {
        let rec = Record {
            key: [0xAB; 32],
            log_id: 77,
            offset: 123_456,
            length: 999,
            created: 20_000,
            expires: 20_007,
            flags: 1,
        };
        let bytes = encode(&rec);
        assert_eq!(decode(&bytes).unwrap(), Some(rec));
    }

    #[test]
    fn test_empty_slot_decodes_none() {
        assert_eq!(decode(&[0u8; SLOT_SIZE]).unwrap(), None);
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let rec = Record {
            key: [1; 32],
            log_id: 1,
            offset: 0,
            length: 5,
            created: 1,
            expires: 0,
            flags: 0,
        };
        let mut bytes = encode(&rec);
        bytes[36] ^= 0x01;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_header_round_trip() {
        let header = encode_header(12);
        assert_eq!(decode_header(&header).unwrap(), 12);

        let mut bad = header;
        bad[0] = b'X';
        assert!(decode_header(&bad).is_err());
    }
}
