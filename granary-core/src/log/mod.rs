//! Append-only data logs
//!
//! A log is a sequence of framed records, each self-describing: a
//! fixed-size header naming the key, payload length, day-granular
//! timestamps, flags, and a CRC-64 over header and payload. Logs are
//! written by exactly one store and never rewritten; compaction replaces
//! whole files.

mod file;
mod record;

pub use file::{LogFile, ScanOutcome};
pub use record::{FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Filename of a log with the given id.
pub fn log_file_name(id: u32) -> String {
    format!("log-{id:016x}")
}

/// Parse a log filename back into its id.
pub fn parse_log_file_name(name: &str) -> Option<u32> {
    let hex = name.strip_prefix("log-")?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok().and_then(|v| u32::try_from(v).ok())
}

/// Sync behavior after record appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every committed record (safest, slowest)
    Immediate,
    /// Sync after N commits
    EveryN(usize),
    /// Never sync (OS decides)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_round_trip() {
        assert_eq!(log_file_name(0), "log-0000000000000000");
        assert_eq!(parse_log_file_name(&log_file_name(0)), Some(0));
        assert_eq!(parse_log_file_name(&log_file_name(0xdead_beef)), Some(0xdead_beef));
        assert_eq!(parse_log_file_name("log-xyz"), None);
        assert_eq!(parse_log_file_name("tbl"), None);
    }
}
