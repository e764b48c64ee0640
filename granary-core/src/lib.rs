//! Granary Core - Content-Addressed Piece Store Engine
//!
//! A storage-node piece store built on a pair of log-structured hashtables
//! per namespace:
//!
//! - **Log files**: append-only logs of framed, CRC-64-protected records
//! - **Hash table**: fixed-size open-addressed on-disk index, atomically
//!   replaced by compaction
//! - **Store / DB**: the s0/s1 pair behind one namespace, alternating
//!   compaction with space reservation
//! - **Piece backend**: integrity-checked writes and reads with trailing
//!   piece headers
//! - **Retain subsystem**: bloom-filter-driven two-phase trash with a
//!   restore window

pub mod backend;
pub mod bloom;
pub mod clock;
pub mod db;
pub mod kofn;
pub mod log;
pub mod platform;
pub mod retain;
pub mod store;
pub mod tbl;

mod error;
mod types;

pub use error::{Error, Result};
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Size at which the active log is sealed (1GB)
    pub const LOG_TARGET_SIZE: u64 = 1024 * 1024 * 1024;

    /// Grace period between trash-mark and physical removal (7 days)
    pub const TRASH_GRACE: Duration = Duration::from_secs(7 * 86_400);

    /// Headroom multiplier inside `free_required = (2 + m) * table_size`
    pub const REWRITE_MULTIPLE: f64 = 10.0;

    /// Background compaction cadence (1 hour)
    pub const COMPACTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
}
