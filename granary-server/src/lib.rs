//! Granary Server - Prioritized Repair Job Queue
//!
//! The satellite-side queue that schedules segment repairs:
//!
//! - **Queue**: per-placement priority heap with retry delay, bounded
//!   memory, and eviction
//! - **Queue map**: placement → queue, lazily instantiated
//! - **Endpoint**: Push/Pop/Peek/Len/Clean/Trim/Stat over mutual-TLS
//!   framed streams
//! - **Client**: typed dialer for repair workers

pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod queue;
pub mod queuemap;
pub mod tls;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
