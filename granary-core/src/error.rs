//! Error types for the piece store

use thiserror::Error;

/// Result type alias for piece store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Piece store error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected:#018x}, got {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    /// Key absent from the store, or queue empty
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to re-commit a live piece or re-push a queued job
    #[error("conflict: {0}")]
    Conflict(String),

    /// Queue full and the new entry does not outrank the evictee
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Operation cancelled
    #[error("cancelled")]
    Cancelled,

    /// RPC peer not on the allowlist
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed input, e.g. a piece header failing validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupt(_) | Error::ChecksumMismatch { .. }
        )
    }

    /// Check if the error is the distinguished "not found"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Stable discriminant used by the RPC layer to carry the kind across
    /// the wire.
    pub fn kind_code(&self) -> u8 {
        match self {
            Error::Io(_) => 1,
            Error::Corrupt(_) => 2,
            Error::ChecksumMismatch { .. } => 2,
            Error::NotFound(_) => 3,
            Error::Conflict(_) => 4,
            Error::Capacity(_) => 5,
            Error::Cancelled => 6,
            Error::Unauthorized(_) => 7,
            Error::InvalidArgument(_) => 8,
            Error::Config(_) => 9,
        }
    }

    /// Rebuild an error from a wire discriminant and message.
    pub fn from_kind_code(code: u8, msg: String) -> Error {
        match code {
            2 => Error::Corrupt(msg),
            3 => Error::NotFound(msg),
            4 => Error::Conflict(msg),
            5 => Error::Capacity(msg),
            6 => Error::Cancelled,
            7 => Error::Unauthorized(msg),
            8 => Error::InvalidArgument(msg),
            9 => Error::Config(msg),
            _ => Error::Io(std::io::Error::other(msg)),
        }
    }
}
