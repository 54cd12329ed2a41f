//! Storage Error Types
//!
//! The taxonomy the HTTP layer maps onto status codes:
//!
//! - `OutOfBounds` - read/consume target is before the oldest retained
//!   message or at/after the current end (consume maps this to 204)
//! - `SegmentClosed` / `BufferClosed` - operation after shutdown
//! - `MessageTooLarge`, `ContentTypeTooLong`, `IdMismatch` - rejected
//!   input (400)
//! - `Malformed` - unreadable segment file; fatal to opening a buffer
//! - `Integrity` - hash chain mismatch during verification
//! - `PeerRejected` / `Transient` - replication-path failures, retried by
//!   the background tasks and never surfaced to clients

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message {id} out of bounds")]
    OutOfBounds { id: u64 },

    #[error("segment closed")]
    SegmentClosed,

    #[error("buffer closed")]
    BufferClosed,

    #[error("message body of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("content type of {0} bytes exceeds limit of 64")]
    ContentTypeTooLong(usize),

    #[error("message id {provided} does not match next id {expected}")]
    IdMismatch { provided: u64, expected: u64 },

    #[error("malformed segment {path}: {detail}")]
    Malformed { path: String, detail: String },

    #[error("hash chain mismatch at message {id}")]
    Integrity { id: u64 },

    #[error("peer rejected message {id} with status {status}")]
    PeerRejected { id: u64, status: u16 },

    #[error("transient: {0}")]
    Transient(String),

    #[error(transparent)]
    Codec(#[from] loghouse_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file error: {0}")]
    Json(#[from] serde_json::Error),
}
