//! Core Error Types
//!
//! Errors raised by the frame codec and by name/id validation. Storage and
//! transport errors live in their own crates and wrap these with `#[from]`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid frame length header")]
    BadLength,

    #[error("invalid sha hex in frame header")]
    BadSha,

    #[error("frame metadata is not newline-terminated")]
    MissingMetaTerminator,

    #[error("frame body is not newline-terminated")]
    MissingBodyTerminator,

    #[error("invalid name {0:?}: expected 1-256 chars of [a-zA-Z0-9_-]")]
    InvalidName(String),

    #[error("invalid buffer id {0:?}: expected 16 hex chars")]
    InvalidBufferId(String),

    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
}
