//! Client Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid topic or consumer name {0:?}")]
    InvalidName(String),

    #[error("no buffers known for topic {0:?}")]
    NoBuffers(String),

    #[error("couldn't write to any buffer of topic {topic:?}: {last}")]
    WriteFailed { topic: String, last: String },

    #[error("controller request failed: {0}")]
    Controller(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata parse error: {0}")]
    Json(#[from] serde_json::Error),
}
