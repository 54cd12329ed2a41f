//! Ids and Names
//!
//! Buffer and worker ids are 16 lowercase hex characters (64 random bits).
//! Topic and consumer names share one grammar: 1-256 characters drawn from
//! `[a-zA-Z0-9_-]`. The grammar is simple enough that a char predicate
//! beats pulling in a regex engine.

use rand::Rng;

use crate::error::{Error, Result};

/// Generate a fresh 16-hex-char id.
pub fn uid() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// Whether `s` is a well-formed buffer/worker id.
pub fn is_valid_uid(s: &str) -> bool {
    s.len() == 16 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Whether `s` is a well-formed topic or consumer name.
pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 256
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Validate a topic or consumer name, for use at API boundaries.
pub fn validate_name(s: &str) -> Result<()> {
    if is_valid_name(s) {
        Ok(())
    } else {
        Err(Error::InvalidName(s.to_string()))
    }
}

/// Validate a buffer/worker id, for use at API boundaries.
pub fn validate_uid(s: &str) -> Result<()> {
    if is_valid_uid(s) {
        Ok(())
    } else {
        Err(Error::InvalidBufferId(s.to_string()))
    }
}
