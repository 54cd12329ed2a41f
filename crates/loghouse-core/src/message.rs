//! Message Data Structure
//!
//! A message is the unit of data in loghouse, comparable to a Kafka record
//! or a log entry. Messages are immutable once written to a buffer.
//!
//! ## Structure
//!
//! - **id**: monotonically increasing within a buffer; assigned by the
//!   buffer at write time on primaries, carried verbatim on replicas
//! - **ts**: UTC wall-clock timestamp captured at the original write
//! - **content_type**: content-type string (wire name `type`, at most
//!   64 bytes)
//! - **body**: opaque payload bytes
//! - **sha**: optional 32-byte hash chaining this message to its
//!   predecessor; present only when the owning buffer runs with
//!   integrity mode on
//!
//! Only `id`, `ts` and `type` are part of the serialized metadata; the
//! body travels as raw bytes and the sha (when present) lives in the
//! frame header so segment verification never parses JSON.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A 32-byte SHA-256 digest, hex-encoded wherever it is rendered.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sha(pub [u8; 32]);

impl Sha {
    /// The all-zero seed the first message of a chain hashes against.
    pub const ZERO: Sha = Sha([0u8; 32]);

    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(hex: &[u8]) -> Result<Sha> {
        if hex.len() != 64 {
            return Err(Error::BadSha);
        }
        let mut out = [0u8; 32];
        for (i, chunk) in hex.chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|_| Error::BadSha)?;
            out[i] = u8::from_str_radix(s, 16).map_err(|_| Error::BadSha)?;
        }
        Ok(Sha(out))
    }
}

impl std::fmt::Debug for Sha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha({})", self.to_hex())
    }
}

/// A single message in a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Id within the owning buffer.
    pub id: u64,

    /// UTC timestamp of the original write.
    pub ts: DateTime<Utc>,

    /// Content type, `type` on the wire.
    pub content_type: String,

    /// Payload.
    pub body: Bytes,

    /// Chain hash; `Some` only in integrity mode.
    pub sha: Option<Sha>,
}

/// The JSON metadata line of a frame: everything except body and sha.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub id: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub content_type: String,
}

impl Message {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Message {
        Message {
            id: 0,
            ts: Utc::now(),
            content_type: content_type.into(),
            body: body.into(),
            sha: None,
        }
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            id: self.id,
            ts: self.ts,
            content_type: self.content_type.clone(),
        }
    }

    /// Timestamp in RFC 3339 with nanoseconds, the `Hbuf-Ts` header format.
    pub fn ts_rfc3339(&self) -> String {
        self.ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// Compute this message's chain hash from its predecessor's.
    ///
    /// The input is `prev || metadata-json || body`, so any change to id,
    /// timestamp, content type or payload breaks the chain.
    pub fn chain(&self, prev: &Sha) -> Result<Sha> {
        let meta = serde_json::to_vec(&self.metadata())?;
        Ok(chain_raw(prev, &meta, &self.body))
    }
}

/// Chain hash over raw frame slices, as stored on disk.
///
/// Verification uses this directly on the bytes read back from a segment,
/// so it never depends on JSON re-serialization being byte-stable.
pub fn chain_raw(prev: &Sha, meta: &[u8], body: &[u8]) -> Sha {
    let mut h = Sha256::new();
    h.update(prev.0);
    h.update(meta);
    h.update(body);
    Sha(h.finalize().into())
}
