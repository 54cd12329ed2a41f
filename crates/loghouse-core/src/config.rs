//! Buffer Configuration
//!
//! Knobs controlling segment rotation, retention and durability. All fields
//! have serde defaults so a partial JSON config deserializes into a fully
//! populated struct.
//!
//! ## Defaults
//!
//! - **buffer_max_bytes**: 1 GiB, advisory total ceiling for capacity
//!   planning (not enforced; retention is segment-count based)
//! - **buffer_max_segments**: 16 - oldest segment is dropped past this
//! - **message_max_bytes**: 16 MiB - larger writes are rejected
//! - **segment_max_bytes**: 64 MiB - rotate past this
//! - **segment_max_messages**: 65 536 - rotate past this; also caps the
//!   random-seek worst case within one segment
//! - **offset_cache_size**: 1024 entries per segment
//! - **sync**: `Always` - fsync after every append
//! - **integrity**: off - no hash chain
//! - **offsets_flush_every**: 1 - persist consumer cursors after every
//!   consume; raise to batch (crash loss is then bounded by this count)

use serde::{Deserialize, Serialize};

/// When segment appends are fsynced.
///
/// `Always` is durable-by-default; `Never` trades crash durability for an
/// order of magnitude of write throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest).
    Always,
    /// Never sync; the OS decides when pages reach disk.
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Advisory total size ceiling for one buffer.
    #[serde(default = "default_buffer_max_bytes")]
    pub buffer_max_bytes: u64,

    /// Upper bound on segment count; the oldest is trimmed past this.
    #[serde(default = "default_buffer_max_segments")]
    pub buffer_max_segments: usize,

    /// Largest accepted message body.
    #[serde(default = "default_message_max_bytes")]
    pub message_max_bytes: usize,

    /// Rotate the tail segment past this many bytes.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// Rotate the tail segment past this many messages.
    #[serde(default = "default_segment_max_messages")]
    pub segment_max_messages: u64,

    /// Per-segment offset cache capacity.
    #[serde(default = "default_offset_cache_size")]
    pub offset_cache_size: usize,

    /// Durability policy for segment appends.
    #[serde(default = "default_sync")]
    pub sync: SyncPolicy,

    /// Maintain and verify the per-message hash chain.
    #[serde(default)]
    pub integrity: bool,

    /// Persist consumer cursors after every Nth consume. Stop always
    /// flushes, so crash loss is bounded by N-1 cursor advances.
    #[serde(default = "default_offsets_flush_every")]
    pub offsets_flush_every: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_max_bytes: default_buffer_max_bytes(),
            buffer_max_segments: default_buffer_max_segments(),
            message_max_bytes: default_message_max_bytes(),
            segment_max_bytes: default_segment_max_bytes(),
            segment_max_messages: default_segment_max_messages(),
            offset_cache_size: default_offset_cache_size(),
            sync: default_sync(),
            integrity: false,
            offsets_flush_every: default_offsets_flush_every(),
        }
    }
}

fn default_buffer_max_bytes() -> u64 {
    1 << 30 // 1 GiB
}

fn default_buffer_max_segments() -> usize {
    16
}

fn default_message_max_bytes() -> usize {
    1 << 24 // 16 MiB
}

fn default_segment_max_bytes() -> u64 {
    1 << 26 // 64 MiB
}

fn default_segment_max_messages() -> u64 {
    1 << 16
}

fn default_offset_cache_size() -> usize {
    1 << 10
}

fn default_sync() -> SyncPolicy {
    SyncPolicy::Always
}

fn default_offsets_flush_every() -> u32 {
    1
}
