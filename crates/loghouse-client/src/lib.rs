//! Loghouse Client
//!
//! A thin routing layer between producer/consumer tooling and the
//! worker-owned buffers. The client keeps a locally cached copy of the
//! controller's topic and buffer maps and spreads load without any
//! coordination:
//!
//! - **produce**: pick a random buffer of the topic and rotate through
//!   the rest until one accepts the write
//! - **consume**: pick a random buffer across all requested topics and
//!   rotate until one has a message for the consumer group
//!
//! Consumer-group state lives on the buffer's worker, not here; two
//! clients using the same consumer name share cursors naturally.

pub mod client;
pub mod error;

pub use client::{BufferInfo, Client, Consumed, TopicInfo};
pub use error::{Error, Result};
