//! Core Types for Loghouse
//!
//! This crate defines the fundamental data model shared by every other
//! loghouse crate:
//!
//! - [`Message`]: the unit of data flowing through the system
//! - [`frame`]: the on-disk record format (fence header + metadata + body)
//! - [`BufferConfig`]: the knobs controlling segment rotation and retention
//! - [`name`]: id generation and topic/consumer name validation
//!
//! ## Design Decisions
//!
//! - Message bodies are `bytes::Bytes` so that slicing and fan-out to
//!   replicas never copy the payload.
//! - Message metadata is JSON on disk and on the wire; the body is raw
//!   bytes and never passes through serde.
//! - The integrity hash chain is optional and lives in the frame header,
//!   so verification can walk a segment without parsing metadata.

pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod name;

pub use config::{BufferConfig, SyncPolicy};
pub use error::{Error, Result};
pub use message::{Message, Sha};
