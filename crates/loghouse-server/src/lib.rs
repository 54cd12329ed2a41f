//! Loghouse Server
//!
//! The control plane and HTTP surface of loghouse:
//!
//! - [`Worker`]: owns a set of buffers on one node; exposes their CRUD and
//!   message operations; registers itself and its buffers with the
//!   controller on startup
//! - [`Controller`]: the per-tenant catalog of workers, buffers and
//!   topics; provisions topics round-robin across workers and installs
//!   replica sets on the primaries
//! - [`Tenant`]: wires one controller, one worker and the client façade
//!   routes together under `/tenants/{id}`
//! - [`Node`]: hosts the tenants, serves the merged router, and handles
//!   graceful shutdown
//!
//! The worker and controller never talk to each other in-process: all
//! coordination goes through the same HTTP surface external callers use,
//! so a node can host one piece or all of them.

pub mod controller;
pub mod error;
pub mod facade;
pub mod node;
pub mod shutdown;
pub mod tenant;
pub mod worker;

pub use controller::{Controller, ControllerConfig, ControllerOptions};
pub use error::{ApiError, Error, Result};
pub use node::{Node, NodeConfig};
pub use tenant::Tenant;
pub use worker::{Worker, WorkerOptions};
