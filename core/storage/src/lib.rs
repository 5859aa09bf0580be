//! Storage collaborators for FieldSync.
//!
//! This module defines the interfaces the sync engine depends on but does
//! not own: the device-local record cache and the transport to the remote
//! replica. In-memory implementations are provided for tests and tooling.
//!
//! # Design Principles
//! - Absence is a value: remote "not found" is distinct from failure
//! - Async operations: all I/O operations are async
//! - Timestamps travel with every local write

pub mod memory;
pub mod provider;

pub use memory::{CacheEntry, MemoryCache, MemoryRemote, RemoteFailure};
pub use provider::{LocalCache, RemoteSnapshot, RemoteTransport};
