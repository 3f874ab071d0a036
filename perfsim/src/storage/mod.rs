//! Ephemeral shared key/value storage.
//!
//! This module provides the TTL-aware store that isolated request handlers
//! use to exchange state:
//!
//! - **SharedStorage**: Trait for get/set/delete with per-entry TTL
//! - **StorageExt**: Typed JSON helpers over any store
//! - **InMemoryStorage**: Single-process implementation for tests
//! - **FileStorage**: Directory-backed implementation shared across processes

pub mod entry;
pub mod error;
pub mod file;
pub mod memory;
pub mod serializer;
pub mod traits;

// Re-exports
pub use entry::StorageEntry;
pub use error::StorageError;
pub use file::FileStorage;
pub use memory::InMemoryStorage;
pub use serializer::JsonSerializer;
pub use traits::{SharedStorage, StorageExt};
