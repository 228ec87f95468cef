//! Stash Storage Layer
//!
//! This crate provides the durable key/value medium behind the offline
//! cache: objects are grouped into named buckets and carry an opaque
//! metadata record next to their payload. Local disk and in-memory
//! backends are included.

pub mod backend;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{ObjectMeta, StorageBackend, StorageEstimate, StoredObject};
pub use error::StorageError;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
