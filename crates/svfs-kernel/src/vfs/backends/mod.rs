//! Backing store implementations.
//!
//! Each backend implements [`BackingStore`](super::BackingStore) for one
//! family of mounts.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
