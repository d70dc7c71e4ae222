//! Config store backends for the device twin.
//!
//! - [`MemoryConfigStore`]: in-memory store for tests and tooling
//! - [`RedbConfigStore`]: persistent store backed by redb

pub mod document;
pub mod error;
pub mod memory;
pub mod redb_store;

pub use error::{Error, Result};
pub use memory::MemoryConfigStore;
pub use redb_store::RedbConfigStore;
