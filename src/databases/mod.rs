//! Concrete physical engines implementing the backend contract.
//!
//! - [`memory_store`]: RAM-only tables, for tests and cache-only
//!   deployments.
//! - [`sled_store`]: the embedded transactional key-value engine.
//! - [`fs_store`]: one directory per table, one file per record.

pub mod fs_store;
pub mod memory_store;
pub mod sled_store;

pub use fs_store::FsStore;
pub use memory_store::MemoryStore;
pub use sled_store::SledStore;
