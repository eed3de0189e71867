//! # Durable Store
//!
//! A backend-agnostic durable storage layer for daemons that persist
//! typed application objects regardless of which physical engine is
//! deployed.
//!
//! ## Features
//!
//! - **Backend contract**: one trait pair ([`backend::StorageBackend`],
//!   [`backend::BackendTable`]) that structurally different engines
//!   implement uniformly; sled, filesystem and memory engines ship in
//!   [`databases`].
//! - **Typed tables**: single-type, multi-type (self-describing type
//!   tags over one physical table), untyped and internally-keyed table
//!   wrappers with bincode serialization.
//! - **Transaction batching**: a configurable ceiling on non-durable
//!   transaction closes bounds crash loss while letting the engine
//!   coalesce expensive flushes.
//! - **Object cache**: a pin-aware LRU cache that never evicts an object
//!   a caller still holds pinned.
//!
//! ## Quick Start
//!
//! ```
//! use durable_store::prelude::*;
//!
//! # fn main() -> StoreResult<()> {
//! let store = DurableStore::open(StorageConfig::memory())?;
//!
//! let table: SingleTypeTable<String> =
//!     store.open_single_type_table("greetings", OpenFlags::create())?;
//!
//! store.begin_transaction()?;
//! table.put(&1u64, &"hello".to_string(), PutFlags::create())?;
//! store.end_transaction()?;
//!
//! assert_eq!(table.get(&1u64)?, "hello");
//! # drop(table);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod databases;
pub mod error;
pub mod iter;
pub mod prelude;
pub mod store;
pub mod table;
