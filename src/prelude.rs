//! Convenience re-exports for the common storage workflow.

pub use crate::backend::{
    BackendTable, BoxedRawIter, OpenFlags, PutFlags, RawEntry, StorageBackend,
};
pub use crate::cache::{CacheStats, CachedTable, CapacityPolicy, ObjectCache};
pub use crate::codec::{FlatKey, TypeCode};
pub use crate::config::{BackendKind, StorageConfig};
pub use crate::databases::{FsStore, MemoryStore, SledStore};
pub use crate::error::{StoreError, StoreResult};
pub use crate::iter::{FilterIter, MultiTypeIter, TableIter};
pub use crate::store::{DurableStore, TxHandle};
pub use crate::table::{
    KeyedRecord, KeyedTable, MultiTypeTable, SingleTypeTable, TypeRegistry, UntypedTable,
};
