//! Backend contract: the interface every physical engine implements.
//!
//! A [`StorageBackend`] is one opened physical store owning zero or more
//! named tables; a [`BackendTable`] is one opened table with get/put/delete/
//! iterate keyed by opaque byte strings. The typed table layer, the object
//! cache and the store facade are all written against these traits, so the
//! engines (sled, filesystem, memory) stay interchangeable.
//!
//! Mutating calls persist to the extent implied by the active transaction's
//! durability; `end_transaction(durable = true)` must guarantee survival of
//! a crash immediately after return. Engine failures are fatal and
//! propagated unmodified — this layer never retries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

const LOG: &str = "/store/backend";

/// Flags for [`StorageBackend::open_table`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Create the table if it does not exist.
    pub create: bool,
    /// Fail with `Exists` if the table already exists. Implies `create`.
    pub exclusive_create: bool,
    /// Rows carry a type-code field selecting their deserializer.
    pub multi_type: bool,
}

impl OpenFlags {
    /// Open an existing table only; absent tables yield `NotFound`.
    pub fn open_existing() -> Self {
        OpenFlags::default()
    }

    pub fn create() -> Self {
        OpenFlags {
            create: true,
            ..OpenFlags::default()
        }
    }

    pub fn exclusive_create() -> Self {
        OpenFlags {
            create: true,
            exclusive_create: true,
            ..OpenFlags::default()
        }
    }

    pub fn multi_type(mut self) -> Self {
        self.multi_type = true;
        self
    }

    pub fn single_type(mut self) -> Self {
        self.multi_type = false;
        self
    }
}

/// Flags for [`BackendTable::put`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutFlags {
    /// Insert the key if absent. When unset, putting an absent key yields
    /// `NotFound`.
    pub create: bool,
    /// Fail with `Exists` if the key is already present. Implies `create`.
    pub exclusive_create: bool,
}

impl PutFlags {
    /// Update an existing record only.
    pub fn update() -> Self {
        PutFlags::default()
    }

    /// Insert or update.
    pub fn create() -> Self {
        PutFlags {
            create: true,
            ..PutFlags::default()
        }
    }

    /// Insert only; an existing key yields `Exists`.
    pub fn exclusive_create() -> Self {
        PutFlags {
            create: true,
            exclusive_create: true,
        }
    }
}

/// One raw row: (key bytes, value bytes).
pub type RawEntry = (Vec<u8>, Vec<u8>);

/// Lazy forward-only sequence over a table's raw rows.
///
/// Exhaustion is `None`; an engine failure yields one `Err` after which the
/// iterator is permanently terminal.
pub type BoxedRawIter = Box<dyn Iterator<Item = StoreResult<RawEntry>> + Send>;

/// One opened named table in a physical engine.
///
/// Implementations serialize concurrent calls against a single handle (one
/// lock per open table); the critical section covers the engine call and
/// nothing heavier.
pub trait BackendTable: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Whether rows in this table carry a type-code field. Fixed at table
    /// creation.
    fn is_multi_type(&self) -> bool;

    /// Fetch the value stored under `key`, `NotFound` if absent.
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>>;

    /// Store `value` under `key`, honoring the create/exclusive-create
    /// semantics of `flags`.
    fn put(&self, key: &[u8], value: &[u8], flags: PutFlags) -> StoreResult<()>;

    /// Remove the record under `key`, `NotFound` if absent.
    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Best-effort count of records in the table.
    fn size(&self) -> StoreResult<usize>;

    /// Iterate the table's rows. The shipped engines iterate a snapshot, so
    /// mutating the table while an iterator is open is safe in that sense;
    /// other engines must document their own rules.
    fn iterate(&self) -> StoreResult<BoxedRawIter>;
}

/// One opened physical store.
pub trait StorageBackend: Send + Sync {
    /// Open (and possibly create) the named table.
    ///
    /// Reopening a table that is already open returns the live handle; an
    /// `exclusive_create` reopen of an existing table yields `Exists`, and
    /// opening an absent table without `create` yields `NotFound`.
    fn open_table(&self, name: &str, flags: OpenFlags) -> StoreResult<Arc<dyn BackendTable>>;

    /// Remove the named table from the store. Fails `Busy` while any handle
    /// to it is live, `NotFound` if it does not exist.
    fn delete_table(&self, name: &str) -> StoreResult<()>;

    /// Names of the tables currently in the store.
    fn table_names(&self) -> StoreResult<Vec<String>>;

    /// Number of table handles currently held by callers.
    fn open_table_count(&self) -> usize;

    /// Engines without native transactions treat these as always-succeeding
    /// no-ops.
    fn begin_transaction(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Close the current transaction. With `durable` set, the engine must
    /// guarantee that everything written so far survives a crash
    /// immediately after this returns.
    fn end_transaction(&self, durable: bool) -> StoreResult<()> {
        let _ = durable;
        Ok(())
    }
}

/// Name → handle map tracking which tables are open.
///
/// Handles are `Arc`s, so the reference count invariant is the `Arc` strong
/// count: a table stays open while any wrapper holds it, and
/// `delete_table` can refuse `Busy` by probing the stored `Weak`.
pub struct OpenTables {
    inner: Mutex<HashMap<String, Weak<dyn BackendTable>>>,
}

impl OpenTables {
    pub fn new() -> Self {
        OpenTables {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The live handle for `name`, if any caller still holds one.
    pub fn get_live(&self, name: &str) -> Option<Arc<dyn BackendTable>> {
        self.inner
            .lock()
            .expect("open-table map poisoned")
            .get(name)
            .and_then(Weak::upgrade)
    }

    /// Record a freshly opened handle.
    pub fn insert(&self, name: &str, table: &Arc<dyn BackendTable>) {
        self.inner
            .lock()
            .expect("open-table map poisoned")
            .insert(name.to_string(), Arc::downgrade(table));
    }

    pub fn is_referenced(&self, name: &str) -> bool {
        self.get_live(name).is_some()
    }

    /// Number of handles still held by callers. Prunes dead entries.
    pub fn live_count(&self) -> usize {
        let mut map = self.inner.lock().expect("open-table map poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.len()
    }
}

impl Default for OpenTables {
    fn default() -> Self {
        OpenTables::new()
    }
}

/// Whether the database directory exists. Errors other than absence are
/// engine failures.
pub fn check_db_dir(dir: &Path) -> StoreResult<bool> {
    match std::fs::metadata(dir) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            log::error!(target: LOG, "error checking database directory {}: {}", dir.display(), e);
            Err(StoreError::Io(e))
        }
    }
}

pub fn create_db_dir(dir: &Path) -> StoreResult<()> {
    log::info!(target: LOG, "creating new database directory {}", dir.display());
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Remove the database directory after the configured warning countdown.
pub fn prune_db_dir(dir: &Path, tidy_wait_secs: u32) -> StoreResult<()> {
    for remaining in (1..=tidy_wait_secs).rev() {
        log::warn!(
            target: LOG,
            "pruning contents of {} in {} seconds",
            dir.display(),
            remaining
        );
        thread::sleep(Duration::from_secs(1));
    }
    log::info!(target: LOG, "tidy option removing directory {}", dir.display());
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeTable(String);

    impl BackendTable for FakeTable {
        fn name(&self) -> &str {
            &self.0
        }
        fn is_multi_type(&self) -> bool {
            false
        }
        fn get(&self, _key: &[u8]) -> StoreResult<Vec<u8>> {
            Err(StoreError::NotFound)
        }
        fn put(&self, _key: &[u8], _value: &[u8], _flags: PutFlags) -> StoreResult<()> {
            Ok(())
        }
        fn delete(&self, _key: &[u8]) -> StoreResult<()> {
            Err(StoreError::NotFound)
        }
        fn size(&self) -> StoreResult<usize> {
            Ok(0)
        }
        fn iterate(&self) -> StoreResult<BoxedRawIter> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[test]
    fn test_open_tables_tracks_live_handles() {
        let open = OpenTables::new();
        let table: Arc<dyn BackendTable> = Arc::new(FakeTable("t".into()));
        open.insert("t", &table);

        assert!(open.is_referenced("t"));
        assert_eq!(open.live_count(), 1);

        drop(table);
        assert!(!open.is_referenced("t"));
        assert_eq!(open.live_count(), 0);
    }

    #[test]
    fn test_exclusive_create_implies_create() {
        assert!(OpenFlags::exclusive_create().create);
        assert!(PutFlags::exclusive_create().create);
    }
}
