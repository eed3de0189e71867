//! Sled engine: the embedded transactional key-value store.
//!
//! One sled tree per table. Sled batches writes in memory and flushes
//! asynchronously, so a non-durable transaction close costs nothing extra
//! and a durable close maps to an explicit [`sled::Db::flush`], which is
//! exactly the coalescing the facade's batching policy wants.
//!
//! Table metadata (the multi-type flag) lives in a reserved meta tree so
//! the flag survives process restarts; the meta tree is also the source of
//! truth for which tables exist, since sled creates trees on first touch.

use std::sync::{Arc, Mutex};

use crate::backend::{
    self, BackendTable, BoxedRawIter, OpenFlags, OpenTables, PutFlags, StorageBackend,
};
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};

const LOG: &str = "/store/sled";

/// Reserved tree holding per-table metadata.
const META_TREE: &str = "__durable_store_meta__";

/// Sled-backed [`StorageBackend`].
pub struct SledStore {
    db: sled::Db,
    meta: sled::Tree,
    open: OpenTables,
    /// Serializes table open/delete against each other.
    state: Mutex<()>,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish_non_exhaustive()
    }
}

impl SledStore {
    /// Open (and if configured, create or prune) the database named by
    /// `config`.
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        let path = config.db_path();

        if config.tidy {
            backend::prune_db_dir(&path, config.tidy_wait_secs)?;
        }
        let exists = backend::check_db_dir(&path)?;
        if !exists && !(config.init || config.tidy) {
            log::error!(target: LOG, "database directory {} not found", path.display());
            return Err(StoreError::NotFound);
        }
        if !exists {
            backend::create_db_dir(&path)?;
        }

        let db = sled::open(&path)?;
        let meta = db.open_tree(META_TREE)?;
        log::info!(target: LOG, "opened sled database at {}", path.display());
        Ok(SledStore {
            db,
            meta,
            open: OpenTables::new(),
            state: Mutex::new(()),
        })
    }

    fn table_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.meta.contains_key(name.as_bytes())?)
    }

    fn stored_multi_type(&self, name: &str) -> StoreResult<bool> {
        let flag = self
            .meta
            .get(name.as_bytes())?
            .ok_or(StoreError::NotFound)?;
        Ok(flag.first().copied() == Some(1))
    }
}

impl StorageBackend for SledStore {
    fn open_table(&self, name: &str, flags: OpenFlags) -> StoreResult<Arc<dyn BackendTable>> {
        let _state = self.state.lock().expect("store state poisoned");

        if let Some(live) = self.open.get_live(name) {
            if flags.exclusive_create {
                return Err(StoreError::Exists);
            }
            assert_eq!(
                live.is_multi_type(),
                flags.multi_type,
                "table {name} reopened with a different multi-type flag"
            );
            return Ok(live);
        }

        let multi_type = if self.table_exists(name)? {
            if flags.exclusive_create {
                return Err(StoreError::Exists);
            }
            let stored = self.stored_multi_type(name)?;
            assert_eq!(
                stored, flags.multi_type,
                "table {name} reopened with a different multi-type flag"
            );
            stored
        } else {
            if !flags.create {
                return Err(StoreError::NotFound);
            }
            log::debug!(target: LOG, "creating table {}", name);
            self.meta
                .insert(name.as_bytes(), vec![u8::from(flags.multi_type)])?;
            flags.multi_type
        };

        let tree = self.db.open_tree(name)?;
        let table: Arc<dyn BackendTable> = Arc::new(SledTable {
            name: name.to_string(),
            multi_type,
            tree,
            write_lock: Mutex::new(()),
        });
        self.open.insert(name, &table);
        Ok(table)
    }

    fn delete_table(&self, name: &str) -> StoreResult<()> {
        let _state = self.state.lock().expect("store state poisoned");

        if self.open.is_referenced(name) {
            return Err(StoreError::Busy);
        }
        if self.meta.remove(name.as_bytes())?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db.drop_tree(name)?;
        log::info!(target: LOG, "deleted table {}", name);
        Ok(())
    }

    fn table_names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.meta.iter() {
            let (key, _) = entry?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    fn open_table_count(&self) -> usize {
        self.open.live_count()
    }

    fn end_transaction(&self, durable: bool) -> StoreResult<()> {
        if durable {
            let flushed = self.db.flush()?;
            log::debug!(target: LOG, "durable close flushed {} bytes", flushed);
        }
        Ok(())
    }
}

/// One opened sled tree.
#[derive(Debug)]
struct SledTable {
    name: String,
    multi_type: bool,
    tree: sled::Tree,
    /// Serializes read-modify-write in `put` so the create/exclusive
    /// semantics hold under concurrency.
    write_lock: Mutex<()>,
}

impl BackendTable for SledTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_multi_type(&self) -> bool {
        self.multi_type
    }

    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        match self.tree.get(key)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(StoreError::NotFound),
        }
    }

    fn put(&self, key: &[u8], value: &[u8], flags: PutFlags) -> StoreResult<()> {
        let _write = self.write_lock.lock().expect("table lock poisoned");
        let exists = self.tree.contains_key(key)?;
        if exists && flags.exclusive_create {
            return Err(StoreError::Exists);
        }
        if !exists && !flags.create {
            return Err(StoreError::NotFound);
        }
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let _write = self.write_lock.lock().expect("table lock poisoned");
        match self.tree.remove(key)? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    fn size(&self) -> StoreResult<usize> {
        Ok(self.tree.len())
    }

    fn iterate(&self) -> StoreResult<BoxedRawIter> {
        // sled iterators read from the tree's own snapshot view; mutating
        // while iterating is safe.
        Ok(Box::new(self.tree.iter().map(|entry| {
            entry
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(StoreError::from)
        })))
    }
}
