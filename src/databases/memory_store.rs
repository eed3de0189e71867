//! Memory engine: RAM-only tables behind a mutex.
//!
//! Not durable unless you have a bunch of NVRAM. Table contents survive
//! handle close and reopen for the life of the store, which is what the
//! daemon's test and cache-only deployments need. Transactions are
//! always-succeeding no-ops.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::backend::{
    BackendTable, BoxedRawIter, OpenFlags, OpenTables, PutFlags, StorageBackend,
};
use crate::error::{StoreError, StoreResult};

const LOG: &str = "/store/memory";

type Items = BTreeMap<Vec<u8>, Vec<u8>>;

struct TableData {
    items: Arc<Mutex<Items>>,
    multi_type: bool,
}

/// RAM-backed [`StorageBackend`].
pub struct MemoryStore {
    tables: Mutex<HashMap<String, TableData>>,
    open: OpenTables,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: Mutex::new(HashMap::new()),
            open: OpenTables::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl StorageBackend for MemoryStore {
    fn open_table(&self, name: &str, flags: OpenFlags) -> StoreResult<Arc<dyn BackendTable>> {
        let mut tables = self.tables.lock().expect("table map poisoned");

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

        let items = match tables.get(name) {
            Some(data) => {
                if flags.exclusive_create {
                    return Err(StoreError::Exists);
                }
                assert_eq!(
                    data.multi_type, flags.multi_type,
                    "table {name} reopened with a different multi-type flag"
                );
                Arc::clone(&data.items)
            }
            None => {
                if !flags.create {
                    return Err(StoreError::NotFound);
                }
                log::debug!(target: LOG, "creating table {}", name);
                let items = Arc::new(Mutex::new(Items::new()));
                tables.insert(
                    name.to_string(),
                    TableData {
                        items: Arc::clone(&items),
                        multi_type: flags.multi_type,
                    },
                );
                items
            }
        };

        let table: Arc<dyn BackendTable> = Arc::new(MemoryTable {
            name: name.to_string(),
            multi_type: flags.multi_type,
            items,
        });
        self.open.insert(name, &table);
        Ok(table)
    }

    fn delete_table(&self, name: &str) -> StoreResult<()> {
        // Same lock order as open_table: tables map, then open-handle map.
        let mut tables = self.tables.lock().expect("table map poisoned");
        if self.open.is_referenced(name) {
            return Err(StoreError::Busy);
        }
        if tables.remove(name).is_none() {
            return Err(StoreError::NotFound);
        }
        log::info!(target: LOG, "deleted table {}", name);
        Ok(())
    }

    fn table_names(&self) -> StoreResult<Vec<String>> {
        let tables = self.tables.lock().expect("table map poisoned");
        Ok(tables.keys().cloned().collect())
    }

    fn open_table_count(&self) -> usize {
        self.open.live_count()
    }
}

/// One opened memory table. Multiple handles to the same name share the
/// same item map.
#[derive(Debug)]
struct MemoryTable {
    name: String,
    multi_type: bool,
    items: Arc<Mutex<Items>>,
}

impl MemoryTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, Items> {
        self.items.lock().expect("item map poisoned")
    }
}

impl BackendTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_multi_type(&self) -> bool {
        self.multi_type
    }

    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.lock().get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8], flags: PutFlags) -> StoreResult<()> {
        let mut items = self.lock();
        match items.get_mut(key) {
            Some(existing) => {
                if flags.exclusive_create {
                    return Err(StoreError::Exists);
                }
                *existing = value.to_vec();
            }
            None => {
                if !flags.create {
                    return Err(StoreError::NotFound);
                }
                items.insert(key.to_vec(), value.to_vec());
            }
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        match self.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    fn size(&self) -> StoreResult<usize> {
        Ok(self.lock().len())
    }

    fn iterate(&self) -> StoreResult<BoxedRawIter> {
        // Snapshot under the table lock; mutating while iterating is safe.
        let snapshot: Vec<_> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}
