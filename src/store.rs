//! Store facade: owns one physical engine, hands out typed tables, and
//! runs the transaction-durability batching policy.
//!
//! The facade holds a single dynamically dispatched [`StorageBackend`]
//! selected from the [`StorageConfig`] at construction. Durability is
//! traded against throughput by closing most transactions non-durably and
//! forcing a durable close once the configured ceiling is exceeded, which
//! bounds crash loss to at most that many logical transactions while
//! letting the engine coalesce expensive flushes.

use std::sync::{Arc, Mutex};

use bincode::{Decode, Encode};

use crate::backend::{OpenFlags, StorageBackend};
use crate::config::{BackendKind, StorageConfig};
use crate::databases::fs_store::FsStore;
use crate::databases::memory_store::MemoryStore;
use crate::databases::sled_store::SledStore;
use crate::error::StoreResult;
use crate::table::{
    KeyedRecord, KeyedTable, MultiTypeTable, SingleTypeTable, TypeRegistry, UntypedTable,
};

const LOG: &str = "/store";

/// Opaque token for the facade's single outstanding transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle(u64);

struct TxState {
    open: Option<TxHandle>,
    next_id: u64,
    durable_requested: bool,
    num_nondurable: u32,
}

/// The durable store facade.
pub struct DurableStore {
    backend: Box<dyn StorageBackend>,
    config: StorageConfig,
    tx: Mutex<TxState>,
    previous_shutdown_clean: Option<bool>,
}

impl DurableStore {
    /// Select, initialize and wrap the engine named by `config`.
    pub fn open(config: StorageConfig) -> StoreResult<Self> {
        let backend: Box<dyn StorageBackend> = match config.backend {
            BackendKind::Memory => Box::new(MemoryStore::new()),
            BackendKind::Sled => Box::new(SledStore::open(&config)?),
            BackendKind::Filesystem => Box::new(FsStore::open(&config)?),
        };
        Self::with_backend(backend, config)
    }

    /// Wrap a caller-supplied engine. Used by engines living outside this
    /// crate; `open` is the common path.
    pub fn with_backend(
        backend: Box<dyn StorageBackend>,
        config: StorageConfig,
    ) -> StoreResult<Self> {
        let previous_shutdown_clean = match &config.clean_shutdown_file {
            Some(marker) => match std::fs::remove_file(marker) {
                Ok(()) => Some(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(false),
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        if let Some(clean) = previous_shutdown_clean {
            log::info!(
                target: LOG,
                "previous run shut down {}",
                if clean { "cleanly" } else { "uncleanly" }
            );
        }
        log::info!(target: LOG, "opened {} store '{}'", config.backend, config.db_name);

        Ok(DurableStore {
            backend,
            config,
            tx: Mutex::new(TxState {
                open: None,
                next_id: 1,
                durable_requested: false,
                num_nondurable: 0,
            }),
            previous_shutdown_clean,
        })
    }

    /// Whether the previous run wrote its clean-shutdown marker. `None`
    /// when no marker path is configured.
    pub fn previous_shutdown_clean(&self) -> Option<bool> {
        self.previous_shutdown_clean
    }

    /// Begin a transaction, or return the handle of the one already open
    /// (idempotent; at most one transaction is outstanding per store).
    pub fn begin_transaction(&self) -> StoreResult<TxHandle> {
        let mut tx = self.lock_tx();
        if let Some(handle) = tx.open {
            return Ok(handle);
        }
        self.backend.begin_transaction()?;
        let handle = TxHandle(tx.next_id);
        tx.next_id += 1;
        tx.open = Some(handle);
        Ok(handle)
    }

    /// Force the next transaction close to be durable regardless of the
    /// batching counter.
    pub fn make_transaction_durable(&self) {
        self.lock_tx().durable_requested = true;
    }

    /// Close the open transaction.
    ///
    /// Every close counts against the non-durable ceiling; once the count
    /// exceeds it (or durability was requested) the close is forced
    /// durable and the counter resets to zero.
    ///
    /// # Panics
    ///
    /// Closing with no transaction open is a programmer error.
    pub fn end_transaction(&self) -> StoreResult<()> {
        let mut tx = self.lock_tx();
        assert!(tx.open.is_some(), "end_transaction with no transaction open");

        tx.num_nondurable += 1;
        let durable =
            tx.num_nondurable > self.config.max_nondurable_transactions || tx.durable_requested;

        self.backend.end_transaction(durable)?;

        if durable {
            log::debug!(
                target: LOG,
                "durable transaction close after {} batched closes",
                tx.num_nondurable
            );
            tx.num_nondurable = 0;
            tx.durable_requested = false;
        }
        tx.open = None;
        Ok(())
    }

    pub fn is_transaction_open(&self) -> bool {
        self.lock_tx().open.is_some()
    }

    /// Non-durable closes since the last durable close.
    pub fn num_nondurable_transactions(&self) -> u32 {
        self.lock_tx().num_nondurable
    }

    /// Open a table in which every row holds a `V`.
    pub fn open_single_type_table<V>(
        &self,
        name: &str,
        flags: OpenFlags,
    ) -> StoreResult<SingleTypeTable<V>>
    where
        V: Encode + Decode<()>,
    {
        let table = self.backend.open_table(name, flags.single_type())?;
        Ok(SingleTypeTable::new(table))
    }

    /// Open a table shared by several concrete types, dispatched through
    /// `registry`.
    pub fn open_multi_type_table<B>(
        &self,
        name: &str,
        flags: OpenFlags,
        registry: Arc<TypeRegistry<B>>,
    ) -> StoreResult<MultiTypeTable<B>> {
        let table = self.backend.open_table(name, flags.multi_type())?;
        Ok(MultiTypeTable::new(table, registry))
    }

    /// Open a table whose value type is chosen per call.
    pub fn open_untyped_table(&self, name: &str, flags: OpenFlags) -> StoreResult<UntypedTable> {
        let table = self.backend.open_table(name, flags.single_type())?;
        Ok(UntypedTable::new(table))
    }

    /// Open a table of records that carry their own unique key.
    pub fn open_keyed_table<V>(&self, name: &str, flags: OpenFlags) -> StoreResult<KeyedTable<V>>
    where
        V: KeyedRecord + Encode + Decode<()>,
    {
        let table = self.backend.open_table(name, flags.single_type())?;
        Ok(KeyedTable::new(table))
    }

    /// Remove a table. `Busy` while any handle to it is live.
    pub fn delete_table(&self, name: &str) -> StoreResult<()> {
        self.backend.delete_table(name)
    }

    pub fn table_names(&self) -> StoreResult<Vec<String>> {
        self.backend.table_names()
    }

    pub fn open_table_count(&self) -> usize {
        self.backend.open_table_count()
    }

    fn lock_tx(&self) -> std::sync::MutexGuard<'_, TxState> {
        self.tx.lock().expect("transaction state poisoned")
    }
}

impl Drop for DurableStore {
    fn drop(&mut self) {
        debug_assert!(
            self.backend.open_table_count() == 0,
            "store dropped with {} tables still open",
            self.backend.open_table_count()
        );
        if let Some(marker) = &self.config.clean_shutdown_file {
            let stamp = chrono::Utc::now().to_rfc3339();
            if let Err(e) = std::fs::write(marker, stamp) {
                log::error!(
                    target: LOG,
                    "failed to write clean-shutdown marker {}: {}",
                    marker.display(),
                    e
                );
            } else {
                log::info!(target: LOG, "wrote clean-shutdown marker {}", marker.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store(ceiling: u32) -> DurableStore {
        let config = StorageConfig::builder()
            .backend(BackendKind::Memory)
            .max_nondurable_transactions(ceiling)
            .build();
        DurableStore::open(config).unwrap()
    }

    #[test]
    fn test_begin_transaction_is_idempotent() {
        let store = memory_store(5);
        let first = store.begin_transaction().unwrap();
        let again = store.begin_transaction().unwrap();
        assert_eq!(first, again);
        store.end_transaction().unwrap();
        assert!(!store.is_transaction_open());

        let next = store.begin_transaction().unwrap();
        assert_ne!(first, next);
        store.end_transaction().unwrap();
    }

    #[test]
    fn test_batching_counter_resets_on_forced_durable_close() {
        let ceiling = 3;
        let store = memory_store(ceiling);

        for expected in 1..=ceiling {
            store.begin_transaction().unwrap();
            store.end_transaction().unwrap();
            assert_eq!(store.num_nondurable_transactions(), expected);
        }

        // the (N+1)-th close exceeds the ceiling, goes durable, and resets
        store.begin_transaction().unwrap();
        store.end_transaction().unwrap();
        assert_eq!(store.num_nondurable_transactions(), 0);
    }

    #[test]
    fn test_requested_durability_forces_next_close() {
        let store = memory_store(100);
        store.begin_transaction().unwrap();
        store.make_transaction_durable();
        store.end_transaction().unwrap();
        assert_eq!(store.num_nondurable_transactions(), 0);

        // the request was consumed by that close
        store.begin_transaction().unwrap();
        store.end_transaction().unwrap();
        assert_eq!(store.num_nondurable_transactions(), 1);
    }

    #[test]
    #[should_panic(expected = "no transaction open")]
    fn test_end_without_begin_panics() {
        let store = memory_store(5);
        let _ = store.end_transaction();
    }
}
