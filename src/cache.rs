//! Pin-aware LRU object cache.
//!
//! Sits in front of a typed table, keyed by the same flattened key bytes
//! the table uses. Callers pin entries they are actively using; a pinned
//! entry is never an eviction candidate, so a cached object can never be
//! evicted out from under a concurrent caller. Objects are handed out as
//! `Arc<V>` so [`ObjectCache::evict_and_transfer`] can move ownership to
//! the caller while readers keep their copies.
//!
//! Entries live in arena slots; the hash index maps flattened keys to slot
//! positions and the LRU list is intrusive prev/next slot indices, so
//! nothing holds a reference that relocation could invalidate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bincode::{Decode, Encode};

use crate::backend::PutFlags;
use crate::codec::{self, FlatKey};
use crate::error::{StoreError, StoreResult};
use crate::table::SingleTypeTable;

const LOG: &str = "/store/cache";

/// Capacity accounting, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityPolicy {
    /// Running total of serialized object bytes vs. the capacity.
    BySize(usize),
    /// Entry count vs. the capacity.
    ByCount(usize),
}

/// Monotonically increasing counters, resettable via
/// [`ObjectCache::reset_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Slot<V> {
    key: FlatKey,
    object: Arc<V>,
    object_size: usize,
    pin_count: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<V> {
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    index: HashMap<FlatKey, usize>,
    /// Least recently used end of the intrusive list.
    head: Option<usize>,
    /// Most recently used end.
    tail: Option<usize>,
    total_size: usize,
    stats: CacheStats,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Inner {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            total_size: 0,
            stats: CacheStats::default(),
        }
    }

    fn slot(&self, idx: usize) -> &Slot<V> {
        self.slots[idx].as_ref().expect("live slot index")
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<V> {
        self.slots[idx].as_mut().expect("live slot index")
    }

    fn alloc(&mut self, slot: Slot<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let slot = self.slot_mut(idx);
        slot.prev = None;
        slot.next = None;
    }

    fn push_tail(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let slot = self.slot_mut(idx);
            slot.prev = old_tail;
            slot.next = None;
        }
        match old_tail {
            Some(t) => self.slot_mut(t).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Unlink and free the slot, returning the entry.
    fn remove(&mut self, idx: usize) -> Slot<V> {
        self.unlink(idx);
        let slot = self.slots[idx].take().expect("live slot index");
        self.index.remove(&slot.key);
        self.free.push(idx);
        self.total_size -= slot.object_size;
        slot
    }

    /// Scan from the LRU head for the first unpinned entry and evict it.
    /// Reports failure when every entry is live.
    fn evict_one(&mut self) -> bool {
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let (pin_count, next) = {
                let slot = self.slot(idx);
                (slot.pin_count, slot.next)
            };
            if pin_count == 0 {
                let evicted = self.remove(idx);
                self.stats.evictions += 1;
                log::debug!(
                    target: LOG,
                    "evicted entry ({} bytes), {} bytes cached",
                    evicted.object_size,
                    self.total_size
                );
                return true;
            }
            cursor = next;
        }
        false
    }

    fn count(&self) -> usize {
        self.index.len()
    }

    fn live(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.pin_count > 0)
            .count()
    }

    fn over_capacity(&self, policy: CapacityPolicy) -> bool {
        match policy {
            CapacityPolicy::BySize(capacity) => self.total_size > capacity,
            CapacityPolicy::ByCount(capacity) => self.count() > capacity,
        }
    }
}

/// Pin-aware LRU cache of deserialized objects.
pub struct ObjectCache<V> {
    policy: CapacityPolicy,
    inner: Mutex<Inner<V>>,
}

impl<V> ObjectCache<V> {
    pub fn new(policy: CapacityPolicy) -> Self {
        ObjectCache {
            policy,
            inner: Mutex::new(Inner::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<V>> {
        self.inner.lock().expect("cache lock poisoned")
    }

    /// Insert an unpinned entry. `Exists` if the key is already cached.
    ///
    /// Inserting may evict unpinned entries from the LRU head; if every
    /// entry is pinned the cache exceeds capacity rather than failing.
    pub fn put<K: Encode>(&self, key: &K, value: V) -> StoreResult<Arc<V>>
    where
        V: Encode,
    {
        self.insert(key, value, 0)
    }

    /// Insert an entry already pinned by the caller.
    pub fn put_and_pin<K: Encode>(&self, key: &K, value: V) -> StoreResult<Arc<V>>
    where
        V: Encode,
    {
        self.insert(key, value, 1)
    }

    fn insert<K: Encode>(&self, key: &K, value: V, initial_pins: u32) -> StoreResult<Arc<V>>
    where
        V: Encode,
    {
        let key = FlatKey::flatten(key)?;
        let object_size = codec::encoded_size(&value)?;
        let object = Arc::new(value);

        let mut inner = self.lock();
        if inner.index.contains_key(&key) {
            return Err(StoreError::Exists);
        }

        let idx = inner.alloc(Slot {
            key: key.clone(),
            object: Arc::clone(&object),
            object_size,
            pin_count: initial_pins,
            prev: None,
            next: None,
        });
        inner.index.insert(key, idx);
        inner.push_tail(idx);
        inner.total_size += object_size;

        while inner.over_capacity(self.policy) {
            if !inner.evict_one() {
                log::debug!(
                    target: LOG,
                    "cache over capacity with every entry live ({} entries, {} bytes)",
                    inner.count(),
                    inner.total_size
                );
                break;
            }
        }

        Ok(object)
    }

    /// Look up a cached object, `NotFound` on a miss. A hit moves the
    /// entry to the most-recently-used end without changing its pin count.
    pub fn get<K: Encode>(&self, key: &K) -> StoreResult<Arc<V>> {
        let key = FlatKey::flatten(key)?;
        let mut inner = self.lock();
        match inner.index.get(&key).copied() {
            Some(idx) => {
                inner.unlink(idx);
                inner.push_tail(idx);
                inner.stats.hits += 1;
                Ok(Arc::clone(&inner.slot(idx).object))
            }
            None => {
                inner.stats.misses += 1;
                Err(StoreError::NotFound)
            }
        }
    }

    /// Whether the key is cached with a nonzero pin count.
    pub fn is_live<K: Encode>(&self, key: &K) -> StoreResult<bool> {
        let key = FlatKey::flatten(key)?;
        let inner = self.lock();
        Ok(match inner.index.get(&key).copied() {
            Some(idx) => inner.slot(idx).pin_count > 0,
            None => false,
        })
    }

    /// Drop one pin, making the entry evictable once the count reaches
    /// zero. Never removes the entry.
    ///
    /// # Panics
    ///
    /// Unpinning below zero is a programmer error.
    pub fn unpin<K: Encode>(&self, key: &K) -> StoreResult<()> {
        let key = FlatKey::flatten(key)?;
        let mut inner = self.lock();
        let idx = inner.index.get(&key).copied().ok_or(StoreError::NotFound)?;
        let slot = inner.slot_mut(idx);
        assert!(slot.pin_count > 0, "unpin of entry with zero pin count");
        slot.pin_count -= 1;
        Ok(())
    }

    /// Unconditionally remove and destroy the entry, pinned or not. Used
    /// when the backing row was deleted and the cached copy must never be
    /// served again.
    pub fn evict_and_destroy<K: Encode>(&self, key: &K) -> StoreResult<()> {
        let key = FlatKey::flatten(key)?;
        let mut inner = self.lock();
        let idx = inner.index.get(&key).copied().ok_or(StoreError::NotFound)?;
        inner.remove(idx);
        Ok(())
    }

    /// Remove the cache's bookkeeping for the entry, returning ownership
    /// of the object to the caller without destroying it.
    pub fn evict_and_transfer<K: Encode>(&self, key: &K) -> StoreResult<Arc<V>> {
        let key = FlatKey::flatten(key)?;
        let mut inner = self.lock();
        let idx = inner.index.get(&key).copied().ok_or(StoreError::NotFound)?;
        Ok(inner.remove(idx).object)
    }

    /// Evict every currently non-live entry, leaving live entries
    /// untouched. Returns how many entries were evicted.
    pub fn flush(&self) -> usize {
        let mut inner = self.lock();
        let mut count = 0;
        while inner.evict_one() {
            count += 1;
        }
        log::debug!(target: LOG, "flush evicted {} entries", count);
        count
    }

    pub fn is_over_capacity(&self) -> bool {
        self.lock().over_capacity(self.policy)
    }

    /// Running total of serialized object bytes cached.
    pub fn size(&self) -> usize {
        self.lock().total_size
    }

    /// Number of cached entries.
    pub fn count(&self) -> usize {
        self.lock().count()
    }

    /// Number of entries with a nonzero pin count.
    pub fn live(&self) -> usize {
        self.lock().live()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = CacheStats::default();
    }
}

/// Write-through composition of a [`SingleTypeTable`] and an
/// [`ObjectCache`].
///
/// Reads come from the cache when possible and fault in from the table on
/// a miss; writes go to the table first and replace any cached copy, so a
/// stale object is never served after the backing row changed.
pub struct CachedTable<V> {
    table: SingleTypeTable<V>,
    cache: ObjectCache<V>,
}

impl<V> CachedTable<V>
where
    V: Encode + Decode<()>,
{
    pub fn new(table: SingleTypeTable<V>, policy: CapacityPolicy) -> Self {
        CachedTable {
            table,
            cache: ObjectCache::new(policy),
        }
    }

    pub fn get<K: Encode>(&self, key: &K) -> StoreResult<Arc<V>> {
        match self.cache.get(key) {
            Ok(object) => Ok(object),
            Err(StoreError::NotFound) => {
                let loaded = self.table.get(key)?;
                match self.cache.put(key, loaded) {
                    Ok(object) => Ok(object),
                    // Raced another loader; its copy is just as fresh.
                    Err(StoreError::Exists) => self.cache.get(key),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn put<K: Encode>(&self, key: &K, value: V, flags: PutFlags) -> StoreResult<Arc<V>> {
        self.table.put(key, &value, flags)?;
        match self.cache.evict_and_destroy(key) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.cache.put(key, value)
    }

    pub fn delete<K: Encode>(&self, key: &K) -> StoreResult<()> {
        self.table.delete(key)?;
        match self.cache.evict_and_destroy(key) {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn cache(&self) -> &ObjectCache<V> {
        &self.cache
    }

    pub fn table(&self) -> &SingleTypeTable<V> {
        &self.table
    }
}
