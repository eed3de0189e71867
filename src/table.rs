//! Typed table layer: serializes domain objects over a [`BackendTable`].
//!
//! Three table shapes cover the daemon's persistence patterns:
//!
//! - [`SingleTypeTable`]: every row holds the same value type.
//! - [`MultiTypeTable`]: rows of different concrete types share one table;
//!   a fixed-width type code ahead of each payload selects the
//!   deserializer through a [`TypeRegistry`].
//! - [`UntypedTable`]: the value type is chosen per call, for small
//!   heterogeneous tables with no common base.
//!
//! [`KeyedTable`] additionally binds the key type for record types that
//! carry their own unique id.
//!
//! Every key is flattened to canonical bytes through the codec before the
//! backend sees it, and the full serialized value is produced before the
//! backend is touched, so a codec failure can never leave a partially
//! written record.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bincode::{Decode, Encode};

use crate::backend::{BackendTable, PutFlags};
use crate::codec::{self, FlatKey, TypeCode};
use crate::error::{StoreError, StoreResult};
use crate::iter::{FilterIter, MultiTypeIter, TableIter};

/// A table in which every row holds a value of type `V`.
pub struct SingleTypeTable<V> {
    table: Arc<dyn BackendTable>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for SingleTypeTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleTypeTable")
            .field("name", &self.table.name())
            .finish()
    }
}

impl<V> SingleTypeTable<V>
where
    V: Encode + Decode<()>,
{
    pub(crate) fn new(table: Arc<dyn BackendTable>) -> Self {
        assert!(
            !table.is_multi_type(),
            "single-type wrapper over multi-type table {}",
            table.name()
        );
        SingleTypeTable {
            table,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.table.name()
    }

    /// Serialize `value` under the flattened `key`.
    pub fn put<K: Encode>(&self, key: &K, value: &V, flags: PutFlags) -> StoreResult<()> {
        let key = FlatKey::flatten(key)?;
        let value = codec::to_bytes(value)?;
        self.table.put(key.as_bytes(), &value, flags)
    }

    /// Deserialize the value stored under `key`, `NotFound` if absent.
    pub fn get<K: Encode>(&self, key: &K) -> StoreResult<V> {
        let key = FlatKey::flatten(key)?;
        let bytes = self.table.get(key.as_bytes())?;
        codec::from_bytes(&bytes)
    }

    pub fn delete<K: Encode>(&self, key: &K) -> StoreResult<()> {
        let key = FlatKey::flatten(key)?;
        self.table.delete(key.as_bytes())
    }

    pub fn size(&self) -> StoreResult<usize> {
        self.table.size()
    }

    pub fn iter(&self) -> StoreResult<TableIter<V>> {
        Ok(TableIter::new(self.table.iterate()?))
    }

    /// Iterate only the rows whose raw (key, value) bytes the predicate
    /// accepts.
    pub fn iter_filtered<P>(&self, accept: P) -> StoreResult<TableIter<V>>
    where
        P: FnMut(&[u8], &[u8]) -> bool + Send + 'static,
    {
        let filtered = FilterIter::new(self.table.iterate()?, accept);
        Ok(TableIter::new(Box::new(filtered)))
    }
}

/// Registry mapping type codes to deserializers producing the base type
/// `B`, populated by each concrete subtype at startup.
pub struct TypeRegistry<B> {
    decoders: HashMap<TypeCode, Box<dyn Fn(&[u8]) -> StoreResult<B> + Send + Sync>>,
}

impl<B> TypeRegistry<B> {
    pub fn new() -> Self {
        TypeRegistry {
            decoders: HashMap::new(),
        }
    }

    /// Register the concrete type `T` under `code`.
    ///
    /// # Panics
    ///
    /// Registering the same code twice is a programmer error.
    pub fn register<T>(&mut self, code: TypeCode)
    where
        T: Decode<()> + Into<B> + 'static,
    {
        let previous = self.decoders.insert(
            code,
            Box::new(|payload: &[u8]| Ok(codec::from_bytes::<T>(payload)?.into())),
        );
        assert!(previous.is_none(), "type code {code} registered twice");
    }

    pub fn is_registered(&self, code: TypeCode) -> bool {
        self.decoders.contains_key(&code)
    }

    /// Dispatch a row payload through the decoder registered for `code`.
    /// An unregistered code means the row cannot be interpreted: `Corrupt`.
    pub fn decode(&self, code: TypeCode, payload: &[u8]) -> StoreResult<B> {
        match self.decoders.get(&code) {
            Some(decode) => decode(payload),
            None => Err(StoreError::Corrupt(code)),
        }
    }
}

impl<B> Default for TypeRegistry<B> {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

/// A table in which rows of different concrete types share one physical
/// table, tagged by a fixed-width type code.
pub struct MultiTypeTable<B> {
    table: Arc<dyn BackendTable>,
    registry: Arc<TypeRegistry<B>>,
}

impl<B> MultiTypeTable<B> {
    pub(crate) fn new(table: Arc<dyn BackendTable>, registry: Arc<TypeRegistry<B>>) -> Self {
        assert!(
            table.is_multi_type(),
            "multi-type wrapper over single-type table {}",
            table.name()
        );
        MultiTypeTable { table, registry }
    }

    pub fn name(&self) -> &str {
        self.table.name()
    }

    /// Write the fixed-width `code` then the serialized `value`.
    pub fn put<K, T>(&self, key: &K, code: TypeCode, value: &T, flags: PutFlags) -> StoreResult<()>
    where
        K: Encode,
        T: Encode,
    {
        let key = FlatKey::flatten(key)?;
        let payload = codec::to_bytes(value)?;
        let row = codec::frame_typed(code, &payload);
        self.table.put(key.as_bytes(), &row, flags)
    }

    /// Read the type code under `key` and dispatch the payload through the
    /// registry to construct the matching concrete type.
    pub fn get<K: Encode>(&self, key: &K) -> StoreResult<B> {
        let key = FlatKey::flatten(key)?;
        let row = self.table.get(key.as_bytes())?;
        let (code, payload) = codec::split_typed(&row)?;
        self.registry.decode(code, payload)
    }

    /// The type code stored under `key`, without decoding the payload.
    pub fn get_type_code<K: Encode>(&self, key: &K) -> StoreResult<TypeCode> {
        let key = FlatKey::flatten(key)?;
        let row = self.table.get(key.as_bytes())?;
        let (code, _) = codec::split_typed(&row)?;
        Ok(code)
    }

    pub fn delete<K: Encode>(&self, key: &K) -> StoreResult<()> {
        let key = FlatKey::flatten(key)?;
        self.table.delete(key.as_bytes())
    }

    pub fn size(&self) -> StoreResult<usize> {
        self.table.size()
    }

    pub fn iter(&self) -> StoreResult<MultiTypeIter<B>> {
        Ok(MultiTypeIter::new(
            self.table.iterate()?,
            Arc::clone(&self.registry),
        ))
    }
}

/// A table whose value type is chosen per call.
pub struct UntypedTable {
    table: Arc<dyn BackendTable>,
}

impl UntypedTable {
    pub(crate) fn new(table: Arc<dyn BackendTable>) -> Self {
        assert!(
            !table.is_multi_type(),
            "untyped wrapper over multi-type table {}",
            table.name()
        );
        UntypedTable { table }
    }

    pub fn name(&self) -> &str {
        self.table.name()
    }

    pub fn put<K: Encode, T: Encode>(
        &self,
        key: &K,
        value: &T,
        flags: PutFlags,
    ) -> StoreResult<()> {
        let key = FlatKey::flatten(key)?;
        let value = codec::to_bytes(value)?;
        self.table.put(key.as_bytes(), &value, flags)
    }

    pub fn get<K: Encode, T: Decode<()>>(&self, key: &K) -> StoreResult<T> {
        let key = FlatKey::flatten(key)?;
        let bytes = self.table.get(key.as_bytes())?;
        codec::from_bytes(&bytes)
    }

    pub fn delete<K: Encode>(&self, key: &K) -> StoreResult<()> {
        let key = FlatKey::flatten(key)?;
        self.table.delete(key.as_bytes())
    }

    pub fn size(&self) -> StoreResult<usize> {
        self.table.size()
    }
}

/// Record types that carry their own unique key.
pub trait KeyedRecord {
    type Key: Encode + Decode<()>;

    /// The unique key under which this record is stored.
    fn durable_key(&self) -> Self::Key;
}

/// Single-type table adapter for records containing their own id: `add`,
/// `get`, `update` and `del` take the record (or its key) alone.
pub struct KeyedTable<V> {
    inner: SingleTypeTable<V>,
}

impl<V> KeyedTable<V>
where
    V: KeyedRecord + Encode + Decode<()>,
{
    pub(crate) fn new(table: Arc<dyn BackendTable>) -> Self {
        KeyedTable {
            inner: SingleTypeTable::new(table),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Insert a new record; a record with the same key yields `Exists`.
    pub fn add(&self, value: &V) -> StoreResult<()> {
        self.inner
            .put(&value.durable_key(), value, PutFlags::exclusive_create())
    }

    pub fn get(&self, key: &V::Key) -> StoreResult<V> {
        self.inner.get(key)
    }

    /// Overwrite an existing record; an absent key yields `NotFound`.
    pub fn update(&self, value: &V) -> StoreResult<()> {
        self.inner
            .put(&value.durable_key(), value, PutFlags::update())
    }

    pub fn del(&self, key: &V::Key) -> StoreResult<()> {
        self.inner.delete(key)
    }

    pub fn size(&self) -> StoreResult<usize> {
        self.inner.size()
    }

    pub fn iter(&self) -> StoreResult<TableIter<V>> {
        self.inner.iter()
    }
}
