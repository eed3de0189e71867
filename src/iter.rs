//! Typed and filtered iterators over backend tables.
//!
//! Raw backend iterators yield `StoreResult<RawEntry>`; exhaustion is
//! `None` and an engine failure is one `Err` after which the iterator is
//! permanently terminal. The wrappers here preserve those terminal states.

use std::marker::PhantomData;
use std::sync::Arc;

use bincode::Decode;

use crate::backend::{BoxedRawIter, RawEntry};
use crate::codec::{self, FlatKey};
use crate::error::StoreResult;
use crate::table::TypeRegistry;

/// Iterator over a single-type (or untyped) table, decoding each value into
/// `V` and handing back the flattened key alongside it.
///
/// The typed key is recovered with [`FlatKey::decode`].
pub struct TableIter<V> {
    raw: BoxedRawIter,
    done: bool,
    _marker: PhantomData<fn() -> V>,
}

impl<V> TableIter<V> {
    pub(crate) fn new(raw: BoxedRawIter) -> Self {
        TableIter {
            raw,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl<V: Decode<()>> Iterator for TableIter<V> {
    type Item = StoreResult<(FlatKey, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.raw.next() {
            None => {
                self.done = true;
                None
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(Ok((key, value))) => match codec::from_bytes(&value) {
                Ok(decoded) => Some(Ok((FlatKey::from_bytes(key), decoded))),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            },
        }
    }
}

/// Iterator over a multi-type table, dispatching each row's payload through
/// the type registry.
pub struct MultiTypeIter<B> {
    raw: BoxedRawIter,
    registry: Arc<TypeRegistry<B>>,
    done: bool,
}

impl<B> MultiTypeIter<B> {
    pub(crate) fn new(raw: BoxedRawIter, registry: Arc<TypeRegistry<B>>) -> Self {
        MultiTypeIter {
            raw,
            registry,
            done: false,
        }
    }
}

impl<B> Iterator for MultiTypeIter<B> {
    type Item = StoreResult<(FlatKey, B)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.raw.next() {
            None => {
                self.done = true;
                None
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(Ok((key, row))) => {
                let decoded = codec::split_typed(&row)
                    .and_then(|(code, payload)| self.registry.decode(code, payload));
                match decoded {
                    Ok(value) => Some(Ok((FlatKey::from_bytes(key), value))),
                    Err(e) => {
                        self.done = true;
                        Some(Err(e))
                    }
                }
            }
        }
    }
}

/// Decorates a raw iterator with a predicate over the current raw element.
///
/// `next` loops the base iterator until the predicate accepts or the base
/// is exhausted; terminal states pass through unchanged.
pub struct FilterIter<P> {
    raw: BoxedRawIter,
    accept: P,
    done: bool,
}

impl<P> FilterIter<P>
where
    P: FnMut(&[u8], &[u8]) -> bool,
{
    pub fn new(raw: BoxedRawIter, accept: P) -> Self {
        FilterIter {
            raw,
            accept,
            done: false,
        }
    }
}

impl<P> Iterator for FilterIter<P>
where
    P: FnMut(&[u8], &[u8]) -> bool,
{
    type Item = StoreResult<RawEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.raw.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok((key, value))) => {
                    if (self.accept)(&key, &value) {
                        return Some(Ok((key, value)));
                    }
                }
            }
        }
    }
}
