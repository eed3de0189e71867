//! Serialization seam for the storage layer.
//!
//! Everything above the backend contract moves through these functions, so
//! the rest of the crate treats the codec as opaque `encoded_size` /
//! `to_bytes` / `from_bytes` operations. The concrete codec is bincode with
//! the standard configuration.

use bincode::{Decode, Encode};
use derive_more::{Display, From, Into};

use crate::error::{StoreError, StoreResult};

/// Integer tag selecting the deserializer for a row in a multi-type table.
///
/// Written as a fixed-width big-endian field ahead of the payload so rows of
/// different concrete types can share one physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Into, Display)]
pub struct TypeCode(pub u32);

impl TypeCode {
    /// Width of the on-disk type-code field in bytes.
    pub const WIDTH: usize = 4;
}

/// Canonical byte-string form of a key.
///
/// Two keys are equal iff their flattened bytes are equal, and physical
/// ordering follows the bytes. These bytes double as the object cache's
/// hash key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlatKey(Vec<u8>);

impl FlatKey {
    /// Flatten a key object into its canonical bytes.
    pub fn flatten<K: Encode>(key: &K) -> StoreResult<Self> {
        Ok(FlatKey(to_bytes(key)?))
    }

    /// Recover the typed key from the flattened bytes.
    pub fn decode<K: Decode<()>>(&self) -> StoreResult<K> {
        from_bytes(&self.0)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        FlatKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for FlatKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Serialize a value into a fresh buffer.
pub fn to_bytes<T: Encode>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

/// Deserialize a value from a buffer.
pub fn from_bytes<T: Decode<()>>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Size of `value` once serialized.
pub fn encoded_size<T: Encode>(value: &T) -> StoreResult<usize> {
    Ok(to_bytes(value)?.len())
}

/// Prefix a serialized payload with its fixed-width type code.
pub fn frame_typed(code: TypeCode, payload: &[u8]) -> Vec<u8> {
    let mut row = Vec::with_capacity(TypeCode::WIDTH + payload.len());
    row.extend_from_slice(&code.0.to_be_bytes());
    row.extend_from_slice(payload);
    row
}

/// Split a multi-type row into its type code and payload.
pub fn split_typed(row: &[u8]) -> StoreResult<(TypeCode, &[u8])> {
    if row.len() < TypeCode::WIDTH {
        return Err(StoreError::Decode(bincode::error::DecodeError::Other(
            "multi-type row shorter than its type-code field",
        )));
    }
    let (head, payload) = row.split_at(TypeCode::WIDTH);
    let code = u32::from_be_bytes(head.try_into().expect("fixed-width split"));
    Ok((TypeCode(code), payload))
}
