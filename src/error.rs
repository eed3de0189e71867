use thiserror::Error;

use crate::codec::TypeCode;

pub type StoreResult<T> = Result<T, StoreError>;

/// Error taxonomy for the storage layer.
///
/// `NotFound`, `Exists` and `Busy` are expected conditions that callers
/// routinely branch on. Everything else is an engine or codec failure that
/// is surfaced unchanged; this layer never retries.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not Found")]
    NotFound,

    #[error("Already Exists")]
    Exists,

    #[error("Busy: table is still referenced")]
    Busy,

    #[error("Corrupt multi-type row: unregistered type code {0}")]
    Corrupt(TypeCode),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sled Error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Encode Error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decode Error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, StoreError::Exists)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy)
    }
}
