//! Storage configuration.
//!
//! A [`StorageConfig`] is produced once by the application's configuration
//! loading (out of scope here) and consumed at [`DurableStore`] construction
//! to select and initialize the physical engine.
//!
//! [`DurableStore`]: crate::store::DurableStore

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Which physical engine backs the store.
///
/// Parsed from the configuration string form ("memory", "sled",
/// "filesystem").
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// RAM-only store, not durable. Useful for tests and caching daemons.
    Memory,
    /// Embedded transactional key-value engine.
    Sled,
    /// One directory per table, one file per record.
    Filesystem,
}

/// Backend selection record for a [`DurableStore`].
///
/// # Examples
///
/// ```
/// use durable_store::config::{BackendKind, StorageConfig};
///
/// let config = StorageConfig::builder()
///     .backend(BackendKind::Sled)
///     .db_name("daemon")
///     .dir("/var/lib/daemon/db")
///     .max_nondurable_transactions(20)
///     .build();
/// ```
///
/// [`DurableStore`]: crate::store::DurableStore
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(doc)]
pub struct StorageConfig {
    /// Physical engine to open.
    pub backend: BackendKind,

    /// Database name (directory name under `dir` for file-backed engines).
    #[builder(default = String::from("database"), setter(into))]
    pub db_name: String,

    /// Parent directory for the engine's files.
    #[builder(default = PathBuf::from("."), setter(into))]
    pub dir: PathBuf,

    /// Create the database on startup if it does not exist.
    #[builder(default = true)]
    pub init: bool,

    /// Prune any existing database contents on startup.
    #[builder(default = false)]
    pub tidy: bool,

    /// Seconds to wait (with a warning per second) before tidying.
    #[builder(default = 0)]
    pub tidy_wait_secs: u32,

    /// Transaction-batching ceiling: how many transactions may close
    /// non-durably before a close is forced durable. Bounds crash loss to
    /// at most this many logical transactions.
    #[builder(default = 10)]
    pub max_nondurable_transactions: u32,

    /// Optional clean-shutdown marker: written on orderly store
    /// destruction, removed at the start of the next construction.
    #[builder(default, setter(strip_option, into))]
    pub clean_shutdown_file: Option<PathBuf>,
}

impl StorageConfig {
    /// Configuration for a memory-backed store, the common test setup.
    pub fn memory() -> Self {
        StorageConfig::builder().backend(BackendKind::Memory).build()
    }

    /// Full path of the database directory for file-backed engines.
    pub fn db_path(&self) -> PathBuf {
        self.dir.join(&self.db_name)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_backend_kind_parses_config_strings() {
        assert_eq!(BackendKind::from_str("memory").unwrap(), BackendKind::Memory);
        assert_eq!(BackendKind::from_str("sled").unwrap(), BackendKind::Sled);
        assert_eq!(
            BackendKind::from_str("filesystem").unwrap(),
            BackendKind::Filesystem
        );
        assert!(BackendKind::from_str("berkeleydb").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = StorageConfig::memory();
        assert_eq!(config.db_name, "database");
        assert!(config.init);
        assert!(!config.tidy);
        assert_eq!(config.max_nondurable_transactions, 10);
        assert!(config.clean_shutdown_file.is_none());
    }

    #[test]
    fn test_db_path_joins_dir_and_name() {
        let config = StorageConfig::builder()
            .backend(BackendKind::Filesystem)
            .db_name("store")
            .dir("/tmp/data")
            .build();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/data/store"));
    }
}
