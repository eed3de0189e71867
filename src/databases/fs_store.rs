//! Filesystem engine: one directory per table, one file per record.
//!
//! The flattened key becomes the record's filename (hex form, since key
//! bytes are arbitrary). Every put writes and syncs its file, so the
//! engine has no transaction state of its own and the transaction hooks
//! stay no-ops.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::backend::{
    self, BackendTable, BoxedRawIter, OpenFlags, OpenTables, PutFlags, StorageBackend,
};
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};

const LOG: &str = "/store/fs";

/// Per-table metadata file (the multi-type flag).
const META_FILE: &str = ".table_meta";

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Filesystem-backed [`StorageBackend`].
pub struct FsStore {
    root: PathBuf,
    open: OpenTables,
    /// Serializes table open/delete against each other.
    state: Mutex<()>,
}

impl FsStore {
    /// Open (and if configured, create or prune) the database directory
    /// named by `config`.
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        let root = config.db_path();

        if config.tidy {
            backend::prune_db_dir(&root, config.tidy_wait_secs)?;
        }
        let exists = backend::check_db_dir(&root)?;
        if !exists && !(config.init || config.tidy) {
            log::error!(target: LOG, "database directory {} not found", root.display());
            return Err(StoreError::NotFound);
        }
        if !exists {
            backend::create_db_dir(&root)?;
        }

        log::info!(target: LOG, "opened filesystem database at {}", root.display());
        Ok(FsStore {
            root,
            open: OpenTables::new(),
            state: Mutex::new(()),
        })
    }

    fn table_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_multi_type(dir: &Path) -> StoreResult<bool> {
        let flag = fs::read(dir.join(META_FILE))?;
        Ok(flag.first().copied() == Some(1))
    }
}

impl StorageBackend for FsStore {
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

        let dir = self.table_dir(name);
        let multi_type = if dir.is_dir() {
            if flags.exclusive_create {
                return Err(StoreError::Exists);
            }
            let stored = Self::read_multi_type(&dir)?;
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
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(META_FILE), [u8::from(flags.multi_type)].as_slice())?;
            flags.multi_type
        };

        let table: Arc<dyn BackendTable> = Arc::new(FsTable {
            name: name.to_string(),
            multi_type,
            dir,
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
        let dir = self.table_dir(name);
        if !dir.is_dir() {
            return Err(StoreError::NotFound);
        }
        fs::remove_dir_all(&dir)?;
        log::info!(target: LOG, "deleted table {}", name);
        Ok(())
    }

    fn table_names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn open_table_count(&self) -> usize {
        self.open.live_count()
    }
}

/// One opened table directory.
#[derive(Debug)]
struct FsTable {
    name: String,
    multi_type: bool,
    dir: PathBuf,
    /// Serializes read-modify-write in `put` so the create/exclusive
    /// semantics hold under concurrency.
    write_lock: Mutex<()>,
}

impl FsTable {
    fn record_path(&self, key: &[u8]) -> PathBuf {
        self.dir.join(hex_encode(key))
    }

    /// Record filenames currently present, as (key bytes, path) pairs in
    /// key order.
    fn record_entries(&self) -> StoreResult<Vec<(Vec<u8>, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == META_FILE {
                continue;
            }
            if let Some(key) = hex_decode(&file_name) {
                entries.push((key, entry.path()));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

impl BackendTable for FsTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_multi_type(&self) -> bool {
        self.multi_type
    }

    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        match fs::read(self.record_path(key)) {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &[u8], value: &[u8], flags: PutFlags) -> StoreResult<()> {
        let _write = self.write_lock.lock().expect("table lock poisoned");
        let path = self.record_path(key);
        let exists = path.is_file();
        if exists && flags.exclusive_create {
            return Err(StoreError::Exists);
        }
        if !exists && !flags.create {
            return Err(StoreError::NotFound);
        }
        let mut file = fs::File::create(&path)?;
        file.write_all(value)?;
        file.sync_all()?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let _write = self.write_lock.lock().expect("table lock poisoned");
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn size(&self) -> StoreResult<usize> {
        Ok(self.record_entries()?.len())
    }

    fn iterate(&self) -> StoreResult<BoxedRawIter> {
        // Snapshot the directory listing; records are read lazily and a
        // record deleted mid-iteration is simply skipped.
        let entries = self.record_entries()?;
        Ok(Box::new(entries.into_iter().filter_map(|(key, path)| {
            match fs::read(&path) {
                Ok(value) => Some(Ok((key, value))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => Some(Err(e.into())),
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn fs_config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig::builder()
            .backend(BackendKind::Filesystem)
            .db_name("test_db")
            .dir(dir)
            .build()
    }

    #[test]
    fn test_hex_round_trip() {
        let key = vec![0x00, 0xff, 0x10, 0xab];
        assert_eq!(hex_encode(&key), "00ff10ab");
        assert_eq!(hex_decode("00ff10ab").unwrap(), key);
        assert!(hex_decode("0g").is_none());
        assert!(hex_decode("abc").is_none());
    }

    #[test]
    fn test_records_survive_reopen() {
        let scratch = tempfile::tempdir().unwrap();
        let config = fs_config(scratch.path());

        {
            let store = FsStore::open(&config).unwrap();
            let table = store.open_table("t", OpenFlags::create()).unwrap();
            table.put(b"key", b"value", PutFlags::create()).unwrap();
        }

        let store = FsStore::open(&config).unwrap();
        let table = store.open_table("t", OpenFlags::open_existing()).unwrap();
        assert_eq!(table.get(b"key").unwrap(), b"value");
        assert_eq!(table.size().unwrap(), 1);
    }

    #[test]
    fn test_meta_file_not_counted_as_record() {
        let scratch = tempfile::tempdir().unwrap();
        let store = FsStore::open(&fs_config(scratch.path())).unwrap();
        let table = store.open_table("t", OpenFlags::create()).unwrap();
        assert_eq!(table.size().unwrap(), 0);
        assert_eq!(table.iterate().unwrap().count(), 0);
    }

    #[test]
    fn test_delete_table_removes_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let config = fs_config(scratch.path());
        let store = FsStore::open(&config).unwrap();

        let table = store.open_table("t", OpenFlags::create()).unwrap();
        assert!(store.delete_table("t").unwrap_err().is_busy());
        drop(table);
        store.delete_table("t").unwrap();
        assert!(!scratch.path().join("test_db/t").exists());
    }
}
