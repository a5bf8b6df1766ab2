use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::memory::scan;
use crate::traits::PersistentStore;
use crate::transaction::{apply_operations, Transaction};

type Snapshot = BTreeMap<String, Value>;

/// Persistent store kept as a JSON snapshot on disk.
///
/// Several handles, in one process or many, may share the same file. Access
/// is serialized through an advisory lock on a `<file>.lock` sidecar: reads
/// hold it shared, commits hold it exclusive while they re-read the file,
/// check assertions against those fresh contents and write the result back.
///
/// Writes go through a temporary file in the same directory followed by an
/// atomic rename. A crash mid-write leaves the previous snapshot intact.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Open a store at `path`, creating an empty one if the file is missing.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        let keys = store.read(|data| data.len())?;
        tracing::debug!(path = %store.path.display(), keys, "opened file store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.read(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Open the sidecar and lock it. The lock is released when the returned
    /// file is dropped.
    fn lock(&self, exclusive: bool) -> StoreResult<File> {
        fs::create_dir_all(self.dir())?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(file)
    }

    fn load(&self) -> StoreResult<Snapshot> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Snapshot::new());
        }
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", self.path.display())))
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> StoreResult<T> {
        let _lock = self.lock(false)?;
        let data = self.load()?;
        Ok(f(&data))
    }

    fn persist(&self, data: &Snapshot) -> StoreResult<()> {
        let body = serde_json::to_vec_pretty(data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(self.dir())?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

impl PersistentStore for JsonFileStore {
    fn get(&self, key: &str) -> StoreResult<Value> {
        self.read(|data| data.get(key).cloned())?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    fn prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.read(|data| scan(data, prefix).map(|(k, _)| k.clone()).collect())
    }

    fn prefix_entries(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        self.read(|data| {
            scan(data, prefix)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    fn apply_transaction(&self, transaction: Transaction) -> StoreResult<()> {
        let _lock = self.lock(true)?;
        let mut staged = self.load()?;
        apply_operations(&mut staged, transaction.operations())?;
        self.persist(&staged)?;
        tracing::trace!(
            transaction = %transaction.id(),
            operations = transaction.len(),
            path = %self.path.display(),
            "committed transaction"
        );
        Ok(())
    }
}

impl std::fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileStore")
            .field("path", &self.path)
            .finish()
    }
}
