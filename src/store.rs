//! Persistent key-value storage backing the attribution state.
//!
//! The SDK only needs string values under a handful of fixed keys. [`KeyValueStore`] abstracts
//! over whatever the host application uses to persist them; [`InMemoryStore`] and [`FileStore`]
//! are provided out of the box.
use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::RwLock,
};

use async_trait::async_trait;

use crate::error::StoreError;

/// A single mutation applied by [`KeyValueStore::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Set `key` to `value`.
    Set(&'static str, String),
    /// Remove `key`.
    Remove(&'static str),
}

impl StoreOp {
    /// Key affected by this operation.
    pub fn key(&self) -> &'static str {
        match self {
            StoreOp::Set(key, _) | StoreOp::Remove(key) => key,
        }
    }
}

/// Storage for SDK state. Values survive application restarts if the implementation persists them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get value stored under `key`. Returns `Ok(None)` if there's no value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove value stored under `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Apply a batch of operations.
    ///
    /// The default implementation applies operations one by one, so a failure in the middle leaves
    /// the batch partially applied. Implementations that can commit atomically should override it.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        for op in ops {
            match op {
                StoreOp::Set(key, value) => self.set(key, value).await?,
                StoreOp::Remove(key) => self.remove(key).await?,
            }
        }
        Ok(())
    }
}

/// `InMemoryStore` keeps values in process memory. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        InMemoryStore::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.read().map_err(|_| "store lock poisoned")?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut values = self.values.write().map_err(|_| "store lock poisoned")?;
        values.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().map_err(|_| "store lock poisoned")?;
        values.remove(key);
        Ok(())
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut values = self.values.write().map_err(|_| "store lock poisoned")?;
        apply_ops(&mut values, ops);
        Ok(())
    }
}

/// `FileStore` persists values as a single JSON object on disk.
///
/// Every mutation rewrites the whole file through a temporary file followed by a rename, so
/// readers never observe a half-written file and [`KeyValueStore::apply`] batches are committed
/// atomically.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // `None` until the file is read for the first time.
    values: tokio::sync::Mutex<Option<HashMap<String, String>>>,
}

impl FileStore {
    /// Create a store backed by the file at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore {
            path: path.into(),
            values: tokio::sync::Mutex::new(None),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling of the backing file that new contents are written to before the rename. The
    /// suffix is appended to the full file name, so `a.json` and `a.dat` never share it.
    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn load(path: &Path) -> Result<HashMap<String, String>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(values)?;
        let tmp_path = self.tmp_path();
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Run `f` over the current values and persist the result. On failure, the in-memory copy is
    /// dropped so the next access reloads from disk.
    async fn mutate(
        &self,
        f: impl FnOnce(&mut HashMap<String, String>),
    ) -> Result<(), StoreError> {
        let mut slot = self.values.lock().await;
        let mut values = match slot.take() {
            Some(values) => values,
            None => FileStore::load(&self.path).await?,
        };
        f(&mut values);
        self.persist(&values).await?;
        *slot = Some(values);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut slot = self.values.lock().await;
        if slot.is_none() {
            *slot = Some(FileStore::load(&self.path).await?);
        }
        Ok(slot.as_ref().and_then(|values| values.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.mutate(|values| {
            values.insert(key.to_owned(), value);
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(|values| {
            values.remove(key);
        })
        .await
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        self.mutate(|values| apply_ops(values, ops)).await
    }
}

fn apply_ops(values: &mut HashMap<String, String>, ops: Vec<StoreOp>) {
    for op in ops {
        match op {
            StoreOp::Set(key, value) => {
                values.insert(key.to_owned(), value);
            }
            StoreOp::Remove(key) => {
                values.remove(key);
            }
        }
    }
}
