//! Generic record persistence: JSON documents in named collections, keyed by
//! opaque string ids.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{collection}/{id} already exists")]
    Conflict { collection: String, id: String },

    #[error("{collection}/{id} not found")]
    Missing { collection: String, id: String },

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Equality match on top-level fields.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    fields: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Conflict` if the id is taken.
    async fn insert(&self, collection: &str, id: &str, record: Value) -> StoreResult<()>;

    /// Fails with `Missing` if there is nothing to replace.
    async fn update(&self, collection: &str, id: &str, record: Value) -> StoreResult<()>;

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Matching records ordered by id.
    async fn search(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Value>>;
}

/// A typed document in a collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

/// Typed access on top of any [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    async fn insert_record<R: Record>(&self, record: &R) -> StoreResult<()> {
        let value = serde_json::to_value(record)?;
        self.insert(R::COLLECTION, record.id(), value).await
    }

    async fn update_record<R: Record>(&self, record: &R) -> StoreResult<()> {
        let value = serde_json::to_value(record)?;
        self.update(R::COLLECTION, record.id(), value).await
    }

    /// Insert, or replace the record already stored under the same id.
    async fn upsert_record<R: Record>(&self, record: &R) -> StoreResult<()> {
        match self.insert_record(record).await {
            Err(StoreError::Conflict { .. }) => self.update_record(record).await,
            other => other,
        }
    }

    async fn get_record<R: Record>(&self, id: &str) -> StoreResult<Option<R>> {
        match self.get(R::COLLECTION, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn search_records<R: Record>(&self, filter: &Filter) -> StoreResult<Vec<R>> {
        self.search(R::COLLECTION, filter)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// Collections and ids become path components.
fn check_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// In-process store for tests and throwaway engines.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, collection: &str, id: &str, record: Value) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let docs = records.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        docs.insert(id.to_string(), record);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, record: Value) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(collection).and_then(|docs| docs.get_mut(id)) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(StoreError::Missing {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn search(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .get(collection)
            .map(|docs| docs.values().filter(|v| filter.matches(v)).cloned().collect())
            .unwrap_or_default())
    }
}

/// One pretty-printed JSON file per record at `<root>/<collection>/<id>.json`.
pub struct FileStore {
    root: PathBuf,
    /// Serializes the exists-check and the rename of insert/update.
    writes: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            writes: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, collection: &str, id: &str) -> StoreResult<PathBuf> {
        check_key(collection)?;
        check_key(id)?;
        Ok(self.root.join(collection).join(format!("{id}.json")))
    }

    /// Write to a temp file in the same directory, then rename.
    async fn write(&self, path: &Path, record: &Value) -> StoreResult<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        trace!(path = %path.display(), "record written");
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn insert(&self, collection: &str, id: &str, record: Value) -> StoreResult<()> {
        let path = self.path(collection, id)?;
        let _guard = self.writes.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        self.write(&path, &record).await
    }

    async fn update(&self, collection: &str, id: &str, record: Value) -> StoreResult<()> {
        let path = self.path(collection, id)?;
        let _guard = self.writes.lock().await;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::Missing {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        self.write(&path, &record).await
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        let path = self.path(collection, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn search(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        check_key(collection)?;
        let dir = self.root.join(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Replaced or removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) if filter.matches(&value) => {
                    found.insert(path, value);
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(found.into_values().collect())
    }
}
