// src/store.rs
//! Record store adapter for this deployment's own partition.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::StorageError;
use crate::types::EmployeeRecord;

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Records whose owning company equals `partition_key`. An empty partition
    /// is `Ok(vec![])`; only hard storage failures are errors.
    async fn fetch_by_company(
        &self,
        partition_key: &str,
    ) -> Result<Vec<EmployeeRecord>, StorageError>;

    fn name(&self) -> &'static str;
}

/// Fetch the local partition, logging hard failures before handing them back.
pub async fn fetch_local(
    store: &dyn RecordStore,
    partition_key: &str,
) -> Result<Vec<EmployeeRecord>, StorageError> {
    match store.fetch_by_company(partition_key).await {
        Ok(rows) => {
            tracing::debug!(
                store = store.name(),
                partition = partition_key,
                rows = rows.len(),
                "local fetch"
            );
            Ok(rows)
        }
        Err(e) => {
            tracing::warn!(
                store = store.name(),
                partition = partition_key,
                error = %e,
                "local store error"
            );
            Err(e)
        }
    }
}

/// JSON array of records on disk, re-read on every call.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file contents atomically (tmp + rename).
    pub async fn write_all(&self, records: &[EmployeeRecord]) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordStore for JsonFileStore {
    async fn fetch_by_company(
        &self,
        partition_key: &str,
    ) -> Result<Vec<EmployeeRecord>, StorageError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| StorageError::Io {
                path: self.path.clone(),
                source,
            })?;
        let rows: Vec<EmployeeRecord> =
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
                path: self.path.clone(),
                source,
            })?;
        Ok(rows
            .into_iter()
            .filter(|r| r.company == partition_key)
            .collect())
    }

    fn name(&self) -> &'static str {
        "json-file"
    }
}

/// In-process store for tests and demos.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<EmployeeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<EmployeeRecord>) -> Self {
        Self {
            rows: RwLock::new(records),
        }
    }

    pub fn insert(&self, record: EmployeeRecord) -> Result<(), StorageError> {
        self.rows
            .write()
            .map_err(|_| StorageError::Poisoned)?
            .push(record);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_by_company(
        &self,
        partition_key: &str,
    ) -> Result<Vec<EmployeeRecord>, StorageError> {
        let rows = self.rows.read().map_err(|_| StorageError::Poisoned)?;
        Ok(rows
            .iter()
            .filter(|r| r.company == partition_key)
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
