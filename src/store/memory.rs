//! In-memory stores for tests and ephemeral runs.

use super::{BlobStore, Record, RecordStore, Result, StoreError, validate_key};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.blobs.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.blobs()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs()?.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // BTreeMap keys are already sorted.
        Ok(self
            .blobs()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.blobs()?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

#[derive(Debug)]
pub struct MemoryRecordStore<R> {
    records: Mutex<Vec<R>>,
}

impl<R> Default for MemoryRecordStore<R> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<R: Record> MemoryRecordStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, Vec<R>>> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl<R: Record> RecordStore<R> for MemoryRecordStore<R> {
    fn put(&self, record: R) -> Result<()> {
        let mut records = self.records()?;
        records.retain(|r| r.id() != record.id());
        records.push(record);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<R> {
        self.records()?
            .iter()
            .find(|r| r.id() == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<R>> {
        Ok(self.records()?.clone())
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|r| r.id() != id);
        if records.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn clear(&self) -> Result<usize> {
        let mut records = self.records()?;
        let n = records.len();
        records.clear();
        Ok(n)
    }
}
