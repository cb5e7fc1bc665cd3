//! Storage collaborators: blobs for image bytes, records for metadata.
//!
//! Both are traits so the core never reaches for a global client. Two
//! implementations ship with the crate:
//!
//! | Store | Filesystem | In memory |
//! |---|---|---|
//! | [`BlobStore`] | [`FsBlobStore`]: one file per key under a root directory | [`MemoryBlobStore`] |
//! | [`RecordStore`] | [`JsonRecordStore`]: one JSON array file | [`MemoryRecordStore`] |
//!
//! Sources are only ever read during a job; writes always target fresh,
//! uniquely named keys, and the filesystem store writes through a temp
//! file + rename so a reader never observes a partial image.
//!
//! ## Visibility
//!
//! Who may see which records is a query concern of the record store:
//! [`RecordStore::list_visible`] returns everything to an admin and only
//! the caller's own records to everyone else.

mod fs;
mod memory;

pub use fs::{FsBlobStore, JsonRecordStore};
pub use memory::{MemoryBlobStore, MemoryRecordStore};

use crate::identity::Identity;
use crate::types::{ResultRecord, UploadRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Flat key → bytes storage.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fails with [`StoreError::NotFound`] for an absent key.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fails with [`StoreError::NotFound`] for an absent key.
    fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`, returning how many went.
    fn clear_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix)?;
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }
}

/// A persisted metadata record.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> Uuid;
    /// Username of the record's owner.
    fn owner(&self) -> &str;
}

impl Record for ResultRecord {
    fn id(&self) -> Uuid {
        self.id
    }

    fn owner(&self) -> &str {
        &self.user
    }
}

impl Record for UploadRecord {
    fn id(&self) -> Uuid {
        self.id
    }

    fn owner(&self) -> &str {
        &self.user
    }
}

/// Structured record storage with put/get/list/delete.
pub trait RecordStore<R: Record>: Send + Sync {
    fn put(&self, record: R) -> Result<()>;

    fn get(&self, id: Uuid) -> Result<R>;

    /// All records in insertion order.
    fn list(&self) -> Result<Vec<R>>;

    fn delete(&self, id: Uuid) -> Result<()>;

    /// Remove every record, returning how many went.
    fn clear(&self) -> Result<usize>;

    /// Records `who` may see: all of them for an admin, otherwise their own.
    fn list_visible(&self, who: &Identity) -> Result<Vec<R>> {
        let all = self.list()?;
        if who.is_admin() {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|r| r.owner() == who.username)
            .collect())
    }

    /// First record matching `pred`.
    fn find(&self, pred: &dyn Fn(&R) -> bool) -> Result<Option<R>> {
        Ok(self.list()?.into_iter().find(|r| pred(r)))
    }
}

/// Reject keys that could escape a store's root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
