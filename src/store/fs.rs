//! Filesystem-backed stores.

use super::{BlobStore, Record, RecordStore, Result, StoreError, validate_key};
use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

/// Prefix of in-flight temp files; never listed.
const TEMP_PREFIX: &str = ".tmp-";

/// One file per key under `root`. Keys may contain `/` to nest.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn not_found(key: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io(e)
        }
    }
}

/// Write via a sibling temp file + rename so readers see all or nothing.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        debug!(key, bytes = bytes.len(), "blob put");
        write_atomic(&path, bytes)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(not_found(key))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        debug!(key, "blob delete");
        fs::remove_file(&path).map_err(not_found(key))
    }
}

/// All records of one type in a single pretty-printed JSON array file.
///
/// Every mutation is a locked read-modify-write of the whole file, which is
/// fine for the record counts this service sees.
#[derive(Debug)]
pub struct JsonRecordStore<R> {
    path: PathBuf,
    lock: Mutex<()>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> JsonRecordStore<R> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
            _record: PhantomData,
        })
    }

    fn load(&self) -> Result<Vec<R>> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, records: &[R]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        write_atomic(&self.path, json.as_bytes())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut Vec<R>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut records = self.load()?;
        let out = f(&mut records)?;
        self.save(&records)?;
        Ok(out)
    }
}

impl<R: Record> RecordStore<R> for JsonRecordStore<R> {
    fn put(&self, record: R) -> Result<()> {
        self.modify(|records| {
            records.retain(|r| r.id() != record.id());
            records.push(record);
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> Result<R> {
        self.list()?
            .into_iter()
            .find(|r| r.id() == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<R>> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.load()
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|r| r.id() != id);
            if records.len() == before {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    fn clear(&self) -> Result<usize> {
        self.modify(|records| {
            let n = records.len();
            records.clear();
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, Role};
    use crate::types::ResultRecord;
    use tempfile::TempDir;

    #[test]
    fn blob_put_get_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::open(tmp.path().join("blobs")).unwrap();

        store.put("a.png", b"abc").unwrap();
        assert!(store.exists("a.png").unwrap());
        assert_eq!(store.get("a.png").unwrap(), b"abc");

        store.delete("a.png").unwrap();
        assert!(!store.exists("a.png").unwrap());
        assert!(matches!(store.get("a.png"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("a.png"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn blob_list_nested_and_prefixed() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::open(tmp.path()).unwrap();
        store.put("b.png", b"1").unwrap();
        store.put("stress/u0.png", b"2").unwrap();
        store.put("stress/u1.png", b"3").unwrap();

        assert_eq!(
            store.list("").unwrap(),
            vec!["b.png", "stress/u0.png", "stress/u1.png"]
        );
        assert_eq!(store.list("stress/").unwrap().len(), 2);
        assert_eq!(store.clear_prefix("stress/").unwrap(), 2);
        assert_eq!(store.list("").unwrap(), vec!["b.png"]);
    }

    #[test]
    fn blob_put_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::open(tmp.path()).unwrap();
        store.put("x.png", b"payload").unwrap();
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["x.png"]);
    }

    #[test]
    fn blob_rejects_escaping_keys() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.put("../evil.png", b"x"),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn records_persist_across_instances() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data/results.json");
        let who = Identity::new("alice", Role::User);
        let record = ResultRecord::new("in.png", "out.png", &who).with_extra("iterations", 4);

        {
            let store: JsonRecordStore<ResultRecord> = JsonRecordStore::open(&path).unwrap();
            store.put(record.clone()).unwrap();
        }

        let store: JsonRecordStore<ResultRecord> = JsonRecordStore::open(&path).unwrap();
        assert_eq!(store.list().unwrap(), vec![record.clone()]);
        assert_eq!(store.get(record.id).unwrap(), record);
    }

    #[test]
    fn records_delete_and_clear() {
        let tmp = TempDir::new().unwrap();
        let store: JsonRecordStore<ResultRecord> =
            JsonRecordStore::open(tmp.path().join("results.json")).unwrap();
        let who = Identity::new("alice", Role::User);
        let a = ResultRecord::new("in.png", "a.png", &who);
        let b = ResultRecord::new("in.png", "b.png", &who);
        store.put(a.clone()).unwrap();
        store.put(b.clone()).unwrap();

        store.delete(a.id).unwrap();
        assert!(matches!(store.delete(a.id), Err(StoreError::NotFound(_))));
        assert_eq!(store.list().unwrap(), vec![b]);

        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store: JsonRecordStore<ResultRecord> =
            JsonRecordStore::open(tmp.path().join("none.json")).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
