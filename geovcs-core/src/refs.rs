//! Named references and operation blobs
//!
//! A ref value is either a hex object id or `ref: <target>` for a symbolic
//! ref. Blobs are small named byte strings that ops park between steps
//! (merge message, paused operation record).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use tracing::debug;

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::storage::{ConnectionManager, DbHandle};

pub const HEAD: &str = "HEAD";
/// Root tree of the working tree
pub const WORK_HEAD: &str = "WORK_HEAD";
/// Root tree of the index
pub const STAGE_HEAD: &str = "STAGE_HEAD";
pub const ORIG_HEAD: &str = "ORIG_HEAD";
pub const MERGE_HEAD: &str = "MERGE_HEAD";
pub const CHERRY_PICK_HEAD: &str = "CHERRY_PICK_HEAD";

pub const HEADS_PREFIX: &str = "refs/heads/";
pub const TAGS_PREFIX: &str = "refs/tags/";
pub const MASTER: &str = "refs/heads/master";

/// Blob holding the message of a pending merge commit
pub const MERGE_MSG: &str = "MERGE_MSG";
/// Blob holding the paused sequencer operation
pub const PAUSED_OPERATION: &str = "PAUSED_OPERATION";

const SYMREF_PREFIX: &str = "ref: ";
const MAX_SYMREF_DEPTH: usize = 5;

/// A resolved reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    name: String,
    /// Target name when the ref is symbolic
    target: Option<String>,
    object_id: ObjectId,
}

impl Ref {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn is_symbolic(&self) -> bool {
        self.target.is_some()
    }

    /// Name without the `refs/heads/` or `refs/tags/` prefix
    pub fn short_name(&self) -> &str {
        short_name(&self.name)
    }
}

pub fn short_name(name: &str) -> &str {
    name.strip_prefix(HEADS_PREFIX)
        .or_else(|| name.strip_prefix(TAGS_PREFIX))
        .unwrap_or(name)
}

pub fn branch_ref(name: &str) -> String {
    if name.starts_with(HEADS_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", HEADS_PREFIX, name)
    }
}

pub fn tag_ref(name: &str) -> String {
    if name.starts_with(TAGS_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", TAGS_PREFIX, name)
    }
}

/// Raw ref and blob storage
///
/// Implementations only store strings; [`RefDatabase::get_ref`] and friends
/// layer resolution on top.
pub trait RefDatabase: Send + Sync {
    fn get_raw(&self, name: &str) -> Result<Option<String>>;

    /// Atomically replace `name` if its current value equals `expected`
    /// (`None` meaning absent); `new = None` deletes
    fn compare_and_put(&self, name: &str, expected: Option<&str>, new: Option<&str>) -> Result<bool>;

    fn put_raw(&self, name: &str, value: &str) -> Result<()>;

    fn remove_raw(&self, name: &str) -> Result<Option<String>>;

    /// Raw values of all refs whose name starts with `prefix`, sorted by name
    fn list_raw(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put_blob(&self, key: &str, value: &[u8]) -> Result<()>;

    fn remove_blob(&self, key: &str) -> Result<()>;

    /// Resolve `name` through symbolic links
    fn get_ref(&self, name: &str) -> Result<Option<Ref>> {
        let mut current = name.to_string();
        let mut target = None;
        for _ in 0..MAX_SYMREF_DEPTH {
            let Some(value) = self.get_raw(&current)? else {
                return Ok(target.map(|t| Ref {
                    name: name.to_string(),
                    target: Some(t),
                    object_id: ObjectId::NULL,
                }));
            };
            match value.strip_prefix(SYMREF_PREFIX) {
                Some(next) => {
                    current = next.to_string();
                    target.get_or_insert_with(|| current.clone());
                }
                None => {
                    return Ok(Some(Ref {
                        name: name.to_string(),
                        target,
                        object_id: ObjectId::from_hex(value.trim())?,
                    }));
                }
            }
        }
        Err(Error::Corrupt(format!("symbolic ref loop at {}", name)))
    }

    /// Id a ref resolves to; an unborn symbolic ref resolves to `None`
    fn resolve_id(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self
            .get_ref(name)?
            .map(|r| r.object_id)
            .filter(|id| !id.is_null()))
    }

    /// Immediate symbolic target of `name`, if it is symbolic
    fn symref_target(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .get_raw(name)?
            .and_then(|v| v.strip_prefix(SYMREF_PREFIX).map(str::to_string)))
    }

    fn put_ref(&self, name: &str, id: &ObjectId) -> Result<()> {
        debug!(name, id = %id, "Update ref");
        self.put_raw(name, &id.to_hex())
    }

    fn put_symref(&self, name: &str, target: &str) -> Result<()> {
        debug!(name, target, "Update symbolic ref");
        self.put_raw(name, &format!("{}{}", SYMREF_PREFIX, target))
    }

    /// Move `name` from `expected` to `new`; fails when it moved meanwhile
    fn update_ref(&self, name: &str, expected: Option<&ObjectId>, new: &ObjectId) -> Result<()> {
        let expected_hex = expected.map(ObjectId::to_hex);
        if self.compare_and_put(name, expected_hex.as_deref(), Some(&new.to_hex()))? {
            debug!(name, id = %new, "Update ref");
            Ok(())
        } else {
            Err(Error::IllegalState(format!(
                "ref {} was concurrently modified",
                name
            )))
        }
    }

    fn delete_ref(&self, name: &str) -> Result<Option<String>> {
        self.remove_raw(name)
    }

    /// Resolved refs under `prefix`
    fn list_refs(&self, prefix: &str) -> Result<Vec<Ref>> {
        let mut refs = Vec::new();
        for (name, _) in self.list_raw(prefix)? {
            if let Some(r) = self.get_ref(&name)? {
                refs.push(r);
            }
        }
        Ok(refs)
    }
}

// ==================== In-memory refs ====================

#[derive(Default)]
pub struct HeapRefDatabase {
    refs: RwLock<BTreeMap<String, String>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl HeapRefDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefDatabase for HeapRefDatabase {
    fn get_raw(&self, name: &str) -> Result<Option<String>> {
        Ok(self.refs.read()?.get(name).cloned())
    }

    fn compare_and_put(&self, name: &str, expected: Option<&str>, new: Option<&str>) -> Result<bool> {
        let mut refs = self.refs.write()?;
        if refs.get(name).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => refs.insert(name.to_string(), value.to_string()),
            None => refs.remove(name),
        };
        Ok(true)
    }

    fn put_raw(&self, name: &str, value: &str) -> Result<()> {
        self.refs.write()?.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn remove_raw(&self, name: &str) -> Result<Option<String>> {
        Ok(self.refs.write()?.remove(name))
    }

    fn list_raw(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .refs
            .read()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read()?.get(key).cloned())
    }

    fn put_blob(&self, key: &str, value: &[u8]) -> Result<()> {
        self.blobs.write()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove_blob(&self, key: &str) -> Result<()> {
        self.blobs.write()?.remove(key);
        Ok(())
    }
}

// ==================== Persistent refs ====================

/// Refs and blobs in two trees of one sled database
pub struct SledRefDatabase {
    handle: DbHandle,
    refs: sled::Tree,
    blobs: sled::Tree,
}

impl SledRefDatabase {
    pub fn open(manager: &ConnectionManager, path: &Path, read_only: bool) -> Result<Self> {
        let handle = manager.acquire(path, read_only)?;
        let refs = handle.db().open_tree("refs")?;
        let blobs = handle.db().open_tree("blobs")?;
        Ok(Self { handle, refs, blobs })
    }

    fn decode(raw: &[u8]) -> Result<String> {
        String::from_utf8(raw.to_vec()).map_err(|e| Error::Corrupt(e.to_string()))
    }

    fn write<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.handle.check_writable()?;
        let out = f()?;
        self.handle.db().flush()?;
        Ok(out)
    }
}

impl RefDatabase for SledRefDatabase {
    fn get_raw(&self, name: &str) -> Result<Option<String>> {
        self.refs.get(name)?.map(|raw| Self::decode(&raw)).transpose()
    }

    fn compare_and_put(&self, name: &str, expected: Option<&str>, new: Option<&str>) -> Result<bool> {
        self.write(|| {
            let swapped = self.refs.compare_and_swap(
                name,
                expected.map(str::as_bytes),
                new.map(str::as_bytes),
            )?;
            Ok(swapped.is_ok())
        })
    }

    fn put_raw(&self, name: &str, value: &str) -> Result<()> {
        self.write(|| {
            self.refs.insert(name, value.as_bytes())?;
            Ok(())
        })
    }

    fn remove_raw(&self, name: &str) -> Result<Option<String>> {
        self.write(|| {
            self.refs
                .remove(name)?
                .map(|raw| Self::decode(&raw))
                .transpose()
        })
    }

    fn list_raw(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for item in self.refs.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((Self::decode(&k)?, Self::decode(&v)?));
        }
        Ok(out)
    }

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key)?.map(|v| v.to_vec()))
    }

    fn put_blob(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write(|| {
            self.blobs.insert(key, value)?;
            Ok(())
        })
    }

    fn remove_blob(&self, key: &str) -> Result<()> {
        self.write(|| {
            self.blobs.remove(key)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn check_refs_contract(db: &dyn RefDatabase) {
        let a = ObjectId::from_data(b"a");
        let b = ObjectId::from_data(b"b");

        assert!(db.get_ref(HEAD).unwrap().is_none());
        db.put_symref(HEAD, MASTER).unwrap();
        // unborn branch
        let head = db.get_ref(HEAD).unwrap().unwrap();
        assert_eq!(head.target(), Some(MASTER));
        assert!(db.resolve_id(HEAD).unwrap().is_none());

        db.put_ref(MASTER, &a).unwrap();
        assert_eq!(db.resolve_id(HEAD).unwrap(), Some(a));
        assert_eq!(db.symref_target(HEAD).unwrap().as_deref(), Some(MASTER));
        assert!(db.symref_target(MASTER).unwrap().is_none());

        db.update_ref(MASTER, Some(&a), &b).unwrap();
        assert!(db.update_ref(MASTER, Some(&a), &a).is_err());
        db.update_ref("refs/heads/new", None, &a).unwrap();

        let branches: Vec<_> = db
            .list_refs(HEADS_PREFIX)
            .unwrap()
            .into_iter()
            .map(|r| (r.short_name().to_string(), r.object_id()))
            .collect();
        assert_eq!(branches, vec![("master".to_string(), b), ("new".to_string(), a)]);

        assert!(db.delete_ref("refs/heads/new").unwrap().is_some());
        assert!(db.get_ref("refs/heads/new").unwrap().is_none());

        db.put_symref("LOOP", "LOOP").unwrap();
        assert!(db.get_ref("LOOP").is_err());

        assert!(db.get_blob(MERGE_MSG).unwrap().is_none());
        db.put_blob(MERGE_MSG, b"hello").unwrap();
        assert_eq!(db.get_blob(MERGE_MSG).unwrap().unwrap(), b"hello");
        db.remove_blob(MERGE_MSG).unwrap();
        assert!(db.get_blob(MERGE_MSG).unwrap().is_none());
    }

    #[test]
    fn test_heap_refs() {
        check_refs_contract(&HeapRefDatabase::new());
    }

    #[test]
    fn test_sled_refs() {
        let temp_dir = TempDir::new().unwrap();
        let db = SledRefDatabase::open(&ConnectionManager::new(), &temp_dir.path().join("refs"), false).unwrap();
        check_refs_contract(&db);
    }

    #[test]
    fn test_ref_names() {
        assert_eq!(branch_ref("dev"), "refs/heads/dev");
        assert_eq!(branch_ref("refs/heads/dev"), "refs/heads/dev");
        assert_eq!(tag_ref("v1"), "refs/tags/v1");
        assert_eq!(short_name("refs/tags/v1"), "v1");
        assert_eq!(short_name(HEAD), "HEAD");
    }
}
