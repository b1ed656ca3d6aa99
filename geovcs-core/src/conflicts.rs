//! Merge conflict storage
//!
//! Conflicts are keyed by path inside a namespace. `None` selects the
//! default namespace; a transaction id selects a private one sharing the
//! same backing directory. Reading a namespace that was never written
//! yields no conflicts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, info};

use crate::codec::{Reader, write_str};
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::storage::{ConnectionManager, DbHandle};
use crate::tree::is_same_or_child;

/// Conflicts fetched per round trip by [`ConflictIter`]
pub const PAGE_SIZE: usize = 1000;

const HAS_ANCESTOR: u8 = 0x01;
const HAS_OURS: u8 = 0x02;
const HAS_THEIRS: u8 = 0x04;

/// A path where ancestor, ours and theirs disagree
///
/// A null id means the path is absent on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    path: String,
    ancestor: ObjectId,
    ours: ObjectId,
    theirs: ObjectId,
}

impl Conflict {
    pub fn new(path: impl Into<String>, ancestor: ObjectId, ours: ObjectId, theirs: ObjectId) -> Self {
        Self {
            path: path.into(),
            ancestor,
            ours,
            theirs,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ancestor(&self) -> ObjectId {
        self.ancestor
    }

    pub fn ours(&self) -> ObjectId {
        self.ours
    }

    pub fn theirs(&self) -> ObjectId {
        self.theirs
    }

    /// Stored layout: presence flags, path, then the non-null ids in
    /// ancestor, ours, theirs order
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.path.len() + 61);
        let mut flags = 0u8;
        for (id, flag) in [(&self.ancestor, HAS_ANCESTOR), (&self.ours, HAS_OURS), (&self.theirs, HAS_THEIRS)] {
            if !id.is_null() {
                flags |= flag;
            }
        }
        out.push(flags);
        write_str(&mut out, &self.path);
        for id in [&self.ancestor, &self.ours, &self.theirs] {
            if !id.is_null() {
                out.extend_from_slice(id.as_bytes());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let flags = r.u8()?;
        if flags & !(HAS_ANCESTOR | HAS_OURS | HAS_THEIRS) != 0 {
            return Err(Error::Corrupt(format!("invalid conflict flags {:#04x}", flags)));
        }
        let path = r.string()?;
        let mut read = |flag: u8| -> Result<ObjectId> {
            if flags & flag != 0 { r.id() } else { Ok(ObjectId::NULL) }
        };
        let ancestor = read(HAS_ANCESTOR)?;
        let ours = read(HAS_OURS)?;
        let theirs = read(HAS_THEIRS)?;
        if !r.is_at_end() {
            return Err(Error::Corrupt("trailing bytes after conflict".to_string()));
        }
        Ok(Self {
            path,
            ancestor,
            ours,
            theirs,
        })
    }
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\t{}\t{}\t{}", self.path, self.ancestor, self.ours, self.theirs)
    }
}

fn matches(path: &str, prefix: Option<&str>) -> bool {
    prefix.map(|p| is_same_or_child(path, p)).unwrap_or(true)
}

/// Conflict storage scoped by transaction namespace
pub trait ConflictsDatabase: Send + Sync {
    /// Up to `limit` conflicts at or under `prefix`, in path order, starting
    /// after `after`
    fn page(
        &self,
        tx: Option<&str>,
        prefix: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Conflict>>;

    fn get_conflict(&self, tx: Option<&str>, path: &str) -> Result<Option<Conflict>>;

    /// Upsert conflicts by path with a durable write
    fn add_conflicts(&self, tx: Option<&str>, conflicts: &[Conflict]) -> Result<()>;

    fn remove_conflicts(&self, tx: Option<&str>, paths: &[String]) -> Result<()>;

    /// Remove the conflicts at or under `prefix`, or every conflict when
    /// `prefix` is `None`
    fn remove_by_prefix(&self, tx: Option<&str>, prefix: Option<&str>) -> Result<()>;

    /// Drop the whole namespace
    fn remove_all(&self, tx: Option<&str>) -> Result<()>;

    fn has_conflicts(&self, tx: Option<&str>) -> Result<bool> {
        Ok(!self.page(tx, None, None, 1)?.is_empty())
    }

    fn get_count_by_prefix(&self, tx: Option<&str>, prefix: Option<&str>) -> Result<usize> {
        let mut count = 0;
        let mut after: Option<String> = None;
        loop {
            let page = self.page(tx, prefix, after.as_deref(), PAGE_SIZE)?;
            count += page.len();
            match page.last() {
                Some(last) if page.len() == PAGE_SIZE => after = Some(last.path.clone()),
                _ => return Ok(count),
            }
        }
    }

    /// The subset of `paths` that have a conflict
    fn find_conflicts(&self, tx: Option<&str>, paths: &[String]) -> Result<BTreeSet<String>> {
        let mut found = BTreeSet::new();
        for path in paths {
            if self.get_conflict(tx, path)?.is_some() {
                found.insert(path.clone());
            }
        }
        Ok(found)
    }

    fn add_conflict(&self, tx: Option<&str>, conflict: Conflict) -> Result<()> {
        self.add_conflicts(tx, &[conflict])
    }

    fn remove_conflict(&self, tx: Option<&str>, path: &str) -> Result<()> {
        self.remove_conflicts(tx, &[path.to_string()])
    }
}

impl dyn ConflictsDatabase + '_ {
    /// Lazily iterate the conflicts at or under `prefix` in path order
    pub fn get_by_prefix(&self, tx: Option<&str>, prefix: Option<&str>) -> ConflictIter<'_> {
        ConflictIter::new(self, tx, prefix)
    }
}

/// Conflicts collected from a paged reader, one page in memory at a time
pub struct ConflictIter<'a> {
    db: &'a dyn ConflictsDatabase,
    tx: Option<String>,
    prefix: Option<String>,
    after: Option<String>,
    page: std::vec::IntoIter<Conflict>,
    exhausted: bool,
}

impl<'a> ConflictIter<'a> {
    pub fn new(db: &'a dyn ConflictsDatabase, tx: Option<&str>, prefix: Option<&str>) -> Self {
        Self {
            db,
            tx: tx.map(str::to_string),
            prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
            after: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }
}

impl Iterator for ConflictIter<'_> {
    type Item = Result<Conflict>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(conflict) = self.page.next() {
                self.after = Some(conflict.path.clone());
                return Some(Ok(conflict));
            }
            if self.exhausted {
                return None;
            }
            match self.db.page(
                self.tx.as_deref(),
                self.prefix.as_deref(),
                self.after.as_deref(),
                PAGE_SIZE,
            ) {
                Ok(page) => {
                    self.exhausted = page.len() < PAGE_SIZE;
                    if page.is_empty() {
                        return None;
                    }
                    self.page = page.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Directory and map key for `tx`; the id becomes a path component
fn namespace(tx: Option<&str>) -> Result<String> {
    match tx {
        Some(tx) if tx.is_empty() || tx.contains(['/', '\\', '\0']) || tx.contains("..") => {
            Err(Error::InvalidArgument(format!("invalid transaction id '{}'", tx)))
        }
        Some(tx) => Ok(format!(".{}", tx)),
        None => Ok(".default".to_string()),
    }
}

// ==================== In-memory conflicts ====================

#[derive(Default)]
pub struct HeapConflictsDatabase {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Conflict>>>,
}

impl HeapConflictsDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConflictsDatabase for HeapConflictsDatabase {
    fn page(
        &self,
        tx: Option<&str>,
        prefix: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        let ns = namespace(tx)?;
        let namespaces = self.namespaces.read()?;
        let Some(conflicts) = namespaces.get(&ns) else {
            return Ok(Vec::new());
        };
        let start = match after {
            Some(a) => Bound::Excluded(a.to_string()),
            None => Bound::Unbounded,
        };
        Ok(conflicts
            .range((start, Bound::Unbounded))
            .map(|(_, c)| c)
            .filter(|c| matches(&c.path, prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    fn get_conflict(&self, tx: Option<&str>, path: &str) -> Result<Option<Conflict>> {
        let ns = namespace(tx)?;
        Ok(self
            .namespaces
            .read()?
            .get(&ns)
            .and_then(|c| c.get(path).cloned()))
    }

    fn add_conflicts(&self, tx: Option<&str>, conflicts: &[Conflict]) -> Result<()> {
        let key = namespace(tx)?;
        let mut namespaces = self.namespaces.write()?;
        let ns = namespaces.entry(key).or_default();
        for c in conflicts {
            ns.insert(c.path.clone(), c.clone());
        }
        Ok(())
    }

    fn remove_conflicts(&self, tx: Option<&str>, paths: &[String]) -> Result<()> {
        let key = namespace(tx)?;
        if let Some(ns) = self.namespaces.write()?.get_mut(&key) {
            for path in paths {
                ns.remove(path);
            }
        }
        Ok(())
    }

    fn remove_by_prefix(&self, tx: Option<&str>, prefix: Option<&str>) -> Result<()> {
        let key = namespace(tx)?;
        if let Some(ns) = self.namespaces.write()?.get_mut(&key) {
            ns.retain(|path, _| !matches(path, prefix));
        }
        Ok(())
    }

    fn remove_all(&self, tx: Option<&str>) -> Result<()> {
        let key = namespace(tx)?;
        self.namespaces.write()?.remove(&key);
        Ok(())
    }
}

// ==================== Persistent conflicts ====================

/// Conflicts persisted in one sled database per namespace under a base
/// directory
pub struct SledConflictsDatabase {
    manager: ConnectionManager,
    base: PathBuf,
    read_only: bool,
    open: Mutex<HashMap<String, DbHandle>>,
}

impl SledConflictsDatabase {
    pub fn open(manager: &ConnectionManager, base: &Path, read_only: bool) -> Result<Self> {
        if !read_only {
            std::fs::create_dir_all(base)?;
        }
        Ok(Self {
            manager: manager.clone(),
            base: base.to_path_buf(),
            read_only,
            open: Mutex::new(HashMap::new()),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::IllegalState(format!(
                "conflicts database {} is open read-only",
                self.base.display()
            )));
        }
        Ok(())
    }

    /// Database for `tx`; `None` when it does not exist and `create` is off
    fn db(&self, tx: Option<&str>, create: bool) -> Result<Option<sled::Db>> {
        let ns = namespace(tx)?;
        let mut open = self.open.lock()?;
        if let Some(handle) = open.get(&ns) {
            return Ok(Some(handle.db().clone()));
        }
        let path = self.base.join(&ns);
        if !create && !path.exists() {
            return Ok(None);
        }
        let handle = self.manager.acquire(&path, self.read_only)?;
        let db = handle.db().clone();
        open.insert(ns, handle);
        Ok(Some(db))
    }

    fn durable_batch(db: &sled::Db, batch: sled::Batch) -> Result<()> {
        db.apply_batch(batch)?;
        db.flush()?;
        Ok(())
    }
}

impl ConflictsDatabase for SledConflictsDatabase {
    fn page(
        &self,
        tx: Option<&str>,
        prefix: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        let Some(db) = self.db(tx, false)? else {
            return Ok(Vec::new());
        };
        let prefix = prefix.filter(|p| !p.is_empty());
        let start = match (after, prefix) {
            (Some(a), _) => Bound::Excluded(a.as_bytes().to_vec()),
            (None, Some(p)) => Bound::Included(p.as_bytes().to_vec()),
            (None, None) => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for item in db.range::<Vec<u8>, _>((start, Bound::Unbounded)) {
            let (key, value) = item?;
            if let Some(p) = prefix {
                // keys under a prefix are contiguous
                if !key.starts_with(p.as_bytes()) {
                    break;
                }
            }
            let conflict = Conflict::decode(&value)?;
            if !matches(&conflict.path, prefix) {
                continue;
            }
            out.push(conflict);
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    fn get_conflict(&self, tx: Option<&str>, path: &str) -> Result<Option<Conflict>> {
        let Some(db) = self.db(tx, false)? else {
            return Ok(None);
        };
        db.get(path.as_bytes())?
            .map(|raw| Conflict::decode(&raw))
            .transpose()
    }

    fn add_conflicts(&self, tx: Option<&str>, conflicts: &[Conflict]) -> Result<()> {
        self.check_writable()?;
        if conflicts.is_empty() {
            return Ok(());
        }
        let Some(db) = self.db(tx, true)? else {
            return Ok(());
        };
        let mut batch = sled::Batch::default();
        for c in conflicts {
            batch.insert(c.path.as_bytes(), c.encode());
        }
        Self::durable_batch(&db, batch)?;
        debug!(count = conflicts.len(), tx = tx.unwrap_or("default"), "Stored conflicts");
        Ok(())
    }

    fn remove_conflicts(&self, tx: Option<&str>, paths: &[String]) -> Result<()> {
        self.check_writable()?;
        let Some(db) = self.db(tx, false)? else {
            return Ok(());
        };
        let mut batch = sled::Batch::default();
        for path in paths {
            batch.remove(path.as_bytes());
        }
        Self::durable_batch(&db, batch)
    }

    fn remove_by_prefix(&self, tx: Option<&str>, prefix: Option<&str>) -> Result<()> {
        self.check_writable()?;
        let Some(db) = self.db(tx, false)? else {
            return Ok(());
        };
        let mut batch = sled::Batch::default();
        let keys = match prefix.filter(|p| !p.is_empty()) {
            Some(p) => db.scan_prefix(p.as_bytes()),
            None => db.iter(),
        };
        for key in keys.keys() {
            let key = key?;
            let matched = std::str::from_utf8(&key)
                .map(|path| matches(path, prefix))
                .unwrap_or(false);
            if matched {
                batch.remove(key);
            }
        }
        Self::durable_batch(&db, batch)
    }

    fn remove_all(&self, tx: Option<&str>) -> Result<()> {
        self.check_writable()?;
        let ns = namespace(tx)?;
        let path = self.base.join(&ns);
        let handle = {
            let mut open = self.open.lock()?;
            match open.remove(&ns) {
                Some(handle) => handle,
                None if path.exists() => self.manager.acquire(&path, false)?,
                None => return Ok(()),
            }
        };

        let users = self.manager.ref_count(&path, false) + self.manager.ref_count(&path, true);
        if users > 1 {
            // another holder keeps the database open; empty it in place
            handle.db().clear()?;
            handle.db().flush()?;
            debug!(namespace = %ns, users, "Cleared shared conflicts namespace");
            return Ok(());
        }
        if handle.release()? {
            std::fs::remove_dir_all(&path)?;
            info!(namespace = %ns, "Deleted conflicts namespace");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(n: u8) -> ObjectId {
        ObjectId::from_data(&[n])
    }

    fn conflict(path: &str) -> Conflict {
        Conflict::new(path, id(1), id(2), id(3))
    }

    fn paths(db: &dyn ConflictsDatabase, tx: Option<&str>, prefix: Option<&str>) -> Vec<String> {
        db.get_by_prefix(tx, prefix)
            .map(|c| c.unwrap().path().to_string())
            .collect()
    }

    fn check_conflicts_contract(db: &dyn ConflictsDatabase) {
        assert!(!db.has_conflicts(None).unwrap());
        assert!(db.get_conflict(None, "layer/f1").unwrap().is_none());

        db.add_conflicts(
            None,
            &[
                conflict("layer/f2"),
                conflict("layer"),
                conflict("layer/f1"),
                conflict("layer-b/f1"),
                conflict("other/f1"),
            ],
        )
        .unwrap();
        assert!(db.has_conflicts(None).unwrap());
        assert!(!db.has_conflicts(Some("tx1")).unwrap());

        assert_eq!(paths(db, None, Some("layer")), vec!["layer", "layer/f1", "layer/f2"]);
        assert_eq!(paths(db, None, None).len(), 5);
        assert_eq!(db.get_count_by_prefix(None, Some("layer")).unwrap(), 3);

        let found = db
            .find_conflicts(None, &["layer/f1".to_string(), "nope".to_string()])
            .unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["layer/f1"]);

        // upsert replaces
        db.add_conflict(None, Conflict::new("layer/f1", ObjectId::NULL, id(9), id(3)))
            .unwrap();
        let c = db.get_conflict(None, "layer/f1").unwrap().unwrap();
        assert!(c.ancestor().is_null());
        assert_eq!(c.ours(), id(9));

        db.remove_conflict(None, "layer/f2").unwrap();
        db.remove_by_prefix(None, Some("layer")).unwrap();
        assert_eq!(paths(db, None, None), vec!["layer-b/f1", "other/f1"]);

        db.add_conflict(Some("tx1"), conflict("a")).unwrap();
        db.remove_by_prefix(None, None).unwrap();
        assert!(!db.has_conflicts(None).unwrap());
        assert!(db.has_conflicts(Some("tx1")).unwrap());
        db.remove_all(Some("tx1")).unwrap();
        assert!(!db.has_conflicts(Some("tx1")).unwrap());
    }

    #[test]
    fn test_conflict_encoding() {
        for c in [
            conflict("a/b"),
            Conflict::new("x", ObjectId::NULL, id(2), ObjectId::NULL),
            Conflict::new("ü", ObjectId::NULL, ObjectId::NULL, ObjectId::NULL),
        ] {
            assert_eq!(Conflict::decode(&c.encode()).unwrap(), c);
        }
        let encoded = Conflict::new("x", ObjectId::NULL, id(2), ObjectId::NULL).encode();
        assert_eq!(encoded[0], HAS_OURS);
        assert_eq!(encoded.len(), 1 + 2 + 20);
        assert!(Conflict::decode(&[0x80]).is_err());
    }

    #[test]
    fn test_heap_conflicts() {
        check_conflicts_contract(&HeapConflictsDatabase::new());
    }

    #[test]
    fn test_sled_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let db = SledConflictsDatabase::open(&ConnectionManager::new(), temp_dir.path(), false).unwrap();
        check_conflicts_contract(&db);
        assert!(!temp_dir.path().join(".tx1").exists());
    }

    #[test]
    fn test_transaction_id_cannot_escape_base() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("conflicts");
        let db = SledConflictsDatabase::open(&ConnectionManager::new(), &base, false).unwrap();
        for tx in ["../evil", "..", "a/b", "a\\b", ""] {
            assert!(
                matches!(db.add_conflict(Some(tx), conflict("p")), Err(Error::InvalidArgument(_))),
                "{}",
                tx
            );
            assert!(matches!(db.has_conflicts(Some(tx)), Err(Error::InvalidArgument(_))));
            assert!(matches!(db.remove_all(Some(tx)), Err(Error::InvalidArgument(_))));
        }
        assert!(!temp_dir.path().join("evil").exists());
        assert!(!base.join(".a").exists());

        db.add_conflict(Some("tx-1.2"), conflict("p")).unwrap();
        assert!(base.join(".tx-1.2").exists());
        assert!(matches!(
            HeapConflictsDatabase::new().add_conflict(Some("../evil"), conflict("p")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_paging_across_pages() {
        let db = HeapConflictsDatabase::new();
        let conflicts: Vec<_> = (0..2500).map(|i| conflict(&format!("t/{:05}", i))).collect();
        db.add_conflicts(None, &conflicts).unwrap();
        let listed = paths(&db, None, Some("t"));
        assert_eq!(listed.len(), 2500);
        assert!(listed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(db.get_count_by_prefix(None, None).unwrap(), 2500);
    }

    #[test]
    fn test_conflicts_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = SledConflictsDatabase::open(&ConnectionManager::new(), temp_dir.path(), false).unwrap();
            db.add_conflict(None, conflict("layer/f1")).unwrap();
        }
        let db = SledConflictsDatabase::open(&ConnectionManager::new(), temp_dir.path(), false).unwrap();
        assert_eq!(paths(&db, None, None), vec!["layer/f1"]);
        db.remove_all(None).unwrap();
        assert!(!db.has_conflicts(None).unwrap());
        assert!(!temp_dir.path().join(".default").exists());
    }

    #[test]
    fn test_remove_all_with_shared_handle_clears() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new();
        let a = SledConflictsDatabase::open(&manager, temp_dir.path(), false).unwrap();
        let b = SledConflictsDatabase::open(&manager, temp_dir.path(), false).unwrap();
        a.add_conflict(None, conflict("p")).unwrap();
        assert!(b.has_conflicts(None).unwrap());

        a.remove_all(None).unwrap();
        assert!(temp_dir.path().join(".default").exists());
        assert!(!b.has_conflicts(None).unwrap());
    }
}
