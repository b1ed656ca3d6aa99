//! Reference-counted sled database handles
//!
//! Several logical stores may be opened against the same directory. The
//! manager hands out one shared `sled::Db` per `(path, read_only)` key and
//! closes it when the last [`DbHandle`] is released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKey {
    path: PathBuf,
    read_only: bool,
}

struct Connection {
    db: sled::Db,
    refs: usize,
}

type Connections = Arc<Mutex<HashMap<ConnectionKey, Connection>>>;

/// Arena of open databases
///
/// Cloning a manager shares the arena. Repositories opened with the same
/// manager share database handles.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Connections,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a handle on the database at `path`
    ///
    /// Read-only handles require the database to exist already. Writable
    /// handles create it.
    pub fn acquire(&self, path: &Path, read_only: bool) -> Result<DbHandle> {
        let key = ConnectionKey {
            path: path.to_path_buf(),
            read_only,
        };
        let mut connections = self.connections.lock()?;

        if let Some(conn) = connections.get_mut(&key) {
            conn.refs += 1;
            debug!(path = %path.display(), read_only, refs = conn.refs, "Reusing database handle");
            return Ok(DbHandle {
                db: conn.db.clone(),
                key,
                connections: self.connections.clone(),
                released: false,
            });
        }

        // sled holds an exclusive lock per directory, so the other mode's
        // connection is shared when one is open.
        let shared = connections
            .iter()
            .find(|(k, _)| k.path == key.path)
            .map(|(_, c)| c.db.clone());

        let db = match shared {
            Some(db) => db,
            None => {
                if read_only && !path.exists() {
                    return Err(Error::IllegalState(format!(
                        "database {} does not exist",
                        path.display()
                    )));
                }
                std::fs::create_dir_all(path)?;
                sled::open(path)?
            }
        };

        debug!(path = %path.display(), read_only, "Opened database");
        connections.insert(
            key.clone(),
            Connection {
                db: db.clone(),
                refs: 1,
            },
        );
        Ok(DbHandle {
            db,
            key,
            connections: self.connections.clone(),
            released: false,
        })
    }

    /// Number of live handles for `(path, read_only)`
    pub fn ref_count(&self, path: &Path, read_only: bool) -> usize {
        let key = ConnectionKey {
            path: path.to_path_buf(),
            read_only,
        };
        self.connections
            .lock()
            .map(|c| c.get(&key).map(|conn| conn.refs).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of distinct open connections
    pub fn open_connections(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Scoped handle on a shared database; released on drop
pub struct DbHandle {
    db: sled::Db,
    key: ConnectionKey,
    connections: Connections,
    released: bool,
}

impl DbHandle {
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn path(&self) -> &Path {
        &self.key.path
    }

    pub fn is_read_only(&self) -> bool {
        self.key.read_only
    }

    /// Fail unless the handle was opened for writing
    pub fn check_writable(&self) -> Result<()> {
        if self.key.read_only {
            return Err(Error::IllegalState(format!(
                "database {} is open read-only",
                self.key.path.display()
            )));
        }
        Ok(())
    }

    /// Release the handle, returning whether it was the last one on its
    /// database
    pub fn release(mut self) -> Result<bool> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<bool> {
        if self.released {
            return Ok(false);
        }
        self.released = true;
        let mut connections = self.connections.lock()?;
        let remaining = match connections.get_mut(&self.key) {
            Some(conn) => {
                conn.refs = conn.refs.saturating_sub(1);
                conn.refs
            }
            None => return Ok(false),
        };
        if remaining > 0 {
            return Ok(false);
        }
        connections.remove(&self.key);
        let path_in_use = connections.keys().any(|k| k.path == self.key.path);
        if !self.key.read_only {
            self.db.flush()?;
        }
        debug!(path = %self.key.path.display(), "Closed database");
        Ok(!path_in_use)
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!("Failed to release database handle: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_handles_are_shared_and_refcounted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db");
        let manager = ConnectionManager::new();

        let h1 = manager.acquire(&path, false).unwrap();
        let h2 = manager.acquire(&path, false).unwrap();
        assert_eq!(manager.ref_count(&path, false), 2);

        h1.db().insert(b"k", b"v".to_vec()).unwrap();
        assert_eq!(h2.db().get(b"k").unwrap().unwrap().as_ref(), b"v");

        assert!(!h1.release().unwrap());
        assert_eq!(manager.ref_count(&path, false), 1);
        assert!(h2.release().unwrap());
        assert_eq!(manager.open_connections(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db");
        let manager = ConnectionManager::new();
        {
            let _h = manager.acquire(&path, false).unwrap();
            assert_eq!(manager.ref_count(&path, false), 1);
        }
        assert_eq!(manager.ref_count(&path, false), 0);

        // reopening after the last release sees the same data directory
        let h = manager.acquire(&path, false).unwrap();
        assert!(h.db().was_recovered());
    }

    #[test]
    fn test_read_only_requires_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new();
        let missing = temp_dir.path().join("missing");
        assert!(manager.acquire(&missing, true).is_err());

        let path = temp_dir.path().join("db");
        let rw = manager.acquire(&path, false).unwrap();
        let ro = manager.acquire(&path, true).unwrap();
        assert!(ro.check_writable().is_err());
        assert!(rw.check_writable().is_ok());
        assert_eq!(manager.open_connections(), 2);
        drop(rw);
        assert!(ro.release().unwrap());
    }
}
