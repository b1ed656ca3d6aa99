//! Object database: an object store with a decoded-object cache that keeps
//! the commit graph in step with stored commits

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::Result;
use crate::graph::GraphDatabase;
use crate::id::ObjectId;
use crate::object::RevObject;
use crate::storage::{BulkOpListener, ObjectStore};

pub struct ObjectDatabase {
    store: Arc<dyn ObjectStore>,
    graph: Arc<dyn GraphDatabase>,
    cache: Option<Mutex<LruCache<ObjectId, RevObject>>>,
}

impl ObjectDatabase {
    /// Wrap `store`; a `cache_size` of zero disables caching
    pub fn new(store: Arc<dyn ObjectStore>, graph: Arc<dyn GraphDatabase>, cache_size: usize) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|n| Mutex::new(LruCache::new(n)));
        Self { store, graph, cache }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn graph(&self) -> &Arc<dyn GraphDatabase> {
        &self.graph
    }

    fn cached(&self, id: &ObjectId) -> Result<Option<RevObject>> {
        match &self.cache {
            Some(cache) => Ok(cache.lock()?.get(id).cloned()),
            None => Ok(None),
        }
    }

    fn remember(&self, object: &RevObject) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.lock()?.put(object.id(), object.clone());
        }
        Ok(())
    }

    fn forget(&self, id: &ObjectId) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.lock()?.pop(id);
        }
        Ok(())
    }
}

impl ObjectStore for ObjectDatabase {
    fn exists(&self, id: &ObjectId) -> Result<bool> {
        if self.cached(id)?.is_some() {
            return Ok(true);
        }
        self.store.exists(id)
    }

    fn get_if_present(&self, id: &ObjectId) -> Result<Option<RevObject>> {
        if let Some(object) = self.cached(id)? {
            return Ok(Some(object));
        }
        let object = self.store.get_if_present(id)?;
        if let Some(object) = &object {
            self.remember(object)?;
        }
        Ok(object)
    }

    fn put(&self, object: &RevObject) -> Result<bool> {
        let inserted = self.store.put(object)?;
        if let RevObject::Commit(commit) = object {
            self.graph.put(&commit.id(), commit.parents())?;
        }
        Ok(inserted)
    }

    fn put_all(
        &self,
        objects: &mut dyn Iterator<Item = RevObject>,
        listener: &dyn BulkOpListener,
    ) -> Result<()> {
        let mut edges = Vec::new();
        let mut tracked = objects.inspect(|object| {
            if let RevObject::Commit(commit) = object {
                edges.push((commit.id(), commit.parents().to_vec()));
            }
        });
        self.store.put_all(&mut tracked, listener)?;
        if !edges.is_empty() {
            self.graph.put_all(&edges)?;
        }
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<bool> {
        self.forget(id)?;
        self.store.delete(id)
    }

    fn delete_all(
        &self,
        ids: &mut dyn Iterator<Item = ObjectId>,
        listener: &dyn BulkOpListener,
    ) -> Result<usize> {
        let ids: Vec<ObjectId> = ids.collect();
        for id in &ids {
            self.forget(id)?;
        }
        self.store.delete_all(&mut ids.into_iter(), listener)
    }

    fn look_up(&self, prefix: &str) -> Result<Vec<ObjectId>> {
        self.store.look_up(prefix)
    }
}
