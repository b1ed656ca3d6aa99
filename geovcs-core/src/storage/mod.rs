//! Storage abstraction layer
//!
//! - [`ObjectStore`]: content-addressed store of immutable objects
//! - [`HeapObjectStore`]: in-memory store for transient repositories
//! - [`SledObjectStore`]: persistent store on a sled database
//! - [`ConnectionManager`]: shared, reference-counted database handles

mod connection;
mod heap;
mod sled_store;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

pub use connection::{ConnectionManager, DbHandle};
pub use heap::HeapObjectStore;
pub use sled_store::{SledObjectStore, SledStoreOptions};

use crate::codec::ObjectCodec;
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::object::{
    ObjectKind, RevCommit, RevFeature, RevFeatureType, RevObject, RevTag, RevTree,
};

/// Number of ids resolved per round trip by [`ObjectStore::get_all`]
pub const GET_ALL_PARTITION_SIZE: usize = 500;

/// Default number of objects written per atomic batch by `put_all`
pub const DEFAULT_PUT_ALL_BATCH_SIZE: usize = 10_000;

/// Per-object callbacks of the bulk operations
pub trait BulkOpListener: Send + Sync {
    /// A new object was written
    fn inserted(&self, _id: ObjectId, _stored_size: usize) {}

    /// The object was already present
    fn found(&self, _id: ObjectId) {}

    /// The object is absent, or not of the requested kind
    fn not_found(&self, _id: ObjectId) {}

    fn deleted(&self, _id: ObjectId) {}
}

/// Listener that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl BulkOpListener for NoopListener {}

/// Listener that counts callbacks
#[derive(Debug, Default)]
pub struct CountingListener {
    inserted: AtomicUsize,
    found: AtomicUsize,
    not_found: AtomicUsize,
    deleted: AtomicUsize,
}

impl CountingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inserted_count(&self) -> usize {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn found_count(&self) -> usize {
        self.found.load(Ordering::Relaxed)
    }

    pub fn not_found_count(&self) -> usize {
        self.not_found.load(Ordering::Relaxed)
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Relaxed)
    }
}

impl BulkOpListener for CountingListener {
    fn inserted(&self, _id: ObjectId, _stored_size: usize) {
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    fn found(&self, _id: ObjectId) {
        self.found.fetch_add(1, Ordering::Relaxed);
    }

    fn not_found(&self, _id: ObjectId) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    fn deleted(&self, _id: ObjectId) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Generic object store interface
///
/// Inserts are idempotent: putting an object whose id is already stored is
/// a no-op reporting `false`.
pub trait ObjectStore: Send + Sync {
    /// Check if object exists
    fn exists(&self, id: &ObjectId) -> Result<bool>;

    /// Get an object, `None` if absent
    fn get_if_present(&self, id: &ObjectId) -> Result<Option<RevObject>>;

    /// Store an object, returning whether it was newly inserted
    fn put(&self, object: &RevObject) -> Result<bool>;

    /// Store a stream of objects in atomic batches
    fn put_all(
        &self,
        objects: &mut dyn Iterator<Item = RevObject>,
        listener: &dyn BulkOpListener,
    ) -> Result<()>;

    /// Delete an object, returning whether it existed
    fn delete(&self, id: &ObjectId) -> Result<bool>;

    /// Delete many objects, returning how many existed
    fn delete_all(
        &self,
        ids: &mut dyn Iterator<Item = ObjectId>,
        listener: &dyn BulkOpListener,
    ) -> Result<usize>;

    /// All stored ids whose hex form starts with `prefix`
    fn look_up(&self, prefix: &str) -> Result<Vec<ObjectId>>;

    /// Resolve one partition of ids; absent ids map to `None`
    fn get_many(&self, ids: &[ObjectId]) -> Result<Vec<(ObjectId, Option<RevObject>)>> {
        ids.iter()
            .map(|id| Ok((*id, self.get_if_present(id)?)))
            .collect()
    }

    /// Get an object, failing with [`Error::ObjectNotFound`] if absent
    fn get(&self, id: &ObjectId) -> Result<RevObject> {
        self.get_if_present(id)?
            .ok_or(Error::ObjectNotFound(*id))
    }

    /// Lazily resolve a stream of ids in partitions of
    /// [`GET_ALL_PARTITION_SIZE`]
    ///
    /// Objects of another kind than `kind` are reported to the listener as
    /// not found and skipped. The iterator is a single forward pass.
    fn get_all<'a>(
        &'a self,
        ids: Box<dyn Iterator<Item = ObjectId> + 'a>,
        listener: &'a dyn BulkOpListener,
        kind: Option<ObjectKind>,
    ) -> Box<dyn Iterator<Item = Result<RevObject>> + 'a> {
        let mut ids = ids;
        let mut buffer: VecDeque<Result<RevObject>> = VecDeque::new();
        Box::new(std::iter::from_fn(move || {
            loop {
                if let Some(next) = buffer.pop_front() {
                    return Some(next);
                }
                let partition: Vec<ObjectId> =
                    ids.by_ref().take(GET_ALL_PARTITION_SIZE).collect();
                if partition.is_empty() {
                    return None;
                }
                match self.get_many(&partition) {
                    Ok(resolved) => {
                        for (id, object) in resolved {
                            match object {
                                Some(o) if kind.is_none_or(|k| k == o.kind()) => {
                                    listener.found(id);
                                    buffer.push_back(Ok(o));
                                }
                                _ => listener.not_found(id),
                            }
                        }
                    }
                    Err(e) => buffer.push_back(Err(e)),
                }
            }
        }))
    }

    fn get_tree(&self, id: &ObjectId) -> Result<RevTree> {
        if *id == RevTree::empty_id() {
            return Ok(RevTree::empty());
        }
        match self.get(id)? {
            RevObject::Tree(t) => Ok(t),
            other => Err(unexpected(id, ObjectKind::Tree, &other)),
        }
    }

    fn get_feature(&self, id: &ObjectId) -> Result<RevFeature> {
        match self.get(id)? {
            RevObject::Feature(f) => Ok(f),
            other => Err(unexpected(id, ObjectKind::Feature, &other)),
        }
    }

    fn get_feature_type(&self, id: &ObjectId) -> Result<RevFeatureType> {
        match self.get(id)? {
            RevObject::FeatureType(ft) => Ok(ft),
            other => Err(unexpected(id, ObjectKind::FeatureType, &other)),
        }
    }

    fn get_commit(&self, id: &ObjectId) -> Result<RevCommit> {
        match self.get(id)? {
            RevObject::Commit(c) => Ok(c),
            other => Err(unexpected(id, ObjectKind::Commit, &other)),
        }
    }

    fn get_tag(&self, id: &ObjectId) -> Result<RevTag> {
        match self.get(id)? {
            RevObject::Tag(t) => Ok(t),
            other => Err(unexpected(id, ObjectKind::Tag, &other)),
        }
    }
}

fn unexpected(id: &ObjectId, expected: ObjectKind, actual: &RevObject) -> Error {
    Error::UnexpectedType {
        id: *id,
        expected,
        actual: actual.kind(),
    }
}

/// Encode a batch of objects on the rayon pool
pub(crate) fn encode_batch(
    codec: ObjectCodec,
    objects: &[RevObject],
) -> Result<Vec<(ObjectId, Vec<u8>)>> {
    objects
        .par_iter()
        .map(|o| Ok((o.id(), codec.encode(o)?)))
        .collect()
}

/// Validate an abbreviated id and return the key bytes its even-length part
/// decodes to
pub(crate) fn prefix_bytes(prefix: &str) -> Result<Vec<u8>> {
    if prefix.is_empty()
        || prefix.len() > crate::id::NUM_BYTES * 2
        || !prefix.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(Error::InvalidArgument(format!(
            "'{}' is not a valid object id prefix",
            prefix
        )));
    }
    let even = &prefix[..prefix.len() & !1];
    hex::decode(even).map_err(|e| Error::InvalidArgument(e.to_string()))
}
