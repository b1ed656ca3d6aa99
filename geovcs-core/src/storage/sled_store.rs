//! Persistent object store on sled
//!
//! Keys are the raw 20 id bytes; values are codec-tagged encoded objects.
//! The store records the codec it was created with under a reserved
//! metadata key and keeps writing with it for the rest of its life.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BulkOpListener, ConnectionManager, DbHandle, ObjectStore, encode_batch, prefix_bytes};
use crate::codec::{self, ObjectCodec};
use crate::error::{Error, Result};
use crate::id::{NUM_BYTES, ObjectId};
use crate::object::RevObject;

/// Reserved key holding [`StoreMetadata`]; never a valid id key
const METADATA_KEY: &[u8] = b"__metadata__";

const STORE_FORMAT_VERSION: u32 = 1;

/// Persisted store metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoreMetadata {
    version: u32,
    serializer: ObjectCodec,
}

/// Options for opening a [`SledObjectStore`]
#[derive(Debug, Clone)]
pub struct SledStoreOptions {
    pub read_only: bool,
    /// Flush to disk after every write call
    pub sync_writes: bool,
    /// Objects per atomic batch in `put_all`
    pub batch_size: usize,
    /// Codec recorded when the store is created
    pub codec: ObjectCodec,
}

impl Default for SledStoreOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            sync_writes: true,
            batch_size: super::DEFAULT_PUT_ALL_BATCH_SIZE,
            codec: ObjectCodec::CURRENT,
        }
    }
}

/// Object store persisted in a sled database
pub struct SledObjectStore {
    handle: DbHandle,
    codec: ObjectCodec,
    options: SledStoreOptions,
}

impl SledObjectStore {
    /// Open or create an object store at `path`
    pub fn open(manager: &ConnectionManager, path: &Path, options: SledStoreOptions) -> Result<Self> {
        let handle = manager.acquire(path, options.read_only)?;
        let db = handle.db();

        let codec = match db.get(METADATA_KEY)? {
            Some(raw) => {
                let metadata: StoreMetadata = bincode::deserialize(&raw)?;
                if metadata.version > STORE_FORMAT_VERSION {
                    return Err(Error::IllegalState(format!(
                        "object store format version {} is newer than supported version {}",
                        metadata.version, STORE_FORMAT_VERSION
                    )));
                }
                metadata.serializer
            }
            None => {
                handle.check_writable()?;
                let metadata = StoreMetadata {
                    version: STORE_FORMAT_VERSION,
                    serializer: options.codec,
                };
                db.insert(METADATA_KEY, bincode::serialize(&metadata)?)?;
                db.flush()?;
                info!(path = %path.display(), codec = ?options.codec, "Created object store");
                options.codec
            }
        };

        debug!(path = %path.display(), codec = ?codec, read_only = options.read_only, "Opened object store");
        Ok(Self {
            handle,
            codec,
            options,
        })
    }

    /// Codec new objects are written with
    pub fn codec(&self) -> ObjectCodec {
        self.codec
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.handle
            .db()
            .iter()
            .keys()
            .filter(|k| k.as_ref().map(|k| k.len() == NUM_BYTES).unwrap_or(false))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush outstanding writes to disk
    pub fn flush(&self) -> Result<()> {
        self.handle.db().flush()?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.options.sync_writes {
            self.handle.db().flush()?;
        }
        Ok(())
    }
}

impl ObjectStore for SledObjectStore {
    fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.handle.db().contains_key(id.as_bytes())?)
    }

    fn get_if_present(&self, id: &ObjectId) -> Result<Option<RevObject>> {
        match self.handle.db().get(id.as_bytes())? {
            Some(raw) => Ok(Some(codec::decode_stored(*id, &raw)?)),
            None => Ok(None),
        }
    }

    fn put(&self, object: &RevObject) -> Result<bool> {
        self.handle.check_writable()?;
        let id = object.id();
        if self.exists(&id)? {
            return Ok(false);
        }
        let encoded = self.codec.encode(object)?;
        let inserted = self
            .handle
            .db()
            .compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(encoded))?
            .is_ok();
        if inserted {
            self.sync()?;
        }
        Ok(inserted)
    }

    fn put_all(
        &self,
        objects: &mut dyn Iterator<Item = RevObject>,
        listener: &dyn BulkOpListener,
    ) -> Result<()> {
        self.handle.check_writable()?;
        let db = self.handle.db();
        let start = Instant::now();
        let mut total_inserted = 0usize;
        let mut total_found = 0usize;

        loop {
            let chunk: Vec<RevObject> = (&mut *objects).take(self.options.batch_size.max(1)).collect();
            if chunk.is_empty() {
                break;
            }
            let encoded = encode_batch(self.codec, &chunk)?;

            let mut batch = sled::Batch::default();
            let mut in_batch = std::collections::HashSet::with_capacity(encoded.len());
            let mut inserted = Vec::new();
            for (id, bytes) in encoded {
                if in_batch.contains(&id) || db.contains_key(id.as_bytes())? {
                    listener.found(id);
                    total_found += 1;
                    continue;
                }
                in_batch.insert(id);
                inserted.push((id, bytes.len()));
                batch.insert(&id.as_bytes()[..], bytes);
            }
            db.apply_batch(batch)?;
            self.sync()?;
            total_inserted += inserted.len();
            for (id, size) in inserted {
                listener.inserted(id, size);
            }
        }

        debug!(
            inserted = total_inserted,
            found = total_found,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "put_all finished"
        );
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<bool> {
        self.handle.check_writable()?;
        let existed = self.handle.db().remove(id.as_bytes())?.is_some();
        self.sync()?;
        Ok(existed)
    }

    fn delete_all(
        &self,
        ids: &mut dyn Iterator<Item = ObjectId>,
        listener: &dyn BulkOpListener,
    ) -> Result<usize> {
        self.handle.check_writable()?;
        let db = self.handle.db();
        let mut count = 0;
        for id in ids {
            if db.remove(id.as_bytes())?.is_some() {
                listener.deleted(id);
                count += 1;
            }
        }
        self.sync()?;
        Ok(count)
    }

    fn look_up(&self, prefix: &str) -> Result<Vec<ObjectId>> {
        let key_prefix = prefix_bytes(prefix)?;
        let mut found = Vec::new();
        for key in self.handle.db().scan_prefix(&key_prefix).keys() {
            let key = key?;
            if let Some(id) = ObjectId::from_slice(&key) {
                if id.has_hex_prefix(prefix) {
                    found.push(id);
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{RevFeature, Value};
    use crate::storage::tests::check_store_contract;
    use tempfile::TempDir;

    fn open(manager: &ConnectionManager, dir: &TempDir, options: SledStoreOptions) -> SledObjectStore {
        SledObjectStore::open(manager, &dir.path().join("objects"), options).unwrap()
    }

    #[test]
    fn test_sled_store_contract() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&ConnectionManager::new(), &temp_dir, SledStoreOptions::default());
        check_store_contract(&store);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new();
        let feature = RevFeature::new(vec![Value::from("persisted")]);
        {
            let store = open(&manager, &temp_dir, SledStoreOptions::default());
            assert!(store.put(&feature.clone().into()).unwrap());
        }
        let store = open(&manager, &temp_dir, SledStoreOptions::default());
        assert_eq!(store.get_feature(&feature.id()).unwrap(), feature);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_codec_is_fixed_at_creation() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new();
        let old = RevFeature::new(vec![Value::from("old")]);
        {
            let options = SledStoreOptions {
                codec: ObjectCodec::V1,
                ..Default::default()
            };
            let store = open(&manager, &temp_dir, options);
            assert_eq!(store.codec(), ObjectCodec::V1);
            store.put(&old.clone().into()).unwrap();
        }

        // reopening with another default keeps the recorded codec
        let store = open(&manager, &temp_dir, SledStoreOptions::default());
        assert_eq!(store.codec(), ObjectCodec::V1);
        let raw = store.handle.db().get(old.id().as_bytes()).unwrap().unwrap();
        assert_eq!(raw[0], ObjectCodec::V1.tag());
        assert_eq!(store.get_feature(&old.id()).unwrap(), old);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new();
        let feature = RevFeature::new(vec![Value::Int(1)]);
        {
            let store = open(&manager, &temp_dir, SledStoreOptions::default());
            store.put(&feature.clone().into()).unwrap();
        }
        let options = SledStoreOptions {
            read_only: true,
            ..Default::default()
        };
        let store = open(&manager, &temp_dir, options);
        assert!(store.exists(&feature.id()).unwrap());
        let other = RevFeature::new(vec![Value::Int(2)]);
        assert!(matches!(
            store.put(&other.into()).unwrap_err(),
            Error::IllegalState(_)
        ));
    }

    #[test]
    fn test_put_all_in_small_batches() {
        let temp_dir = TempDir::new().unwrap();
        let options = SledStoreOptions {
            batch_size: 7,
            sync_writes: false,
            ..Default::default()
        };
        let store = open(&ConnectionManager::new(), &temp_dir, options);
        let listener = crate::storage::CountingListener::new();
        let mut objects = (0..100).map(|i| RevObject::from(RevFeature::new(vec![Value::Int(i % 50)])));
        store.put_all(&mut objects, &listener).unwrap();
        assert_eq!(listener.inserted_count(), 50);
        assert_eq!(listener.found_count(), 50);
        assert_eq!(store.len(), 50);
    }
}
