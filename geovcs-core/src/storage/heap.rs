//! In-memory object store

use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;

use super::{BulkOpListener, ObjectStore, encode_batch, prefix_bytes};
use crate::codec::{self, ObjectCodec};
use crate::error::Result;
use crate::id::{NUM_BYTES, ObjectId};
use crate::object::RevObject;

/// Object store backed by a map of encoded values
///
/// Values are kept in their stored (codec-tagged) form so that reads go
/// through the same decoding path as the persistent store.
pub struct HeapObjectStore {
    objects: RwLock<BTreeMap<ObjectId, Bytes>>,
    codec: ObjectCodec,
}

impl HeapObjectStore {
    pub fn new() -> Self {
        Self::with_codec(ObjectCodec::CURRENT)
    }

    pub fn with_codec(codec: ObjectCodec) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            codec,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HeapObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for HeapObjectStore {
    fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.read()?.contains_key(id))
    }

    fn get_if_present(&self, id: &ObjectId) -> Result<Option<RevObject>> {
        let stored = self.objects.read()?.get(id).cloned();
        stored.map(|bytes| codec::decode_stored(*id, &bytes)).transpose()
    }

    fn put(&self, object: &RevObject) -> Result<bool> {
        let id = object.id();
        if self.objects.read()?.contains_key(&id) {
            return Ok(false);
        }
        let encoded = Bytes::from(self.codec.encode(object)?);
        let mut objects = self.objects.write()?;
        if objects.contains_key(&id) {
            return Ok(false);
        }
        objects.insert(id, encoded);
        Ok(true)
    }

    fn put_all(
        &self,
        objects: &mut dyn Iterator<Item = RevObject>,
        listener: &dyn BulkOpListener,
    ) -> Result<()> {
        loop {
            let chunk: Vec<RevObject> = (&mut *objects).take(super::DEFAULT_PUT_ALL_BATCH_SIZE).collect();
            if chunk.is_empty() {
                return Ok(());
            }
            let encoded = encode_batch(self.codec, &chunk)?;
            let mut map = self.objects.write()?;
            for (id, bytes) in encoded {
                if map.contains_key(&id) {
                    listener.found(id);
                } else {
                    let size = bytes.len();
                    map.insert(id, Bytes::from(bytes));
                    listener.inserted(id, size);
                }
            }
        }
    }

    fn delete(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.write()?.remove(id).is_some())
    }

    fn delete_all(
        &self,
        ids: &mut dyn Iterator<Item = ObjectId>,
        listener: &dyn BulkOpListener,
    ) -> Result<usize> {
        let mut objects = self.objects.write()?;
        let mut count = 0;
        for id in ids {
            if objects.remove(&id).is_some() {
                listener.deleted(id);
                count += 1;
            }
        }
        Ok(count)
    }

    fn look_up(&self, prefix: &str) -> Result<Vec<ObjectId>> {
        let start_bytes = prefix_bytes(prefix)?;
        let mut start = [0u8; NUM_BYTES];
        start[..start_bytes.len()].copy_from_slice(&start_bytes);
        let even_hex = hex::encode(&start_bytes);
        let objects = self.objects.read()?;
        Ok(objects
            .range(ObjectId::new(start)..)
            .map(|(id, _)| *id)
            .take_while(|id| id.to_hex().starts_with(&even_hex))
            .filter(|id| id.has_hex_prefix(prefix))
            .collect())
    }
}
