//! Canonical binary encoding of objects and the versioned storage codecs
//!
//! The canonical encoding is what object ids hash over. It is a big-endian
//! layout starting with the object's type tag; strings and lists are prefixed
//! with an unsigned LEB128 varint, ids are written as their raw 20 bytes.
//!
//! Stores do not keep canonical bytes directly. A stored value is one codec
//! tag byte followed by the codec's payload, so a store can always tell how a
//! value was written. Changing the codec never changes an id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{NUM_BYTES, ObjectId};
use crate::object::{
    AttributeDescriptor, Bucket, Envelope, FieldType, Node, NodeKind, ObjectKind, RevCommit,
    RevFeature, RevFeatureType, RevObject, RevPerson, RevTag, RevTree, Value,
};

/// zstd level used by [`ObjectCodec::V2`]
const ZSTD_LEVEL: i32 = 3;

/// Storage codec recorded in a store's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectCodec {
    /// Canonical bytes as-is
    V1,
    /// zstd-compressed canonical bytes
    V2,
}

impl ObjectCodec {
    /// Codec used for newly created stores
    pub const CURRENT: ObjectCodec = ObjectCodec::V2;

    pub fn tag(self) -> u8 {
        match self {
            ObjectCodec::V1 => 1,
            ObjectCodec::V2 => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ObjectCodec::V1),
            2 => Some(ObjectCodec::V2),
            _ => None,
        }
    }

    /// Encode an object into its stored form
    pub fn encode(self, object: &RevObject) -> Result<Vec<u8>> {
        let canonical = encode(object);
        let mut out = Vec::with_capacity(canonical.len() + 1);
        out.push(self.tag());
        match self {
            ObjectCodec::V1 => out.extend_from_slice(&canonical),
            ObjectCodec::V2 => out.extend(zstd::encode_all(canonical.as_slice(), ZSTD_LEVEL)?),
        }
        Ok(out)
    }
}

/// Decode a stored value, dispatching on its codec tag
pub fn decode_stored(id: ObjectId, stored: &[u8]) -> Result<RevObject> {
    let (&tag, payload) = stored
        .split_first()
        .ok_or_else(|| Error::Corrupt(format!("empty value stored for {}", id)))?;
    match ObjectCodec::from_tag(tag) {
        Some(ObjectCodec::V1) => decode(id, payload),
        Some(ObjectCodec::V2) => {
            let canonical = zstd::decode_all(payload)?;
            decode(id, &canonical)
        }
        None => Err(Error::Corrupt(format!(
            "unknown codec tag {} for object {}",
            tag, id
        ))),
    }
}

// ==================== Canonical encoding ====================

/// Canonical bytes of any object
pub fn encode(object: &RevObject) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    match object {
        RevObject::Tree(t) => write_tree(&mut out, t),
        RevObject::Feature(f) => write_feature(&mut out, f),
        RevObject::FeatureType(ft) => write_feature_type(&mut out, ft),
        RevObject::Commit(c) => write_commit(&mut out, c),
        RevObject::Tag(t) => write_tag(&mut out, t),
    }
    out
}

pub(crate) fn hash_tree(tree: &RevTree) -> ObjectId {
    let mut out = Vec::new();
    write_tree(&mut out, tree);
    ObjectId::from_data(&out)
}

pub(crate) fn hash_feature(feature: &RevFeature) -> ObjectId {
    let mut out = Vec::new();
    write_feature(&mut out, feature);
    ObjectId::from_data(&out)
}

pub(crate) fn hash_feature_type(ft: &RevFeatureType) -> ObjectId {
    let mut out = Vec::new();
    write_feature_type(&mut out, ft);
    ObjectId::from_data(&out)
}

pub(crate) fn hash_commit(commit: &RevCommit) -> ObjectId {
    let mut out = Vec::new();
    write_commit(&mut out, commit);
    ObjectId::from_data(&out)
}

pub(crate) fn hash_tag(tag: &RevTag) -> ObjectId {
    let mut out = Vec::new();
    write_tag(&mut out, tag);
    ObjectId::from_data(&out)
}

fn write_commit(out: &mut Vec<u8>, c: &RevCommit) {
    out.push(ObjectKind::Commit.tag());
    write_id(out, &c.tree_id);
    write_varint(out, c.parents.len() as u64);
    for p in &c.parents {
        write_id(out, p);
    }
    write_person(out, &c.author);
    write_person(out, &c.committer);
    write_str(out, &c.message);
}

fn write_tree(out: &mut Vec<u8>, t: &RevTree) {
    out.push(ObjectKind::Tree.tag());
    write_varint(out, t.size);
    write_varint(out, t.num_trees as u64);
    write_varint(out, t.trees.len() as u64);
    for n in &t.trees {
        write_node(out, n);
    }
    write_varint(out, t.features.len() as u64);
    for n in &t.features {
        write_node(out, n);
    }
    write_varint(out, t.buckets.len() as u64);
    for b in t.buckets.values() {
        write_varint(out, b.index as u64);
        write_id(out, &b.id);
        write_envelope(out, b.bounds.as_ref());
    }
}

fn write_feature(out: &mut Vec<u8>, f: &RevFeature) {
    out.push(ObjectKind::Feature.tag());
    write_varint(out, f.values.len() as u64);
    for v in &f.values {
        write_value(out, v);
    }
}

fn write_feature_type(out: &mut Vec<u8>, ft: &RevFeatureType) {
    out.push(ObjectKind::FeatureType.tag());
    write_str(out, &ft.name);
    write_varint(out, ft.descriptors.len() as u64);
    for d in &ft.descriptors {
        write_str(out, &d.name);
        out.push(d.field_type.tag());
        out.push(d.nullable as u8);
    }
    write_opt_str(out, ft.default_geometry.as_deref());
    write_opt_str(out, ft.crs.as_deref());
}

fn write_tag(out: &mut Vec<u8>, t: &RevTag) {
    out.push(ObjectKind::Tag.tag());
    write_str(out, &t.name);
    write_id(out, &t.commit_id);
    write_str(out, &t.message);
    write_person(out, &t.tagger);
}

fn write_node(out: &mut Vec<u8>, n: &Node) {
    write_str(out, &n.name);
    out.push(match n.kind {
        NodeKind::Tree => 0,
        NodeKind::Feature => 1,
    });
    write_id(out, &n.object_id);
    match &n.metadata_id {
        Some(id) => {
            out.push(1);
            write_id(out, id);
        }
        None => out.push(0),
    }
    write_envelope(out, n.bounds.as_ref());
}

fn write_person(out: &mut Vec<u8>, p: &RevPerson) {
    write_opt_str(out, p.name.as_deref());
    write_opt_str(out, p.email.as_deref());
    out.extend_from_slice(&p.timestamp.to_be_bytes());
    out.extend_from_slice(&p.tz_offset.to_be_bytes());
}

fn write_value(out: &mut Vec<u8>, v: &Value) {
    out.push(v.field_type().tag());
    match v {
        Value::Null => {}
        Value::Bool(b) => out.push(*b as u8),
        Value::Byte(b) => out.extend_from_slice(&b.to_be_bytes()),
        Value::Short(s) => out.extend_from_slice(&s.to_be_bytes()),
        Value::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
        Value::Long(l) => out.extend_from_slice(&l.to_be_bytes()),
        Value::Float(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
        Value::Double(d) => out.extend_from_slice(&d.to_bits().to_be_bytes()),
        Value::String(s) => write_str(out, s),
        Value::Geometry(b) | Value::Bytes(b) => {
            write_varint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::DateTime(ms) => out.extend_from_slice(&ms.to_be_bytes()),
    }
}

fn write_envelope(out: &mut Vec<u8>, e: Option<&Envelope>) {
    match e {
        Some(e) => {
            out.push(1);
            for c in [e.min_x, e.min_y, e.max_x, e.max_y] {
                out.extend_from_slice(&c.to_bits().to_be_bytes());
            }
        }
        None => out.push(0),
    }
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub(crate) fn write_str(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn write_opt_str(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            out.push(1);
            write_str(out, s);
        }
        None => out.push(0),
    }
}

fn write_id(out: &mut Vec<u8>, id: &ObjectId) {
    out.extend_from_slice(id.as_bytes());
}

// ==================== Decoding ====================

/// Decode canonical bytes into an object with the given id
pub fn decode(id: ObjectId, data: &[u8]) -> Result<RevObject> {
    let mut r = Reader::new(data);
    let tag = r.u8()?;
    let kind = ObjectKind::from_tag(tag)
        .ok_or_else(|| Error::Corrupt(format!("unknown object type tag {} for {}", tag, id)))?;
    let object = match kind {
        ObjectKind::Commit => RevObject::Commit(read_commit(&mut r, id)?),
        ObjectKind::Tree => RevObject::Tree(read_tree(&mut r, id)?),
        ObjectKind::Feature => RevObject::Feature(read_feature(&mut r, id)?),
        ObjectKind::FeatureType => RevObject::FeatureType(read_feature_type(&mut r, id)?),
        ObjectKind::Tag => RevObject::Tag(read_tag(&mut r, id)?),
    };
    if !r.is_at_end() {
        return Err(Error::Corrupt(format!("trailing bytes after {} {}", kind, id)));
    }
    Ok(object)
}

fn read_commit(r: &mut Reader<'_>, id: ObjectId) -> Result<RevCommit> {
    let tree_id = r.id()?;
    let count = r.len()?;
    let mut parents = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        parents.push(r.id()?);
    }
    let author = read_person(r)?;
    let committer = read_person(r)?;
    let message = r.string()?;
    Ok(RevCommit {
        id,
        tree_id,
        parents,
        author,
        committer,
        message,
    })
}

fn read_tree(r: &mut Reader<'_>, id: ObjectId) -> Result<RevTree> {
    let size = r.varint()?;
    let num_trees = r.varint()? as u32;
    let mut trees = Vec::new();
    for _ in 0..r.len()? {
        trees.push(read_node(r)?);
    }
    let mut features = Vec::new();
    for _ in 0..r.len()? {
        features.push(read_node(r)?);
    }
    let mut buckets = BTreeMap::new();
    for _ in 0..r.len()? {
        let index = r.varint()? as u32;
        let bucket_id = r.id()?;
        let bounds = read_envelope(r)?;
        buckets.insert(index, Bucket::new(index, bucket_id, bounds));
    }
    Ok(RevTree {
        id,
        size,
        num_trees,
        trees,
        features,
        buckets,
    })
}

fn read_feature(r: &mut Reader<'_>, id: ObjectId) -> Result<RevFeature> {
    let count = r.len()?;
    let mut values = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        values.push(read_value(r)?);
    }
    Ok(RevFeature { id, values })
}

fn read_feature_type(r: &mut Reader<'_>, id: ObjectId) -> Result<RevFeatureType> {
    let name = r.string()?;
    let count = r.len()?;
    let mut descriptors = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let name = r.string()?;
        let tag = r.u8()?;
        let field_type = FieldType::from_tag(tag)
            .ok_or_else(|| Error::Corrupt(format!("unknown field type tag {}", tag)))?;
        let nullable = r.u8()? != 0;
        descriptors.push(AttributeDescriptor {
            name,
            field_type,
            nullable,
        });
    }
    let default_geometry = r.opt_string()?;
    let crs = r.opt_string()?;
    Ok(RevFeatureType {
        id,
        name,
        descriptors,
        default_geometry,
        crs,
    })
}

fn read_tag(r: &mut Reader<'_>, id: ObjectId) -> Result<RevTag> {
    let name = r.string()?;
    let commit_id = r.id()?;
    let message = r.string()?;
    let tagger = read_person(r)?;
    Ok(RevTag {
        id,
        name,
        commit_id,
        message,
        tagger,
    })
}

fn read_node(r: &mut Reader<'_>) -> Result<Node> {
    let name = r.string()?;
    let kind = match r.u8()? {
        0 => NodeKind::Tree,
        1 => NodeKind::Feature,
        other => return Err(Error::Corrupt(format!("unknown node kind {}", other))),
    };
    let object_id = r.id()?;
    let metadata_id = match r.u8()? {
        0 => None,
        _ => Some(r.id()?),
    };
    let bounds = read_envelope(r)?;
    Ok(Node {
        name,
        object_id,
        metadata_id,
        kind,
        bounds,
    })
}

fn read_person(r: &mut Reader<'_>) -> Result<RevPerson> {
    let name = r.opt_string()?;
    let email = r.opt_string()?;
    let timestamp = i64::from_be_bytes(r.array()?);
    let tz_offset = i32::from_be_bytes(r.array()?);
    Ok(RevPerson {
        name,
        email,
        timestamp,
        tz_offset,
    })
}

fn read_value(r: &mut Reader<'_>) -> Result<Value> {
    let tag = r.u8()?;
    let field_type =
        FieldType::from_tag(tag).ok_or_else(|| Error::Corrupt(format!("unknown value tag {}", tag)))?;
    Ok(match field_type {
        FieldType::Null => Value::Null,
        FieldType::Bool => Value::Bool(r.u8()? != 0),
        FieldType::Byte => Value::Byte(i8::from_be_bytes(r.array()?)),
        FieldType::Short => Value::Short(i16::from_be_bytes(r.array()?)),
        FieldType::Int => Value::Int(i32::from_be_bytes(r.array()?)),
        FieldType::Long => Value::Long(i64::from_be_bytes(r.array()?)),
        FieldType::Float => Value::Float(f32::from_bits(u32::from_be_bytes(r.array()?))),
        FieldType::Double => Value::Double(f64::from_bits(u64::from_be_bytes(r.array()?))),
        FieldType::String => Value::String(r.string()?),
        FieldType::Geometry => Value::Geometry(r.bytes()?.to_vec()),
        FieldType::Bytes => Value::Bytes(r.bytes()?.to_vec()),
        FieldType::DateTime => Value::DateTime(i64::from_be_bytes(r.array()?)),
    })
}

fn read_envelope(r: &mut Reader<'_>) -> Result<Option<Envelope>> {
    if r.u8()? == 0 {
        return Ok(None);
    }
    let mut c = [0f64; 4];
    for v in c.iter_mut() {
        *v = f64::from_bits(u64::from_be_bytes(r.array()?));
    }
    Ok(Some(Envelope {
        min_x: c[0],
        min_y: c[1],
        max_x: c[2],
        max_y: c[3],
    }))
}

/// Cursor over a byte slice; every read fails with [`Error::Corrupt`] on
/// truncated input
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Corrupt("unexpected end of data".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub(crate) fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.u8()?;
            if shift >= 64 {
                return Err(Error::Corrupt("varint overflow".to_string()));
            }
            value |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// A varint length, bounded by the remaining input
    pub(crate) fn len(&mut self) -> Result<usize> {
        let n = self.varint()?;
        if n > (self.buf.len() - self.pos) as u64 {
            return Err(Error::Corrupt(format!("length {} exceeds remaining data", n)));
        }
        Ok(n as usize)
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.len()?;
        self.take(n)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Corrupt(e.to_string()))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.string()?)),
        }
    }

    pub(crate) fn id(&mut self) -> Result<ObjectId> {
        Ok(ObjectId::new(self.array::<NUM_BYTES>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NodeKind;

    fn sample_objects() -> Vec<RevObject> {
        let ft = RevFeatureType::new(
            "points",
            vec![
                AttributeDescriptor::new("label", FieldType::String),
                AttributeDescriptor::new("geom", FieldType::Geometry),
            ],
            Some("EPSG:4326".into()),
        );
        let feature = RevFeature::new(vec![
            Value::Null,
            Value::Bool(true),
            Value::Byte(-3),
            Value::Short(300),
            Value::Int(-70000),
            Value::Long(1 << 40),
            Value::Float(1.5),
            Value::Double(-2.25),
            Value::from("héllo"),
            Value::Geometry(vec![1, 1, 0, 0, 0]),
            Value::Bytes(vec![9, 8, 7]),
            Value::DateTime(1_600_000_000_000),
        ]);
        let node = Node::feature(
            "f1",
            feature.id(),
            Some(ft.id()),
            Some(Envelope::new(1.0, 2.0, 3.0, 4.0)),
        );
        let tree = RevTree::leaf(vec![Node::tree("sub", RevTree::empty_id(), None)], vec![node]);
        let mut buckets = BTreeMap::new();
        buckets.insert(3, Bucket::new(3, tree.id(), None));
        buckets.insert(17, Bucket::new(17, tree.id(), Some(Envelope::point(0.0, 0.0))));
        let bucketed = RevTree::bucketed(1000, 2, buckets);
        let person = RevPerson::new(Some("Bob".into()), None, 42, -3_600_000);
        let commit = RevCommit::new(tree.id(), vec![bucketed.id()], person.clone(), person.clone(), "msg");
        let tag = RevTag::new("v1", commit.id(), "release", person);
        vec![
            ft.into(),
            feature.into(),
            tree.into(),
            bucketed.into(),
            commit.into(),
            tag.into(),
        ]
    }

    #[test]
    fn test_canonical_roundtrip_preserves_bytes_and_id() {
        for object in sample_objects() {
            let bytes = encode(&object);
            assert_eq!(ObjectId::from_data(&bytes), object.id());
            let decoded = decode(object.id(), &bytes).unwrap();
            assert_eq!(decoded, object);
            assert_eq!(encode(&decoded), bytes);
        }
    }

    #[test]
    fn test_codecs_decode_to_same_object() {
        for object in sample_objects() {
            for codec in [ObjectCodec::V1, ObjectCodec::V2] {
                let stored = codec.encode(&object).unwrap();
                assert_eq!(stored[0], codec.tag());
                let decoded = decode_stored(object.id(), &stored).unwrap();
                assert_eq!(decoded.id(), object.id());
                assert_eq!(decoded, object);
            }
        }
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        let object = &sample_objects()[1];
        let bytes = encode(object);
        let err = decode(object.id(), &bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_unknown_codec_tag_is_corrupt() {
        let err = decode_stored(ObjectId::NULL, &[99, 1, 2]).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
        assert!(decode_stored(ObjectId::NULL, &[]).is_err());
    }

    #[test]
    fn test_varint() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            write_varint(&mut out, v);
            let mut r = Reader::new(&out);
            assert_eq!(r.varint().unwrap(), v);
            assert!(r.is_at_end());
        }
    }

    #[test]
    fn test_tree_node_kinds_survive() {
        let tree = match &sample_objects()[2] {
            RevObject::Tree(t) => t.clone(),
            _ => unreachable!(),
        };
        let decoded = decode(tree.id(), &encode(&RevObject::Tree(tree.clone()))).unwrap();
        match decoded {
            RevObject::Tree(t) => {
                assert_eq!(t.trees()[0].kind(), NodeKind::Tree);
                assert_eq!(t.features()[0].kind(), NodeKind::Feature);
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    fn value_strategy() -> impl proptest::strategy::Strategy<Value = Value> {
        use proptest::prelude::*;
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i8>().prop_map(Value::Byte),
            any::<i16>().prop_map(Value::Short),
            any::<i32>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::Long),
            (-1.0e6f64..1.0e6).prop_map(Value::Double),
            "[a-z ]{0,12}".prop_map(Value::String),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Geometry),
            any::<i64>().prop_map(Value::DateTime),
        ]
    }

    proptest::proptest! {
        #[test]
        fn test_feature_id_is_stable_across_codecs(
            values in proptest::collection::vec(value_strategy(), 0..10)
        ) {
            let object = RevObject::from(RevFeature::new(values));
            let bytes = encode(&object);
            proptest::prop_assert_eq!(ObjectId::from_data(&bytes), object.id());
            for codec in [ObjectCodec::V1, ObjectCodec::V2] {
                let decoded = decode_stored(object.id(), &codec.encode(&object).unwrap()).unwrap();
                proptest::prop_assert_eq!(encode(&decoded), bytes.clone());
            }
        }
    }
}
