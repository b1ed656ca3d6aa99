//! Core object model
//!
//! Five immutable, content-addressed object kinds: trees, features, feature
//! types, commits and tags. Every constructor computes the object's id from
//! its canonical encoding (see [`crate::codec`]), so two objects with the same
//! content always share an id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::id::ObjectId;

/// Object kind, with the type tag used by the canonical encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Commit,
    Tree,
    Feature,
    Tag,
    FeatureType,
}

impl ObjectKind {
    pub fn tag(self) -> u8 {
        match self {
            ObjectKind::Commit => 0,
            ObjectKind::Tree => 1,
            ObjectKind::Feature => 2,
            ObjectKind::Tag => 3,
            ObjectKind::FeatureType => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ObjectKind::Commit),
            1 => Some(ObjectKind::Tree),
            2 => Some(ObjectKind::Feature),
            3 => Some(ObjectKind::Tag),
            4 => Some(ObjectKind::FeatureType),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Feature => "feature",
            ObjectKind::Tag => "tag",
            ObjectKind::FeatureType => "featuretype",
        };
        f.write_str(name)
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// Degenerate envelope of a single point
    pub fn point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }

    pub fn expand_to_include(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Union of two optional envelopes
    pub fn union(a: Option<Envelope>, b: Option<Envelope>) -> Option<Envelope> {
        match (a, b) {
            (Some(mut a), Some(b)) => {
                a.expand_to_include(&b);
                Some(a)
            }
            (a, None) => a,
            (None, b) => b,
        }
    }
}

// ==================== Features ====================

/// Attribute type, with the tag used by the canonical encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Null,
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Geometry,
    Bytes,
    DateTime,
}

impl FieldType {
    pub fn tag(self) -> u8 {
        match self {
            FieldType::Null => 0,
            FieldType::Bool => 1,
            FieldType::Byte => 2,
            FieldType::Short => 3,
            FieldType::Int => 4,
            FieldType::Long => 5,
            FieldType::Float => 6,
            FieldType::Double => 7,
            FieldType::String => 8,
            FieldType::Geometry => 9,
            FieldType::Bytes => 10,
            FieldType::DateTime => 11,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => FieldType::Null,
            1 => FieldType::Bool,
            2 => FieldType::Byte,
            3 => FieldType::Short,
            4 => FieldType::Int,
            5 => FieldType::Long,
            6 => FieldType::Float,
            7 => FieldType::Double,
            8 => FieldType::String,
            9 => FieldType::Geometry,
            10 => FieldType::Bytes,
            11 => FieldType::DateTime,
            _ => return None,
        })
    }
}

/// A single attribute value
///
/// Geometries are carried as opaque well-known-binary payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Geometry(Vec<u8>),
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch
    DateTime(i64),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Bool,
            Value::Byte(_) => FieldType::Byte,
            Value::Short(_) => FieldType::Short,
            Value::Int(_) => FieldType::Int,
            Value::Long(_) => FieldType::Long,
            Value::Float(_) => FieldType::Float,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
            Value::Geometry(_) => FieldType::Geometry,
            Value::Bytes(_) => FieldType::Bytes,
            Value::DateTime(_) => FieldType::DateTime,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

/// Versioned payload of one feature: an ordered list of attribute values
#[derive(Debug, Clone, PartialEq)]
pub struct RevFeature {
    pub(crate) id: ObjectId,
    pub(crate) values: Vec<Value>,
}

impl RevFeature {
    pub fn new(values: Vec<Value>) -> Self {
        let mut feature = Self {
            id: ObjectId::NULL,
            values,
        };
        feature.id = codec::hash_feature(&feature);
        feature
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

/// Named, typed attribute of a feature type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }
}

/// Schema of a set of features
#[derive(Debug, Clone, PartialEq)]
pub struct RevFeatureType {
    pub(crate) id: ObjectId,
    pub(crate) name: String,
    pub(crate) descriptors: Vec<AttributeDescriptor>,
    pub(crate) default_geometry: Option<String>,
    pub(crate) crs: Option<String>,
}

impl RevFeatureType {
    /// Create a feature type
    ///
    /// The default geometry is the first attribute of type
    /// [`FieldType::Geometry`], if any.
    pub fn new(
        name: impl Into<String>,
        descriptors: Vec<AttributeDescriptor>,
        crs: Option<String>,
    ) -> Self {
        let default_geometry = descriptors
            .iter()
            .find(|d| d.field_type == FieldType::Geometry)
            .map(|d| d.name.clone());
        Self::from_parts(name.into(), descriptors, default_geometry, crs)
    }

    pub(crate) fn from_parts(
        name: String,
        descriptors: Vec<AttributeDescriptor>,
        default_geometry: Option<String>,
        crs: Option<String>,
    ) -> Self {
        let mut ft = Self {
            id: ObjectId::NULL,
            name,
            descriptors,
            default_geometry,
            crs,
        };
        ft.id = codec::hash_feature_type(&ft);
        ft
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptors(&self) -> &[AttributeDescriptor] {
        &self.descriptors
    }

    pub fn default_geometry(&self) -> Option<&str> {
        self.default_geometry.as_deref()
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }
}

// ==================== Commits and tags ====================

/// Author, committer or tagger identity plus a timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevPerson {
    pub name: Option<String>,
    pub email: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Timezone offset in milliseconds
    pub tz_offset: i32,
}

impl RevPerson {
    pub fn new(name: Option<String>, email: Option<String>, timestamp: i64, tz_offset: i32) -> Self {
        Self {
            name,
            email,
            timestamp,
            tz_offset,
        }
    }
}

/// A snapshot of the root tree plus its history links
#[derive(Debug, Clone, PartialEq)]
pub struct RevCommit {
    pub(crate) id: ObjectId,
    pub(crate) tree_id: ObjectId,
    pub(crate) parents: Vec<ObjectId>,
    pub(crate) author: RevPerson,
    pub(crate) committer: RevPerson,
    pub(crate) message: String,
}

impl RevCommit {
    pub fn new(
        tree_id: ObjectId,
        parents: Vec<ObjectId>,
        author: RevPerson,
        committer: RevPerson,
        message: impl Into<String>,
    ) -> Self {
        let mut commit = Self {
            id: ObjectId::NULL,
            tree_id,
            parents,
            author,
            committer,
            message: message.into(),
        };
        commit.id = codec::hash_commit(&commit);
        commit
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn tree_id(&self) -> ObjectId {
        self.tree_id
    }

    pub fn parents(&self) -> &[ObjectId] {
        &self.parents
    }

    /// The `n`th parent (0 based)
    pub fn parent_n(&self, n: usize) -> Option<ObjectId> {
        self.parents.get(n).copied()
    }

    pub fn first_parent(&self) -> Option<ObjectId> {
        self.parent_n(0)
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn author(&self) -> &RevPerson {
        &self.author
    }

    pub fn committer(&self) -> &RevPerson {
        &self.committer
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Annotated tag pointing at a commit
#[derive(Debug, Clone, PartialEq)]
pub struct RevTag {
    pub(crate) id: ObjectId,
    pub(crate) name: String,
    pub(crate) commit_id: ObjectId,
    pub(crate) message: String,
    pub(crate) tagger: RevPerson,
}

impl RevTag {
    pub fn new(
        name: impl Into<String>,
        commit_id: ObjectId,
        message: impl Into<String>,
        tagger: RevPerson,
    ) -> Self {
        let mut tag = Self {
            id: ObjectId::NULL,
            name: name.into(),
            commit_id,
            message: message.into(),
            tagger,
        };
        tag.id = codec::hash_tag(&tag);
        tag
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commit_id(&self) -> ObjectId {
        self.commit_id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn tagger(&self) -> &RevPerson {
        &self.tagger
    }
}

// ==================== Trees ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Tree,
    Feature,
}

/// Entry of a tree: a named pointer at a feature or a subtree
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) object_id: ObjectId,
    pub(crate) metadata_id: Option<ObjectId>,
    pub(crate) kind: NodeKind,
    pub(crate) bounds: Option<Envelope>,
}

impl Node {
    /// Feature entry; `metadata_id` is the feature type, when it differs
    /// from the parent tree's default
    pub fn feature(
        name: impl Into<String>,
        object_id: ObjectId,
        metadata_id: Option<ObjectId>,
        bounds: Option<Envelope>,
    ) -> Self {
        Self {
            name: name.into(),
            object_id,
            metadata_id: metadata_id.filter(|m| !m.is_null()),
            kind: NodeKind::Feature,
            bounds,
        }
    }

    /// Subtree entry; `metadata_id` is the default feature type of its features
    pub fn tree(name: impl Into<String>, object_id: ObjectId, metadata_id: Option<ObjectId>) -> Self {
        Self {
            name: name.into(),
            object_id,
            metadata_id: metadata_id.filter(|m| !m.is_null()),
            kind: NodeKind::Tree,
            bounds: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn metadata_id(&self) -> Option<ObjectId> {
        self.metadata_id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn bounds(&self) -> Option<Envelope> {
        self.bounds
    }

    pub fn is_tree(&self) -> bool {
        self.kind == NodeKind::Tree
    }

    /// Same entry under another name
    pub fn renamed(&self, name: impl Into<String>) -> Node {
        Node {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Same entry pointing at another object
    pub fn with_object_id(&self, object_id: ObjectId) -> Node {
        Node {
            object_id,
            ..self.clone()
        }
    }
}

/// Pointer at a bucket subtree of a large tree
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub(crate) index: u32,
    pub(crate) id: ObjectId,
    pub(crate) bounds: Option<Envelope>,
}

impl Bucket {
    pub fn new(index: u32, id: ObjectId, bounds: Option<Envelope>) -> Self {
        Self { index, id, bounds }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn bounds(&self) -> Option<Envelope> {
        self.bounds
    }
}

/// A tree is either a leaf holding nodes directly, or a bucketed tree whose
/// nodes are sharded by name hash into bucket subtrees.
///
/// `size` and `num_trees` count the feature and tree entries this logical
/// tree holds, across all of its buckets.
#[derive(Debug, Clone, PartialEq)]
pub struct RevTree {
    pub(crate) id: ObjectId,
    pub(crate) size: u64,
    pub(crate) num_trees: u32,
    pub(crate) trees: Vec<Node>,
    pub(crate) features: Vec<Node>,
    pub(crate) buckets: BTreeMap<u32, Bucket>,
}

impl RevTree {
    /// Leaf tree; nodes are kept in canonical order
    pub fn leaf(mut trees: Vec<Node>, mut features: Vec<Node>) -> Self {
        trees.sort_by(|a, b| crate::node_order::compare(&a.name, &b.name));
        features.sort_by(|a, b| crate::node_order::compare(&a.name, &b.name));
        Self::from_parts(
            features.len() as u64,
            trees.len() as u32,
            trees,
            features,
            BTreeMap::new(),
        )
    }

    /// Bucketed tree
    pub fn bucketed(size: u64, num_trees: u32, buckets: BTreeMap<u32, Bucket>) -> Self {
        Self::from_parts(size, num_trees, Vec::new(), Vec::new(), buckets)
    }

    pub(crate) fn from_parts(
        size: u64,
        num_trees: u32,
        trees: Vec<Node>,
        features: Vec<Node>,
        buckets: BTreeMap<u32, Bucket>,
    ) -> Self {
        let mut tree = Self {
            id: ObjectId::NULL,
            size,
            num_trees,
            trees,
            features,
            buckets,
        };
        tree.id = codec::hash_tree(&tree);
        tree
    }

    pub fn empty() -> Self {
        Self::leaf(Vec::new(), Vec::new())
    }

    /// Id of the empty tree
    pub fn empty_id() -> ObjectId {
        static EMPTY: std::sync::LazyLock<ObjectId> = std::sync::LazyLock::new(|| RevTree::empty().id);
        *EMPTY
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Number of feature entries
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of subtree entries
    pub fn num_trees(&self) -> u32 {
        self.num_trees
    }

    /// Total entries, features plus subtrees
    pub fn total_nodes(&self) -> u64 {
        self.size + self.num_trees as u64
    }

    pub fn trees(&self) -> &[Node] {
        &self.trees
    }

    pub fn features(&self) -> &[Node] {
        &self.features
    }

    pub fn buckets(&self) -> &BTreeMap<u32, Bucket> {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.total_nodes() == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Direct nodes of a leaf tree, subtrees first
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.trees.iter().chain(self.features.iter())
    }
}

/// Any stored object
#[derive(Debug, Clone, PartialEq)]
pub enum RevObject {
    Tree(RevTree),
    Feature(RevFeature),
    FeatureType(RevFeatureType),
    Commit(RevCommit),
    Tag(RevTag),
}

impl RevObject {
    pub fn id(&self) -> ObjectId {
        match self {
            RevObject::Tree(t) => t.id,
            RevObject::Feature(f) => f.id,
            RevObject::FeatureType(ft) => ft.id,
            RevObject::Commit(c) => c.id,
            RevObject::Tag(t) => t.id,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            RevObject::Tree(_) => ObjectKind::Tree,
            RevObject::Feature(_) => ObjectKind::Feature,
            RevObject::FeatureType(_) => ObjectKind::FeatureType,
            RevObject::Commit(_) => ObjectKind::Commit,
            RevObject::Tag(_) => ObjectKind::Tag,
        }
    }
}

impl From<RevTree> for RevObject {
    fn from(t: RevTree) -> Self {
        RevObject::Tree(t)
    }
}

impl From<RevFeature> for RevObject {
    fn from(f: RevFeature) -> Self {
        RevObject::Feature(f)
    }
}

impl From<RevFeatureType> for RevObject {
    fn from(ft: RevFeatureType) -> Self {
        RevObject::FeatureType(ft)
    }
}

impl From<RevCommit> for RevObject {
    fn from(c: RevCommit) -> Self {
        RevObject::Commit(c)
    }
}

impl From<RevTag> for RevObject {
    fn from(t: RevTag) -> Self {
        RevObject::Tag(t)
    }
}
