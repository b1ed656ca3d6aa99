//! Building and editing bucketed trees
//!
//! A logical tree at depth `d` is stored as a leaf while it holds at most
//! [`node_order::normalized_size_limit`] entries. Past that it is split into
//! bucket subtrees by name hash, each built the same way at `d + 1`. The
//! shape is a pure function of the node set, so a tree edited incrementally
//! gets the same id as one built from scratch.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::node_order::{self, MAX_DEPTH};
use crate::object::{Bucket, Envelope, Node, NodeKind, RevObject, RevTree};
use crate::storage::ObjectStore;

// ==================== Paths ====================

/// Join a parent path and a child name
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent part of a path, empty for top level entries
pub fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

/// Last segment of a path
pub fn node_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, n)| n).unwrap_or(path)
}

/// Whether `path` equals `prefix` or lies under it
pub fn is_same_or_child(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

/// A node plus where it sits in the tree hierarchy
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRef {
    parent_path: String,
    node: Node,
    /// Feature type of the node, explicit or inherited from the parent tree
    metadata_id: ObjectId,
}

impl NodeRef {
    pub fn new(parent_path: impl Into<String>, node: Node, default_metadata: ObjectId) -> Self {
        let metadata_id = node.metadata_id().unwrap_or(default_metadata);
        Self {
            parent_path: parent_path.into(),
            node,
            metadata_id,
        }
    }

    pub fn path(&self) -> String {
        child_path(&self.parent_path, self.node.name())
    }

    pub fn parent_path(&self) -> &str {
        &self.parent_path
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn object_id(&self) -> ObjectId {
        self.node.object_id()
    }

    pub fn metadata_id(&self) -> ObjectId {
        self.metadata_id
    }

    pub fn kind(&self) -> NodeKind {
        self.node.kind()
    }

    pub fn is_tree(&self) -> bool {
        self.node.is_tree()
    }
}

// ==================== Structural building ====================

/// Union of the bounds of everything in `tree`
pub fn tree_bounds(tree: &RevTree) -> Option<Envelope> {
    if tree.is_leaf() {
        tree.nodes().fold(None, |acc, n| Envelope::union(acc, n.bounds()))
    } else {
        tree.buckets()
            .values()
            .fold(None, |acc, b| Envelope::union(acc, b.bounds()))
    }
}

/// Build the canonical tree holding `nodes` at `depth`
///
/// Bucket subtrees are written to `store`; the returned top level tree is
/// not. Node names must be unique.
pub fn build_tree(store: &dyn ObjectStore, nodes: Vec<Node>, depth: usize) -> Result<RevTree> {
    if depth >= MAX_DEPTH || nodes.len() <= node_order::normalized_size_limit(depth) {
        let (trees, features): (Vec<Node>, Vec<Node>) = nodes.into_iter().partition(|n| n.is_tree());
        return Ok(RevTree::leaf(trees, features));
    }

    let mut size = 0u64;
    let mut num_trees = 0u32;
    let mut groups: BTreeMap<u32, Vec<Node>> = BTreeMap::new();
    for node in nodes {
        match node.kind() {
            NodeKind::Tree => num_trees += 1,
            NodeKind::Feature => size += 1,
        }
        groups
            .entry(node_order::bucket(node.name(), depth))
            .or_default()
            .push(node);
    }

    let mut buckets = BTreeMap::new();
    for (index, group) in groups {
        let child = build_tree(store, group, depth + 1)?;
        let bucket = Bucket::new(index, child.id(), tree_bounds(&child));
        store.put(&RevObject::Tree(child))?;
        buckets.insert(index, bucket);
    }
    Ok(RevTree::bucketed(size, num_trees, buckets))
}

/// Every direct entry of a logical tree, descending into its buckets
pub fn all_nodes(store: &dyn ObjectStore, tree: &RevTree) -> Result<Vec<Node>> {
    let mut out = Vec::with_capacity(tree.total_nodes() as usize);
    collect_nodes(store, tree, &mut out)?;
    Ok(out)
}

fn collect_nodes(store: &dyn ObjectStore, tree: &RevTree, out: &mut Vec<Node>) -> Result<()> {
    if tree.is_leaf() {
        out.extend(tree.nodes().cloned());
        return Ok(());
    }
    for bucket in tree.buckets().values() {
        let child = store.get_tree(&bucket.id())?;
        collect_nodes(store, &child, out)?;
    }
    Ok(())
}

/// Direct entry `name` of a logical tree stored at `depth`
pub fn find_child(
    store: &dyn ObjectStore,
    tree: &RevTree,
    name: &str,
    depth: usize,
) -> Result<Option<Node>> {
    if tree.is_leaf() {
        return Ok(tree.nodes().find(|n| n.name() == name).cloned());
    }
    let index = node_order::bucket(name, depth);
    match tree.buckets().get(&index) {
        Some(bucket) => {
            let child = store.get_tree(&bucket.id())?;
            find_child(store, &child, name, depth + 1)
        }
        None => Ok(None),
    }
}

/// Apply direct-entry changes (`None` removes) to a logical tree at `depth`
///
/// Only the buckets the changes fall in are rebuilt. New bucket subtrees are
/// written to `store`; the returned top level tree is not.
pub fn edit_tree(
    store: &dyn ObjectStore,
    tree: &RevTree,
    depth: usize,
    changes: BTreeMap<String, Option<Node>>,
) -> Result<RevTree> {
    if changes.is_empty() {
        return Ok(tree.clone());
    }

    if tree.is_leaf() {
        let mut nodes: BTreeMap<String, Node> = tree
            .nodes()
            .map(|n| (n.name().to_string(), n.clone()))
            .collect();
        for (name, change) in changes {
            match change {
                Some(node) => {
                    nodes.insert(name, node);
                }
                None => {
                    nodes.remove(&name);
                }
            }
        }
        return build_tree(store, nodes.into_values().collect(), depth);
    }

    let mut grouped: BTreeMap<u32, BTreeMap<String, Option<Node>>> = BTreeMap::new();
    for (name, change) in changes {
        grouped
            .entry(node_order::bucket(&name, depth))
            .or_default()
            .insert(name, change);
    }

    let mut buckets = tree.buckets().clone();
    let mut size = tree.size() as i64;
    let mut num_trees = tree.num_trees() as i64;
    for (index, group) in grouped {
        let child = match buckets.get(&index) {
            Some(bucket) => store.get_tree(&bucket.id())?,
            None => RevTree::empty(),
        };
        let new_child = edit_tree(store, &child, depth + 1, group)?;
        size += new_child.size() as i64 - child.size() as i64;
        num_trees += new_child.num_trees() as i64 - child.num_trees() as i64;
        if new_child.is_empty() {
            buckets.remove(&index);
        } else if new_child.id() != child.id() {
            buckets.insert(
                index,
                Bucket::new(index, new_child.id(), tree_bounds(&new_child)),
            );
            store.put(&RevObject::Tree(new_child))?;
        }
    }

    if size < 0 || num_trees < 0 {
        return Err(Error::Corrupt(format!(
            "negative entry count rebuilding tree {}",
            tree.id()
        )));
    }

    if (size + num_trees) as usize <= node_order::normalized_size_limit(depth) {
        let collapsed = RevTree::bucketed(size as u64, num_trees as u32, buckets);
        let nodes = all_nodes(store, &collapsed)?;
        return build_tree(store, nodes, depth);
    }
    Ok(RevTree::bucketed(size as u64, num_trees as u32, buckets))
}

// ==================== Path editing ====================

#[derive(Debug, Clone)]
enum PathEdit {
    Put(Node),
    Remove,
    EnsureTree(Option<ObjectId>),
}

/// Batch of path-level edits against a root tree
///
/// Edits are grouped by parent tree and applied bottom-up, rebuilding each
/// touched tree once.
pub struct TreeEditor<'a> {
    store: &'a dyn ObjectStore,
    edits: BTreeMap<String, PathEdit>,
}

impl<'a> TreeEditor<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            edits: BTreeMap::new(),
        }
    }

    /// Put `node` at `path`; the node is renamed to the last path segment.
    /// Missing parent trees are created.
    pub fn put(&mut self, path: &str, node: Node) -> &mut Self {
        let node = node.renamed(node_name(path));
        self.edits.insert(path.to_string(), PathEdit::Put(node));
        self
    }

    /// Remove the entry at `path`, with its whole subtree
    pub fn remove(&mut self, path: &str) -> &mut Self {
        self.edits.insert(path.to_string(), PathEdit::Remove);
        self
    }

    /// Make sure a tree exists at `path`, setting its default feature type
    /// when one is given
    pub fn ensure_tree(&mut self, path: &str, metadata_id: Option<ObjectId>) -> &mut Self {
        self.edits
            .insert(path.to_string(), PathEdit::EnsureTree(metadata_id));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Apply the edits to the tree `root_id`, store every new tree and
    /// return the new root id
    pub fn apply(&self, root_id: &ObjectId) -> Result<ObjectId> {
        let root = if root_id.is_null() {
            RevTree::empty()
        } else {
            self.store.get_tree(root_id)?
        };
        if self.edits.is_empty() {
            return Ok(root.id());
        }
        let edits: Vec<(&str, &PathEdit)> = self
            .edits
            .iter()
            .filter(|(path, _)| !path.is_empty())
            .map(|(p, e)| (p.as_str(), e))
            .collect();
        let new_root = self.apply_at(root, &edits)?;
        Ok(new_root.id())
    }

    fn apply_at(&self, tree: RevTree, edits: &[(&str, &PathEdit)]) -> Result<RevTree> {
        let mut direct: BTreeMap<String, Option<Node>> = BTreeMap::new();
        let mut nested: BTreeMap<&str, Vec<(&str, &PathEdit)>> = BTreeMap::new();
        let mut ensure: BTreeMap<&str, Option<ObjectId>> = BTreeMap::new();

        for &(rel, edit) in edits {
            match rel.split_once('/') {
                Some((head, rest)) => nested.entry(head).or_default().push((rest, edit)),
                None => match edit {
                    PathEdit::Put(node) => {
                        direct.insert(rel.to_string(), Some(node.clone()));
                    }
                    PathEdit::Remove => {
                        direct.insert(rel.to_string(), None);
                    }
                    PathEdit::EnsureTree(metadata) => {
                        ensure.insert(rel, *metadata);
                    }
                },
            }
        }

        let mut subtree_names: Vec<&str> = nested.keys().copied().collect();
        subtree_names.extend(ensure.keys().copied().filter(|n| !nested.contains_key(n)));

        for name in subtree_names {
            let current = match direct.get(name) {
                Some(change) => change.clone(),
                None => find_child(self.store, &tree, name, 0)?,
            };
            let current_tree = current.filter(|n| n.is_tree());
            let requested_metadata = ensure.get(name).copied().flatten();
            let metadata = requested_metadata.or_else(|| current_tree.as_ref().and_then(|n| n.metadata_id()));

            match nested.get(name) {
                Some(child_edits) => {
                    let only_removals = child_edits.iter().all(|(_, e)| matches!(e, PathEdit::Remove));
                    if current_tree.is_none() && only_removals && !ensure.contains_key(name) {
                        continue;
                    }
                    let child = match &current_tree {
                        Some(n) => self.store.get_tree(&n.object_id())?,
                        None => RevTree::empty(),
                    };
                    let new_child = self.apply_at(child, child_edits)?;
                    direct.insert(
                        name.to_string(),
                        Some(Node::tree(name, new_child.id(), metadata)),
                    );
                }
                None => match current_tree {
                    Some(n) => {
                        if n.metadata_id() != metadata {
                            direct.insert(name.to_string(), Some(Node::tree(name, n.object_id(), metadata)));
                        }
                    }
                    None => {
                        let empty = RevTree::empty();
                        self.store.put(&RevObject::Tree(empty.clone()))?;
                        direct.insert(name.to_string(), Some(Node::tree(name, empty.id(), metadata)));
                    }
                },
            }
        }

        let new_tree = edit_tree(self.store, &tree, 0, direct)?;
        self.store.put(&RevObject::Tree(new_tree.clone()))?;
        Ok(new_tree)
    }
}

// ==================== Lookups ====================

/// Find the entry at `path` under the root tree `root_id`
pub fn find_node(store: &dyn ObjectStore, root_id: &ObjectId, path: &str) -> Result<Option<NodeRef>> {
    if path.is_empty() || root_id.is_null() {
        return Ok(None);
    }
    let mut tree = store.get_tree(root_id)?;
    let mut parent = String::new();
    let mut default_metadata = ObjectId::NULL;
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        let node = match find_child(store, &tree, segment, 0)? {
            Some(n) => n,
            None => return Ok(None),
        };
        if segments.peek().is_none() {
            return Ok(Some(NodeRef::new(parent, node, default_metadata)));
        }
        if !node.is_tree() {
            return Ok(None);
        }
        default_metadata = node.metadata_id().unwrap_or(default_metadata);
        parent = child_path(&parent, segment);
        tree = store.get_tree(&node.object_id())?;
    }
    Ok(None)
}

/// Id of the tree at `path`, the root itself for the empty path
pub fn find_tree_id(store: &dyn ObjectStore, root_id: &ObjectId, path: &str) -> Result<Option<ObjectId>> {
    if path.is_empty() {
        return Ok(Some(*root_id));
    }
    Ok(find_node(store, root_id, path)?
        .filter(|r| r.is_tree())
        .map(|r| r.object_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{RevFeature, Value};
    use crate::storage::HeapObjectStore;

    fn feature_node(name: &str, value: i32) -> Node {
        let f = RevFeature::new(vec![Value::Int(value)]);
        Node::feature(name, f.id(), None, Some(Envelope::point(value as f64, 0.0)))
    }

    fn nodes(count: usize) -> Vec<Node> {
        (0..count).map(|i| feature_node(&format!("f{}", i), i as i32)).collect()
    }

    #[test]
    fn test_paths() {
        assert_eq!(child_path("", "a"), "a");
        assert_eq!(child_path("a/b", "c"), "a/b/c");
        assert_eq!(parent_path("a/b/c"), "a/b");
        assert_eq!(parent_path("a"), "");
        assert_eq!(node_name("a/b/c"), "c");
        assert!(is_same_or_child("a/b", "a"));
        assert!(is_same_or_child("a", "a"));
        assert!(!is_same_or_child("ab", "a"));
        assert!(is_same_or_child("x", ""));
    }

    #[test]
    fn test_small_tree_is_leaf() {
        let store = HeapObjectStore::new();
        let tree = build_tree(&store, nodes(10), 0).unwrap();
        assert!(tree.is_leaf());
        assert_eq!(tree.size(), 10);
    }

    #[test]
    fn test_large_tree_is_bucketed() {
        let store = HeapObjectStore::new();
        let tree = build_tree(&store, nodes(2000), 0).unwrap();
        assert!(!tree.is_leaf());
        assert_eq!(tree.size(), 2000);
        assert!(tree.buckets().len() <= 32);
        assert_eq!(all_nodes(&store, &tree).unwrap().len(), 2000);
        assert!(find_child(&store, &tree, "f1234", 0).unwrap().is_some());
        assert!(find_child(&store, &tree, "nope", 0).unwrap().is_none());
    }

    #[test]
    fn test_incremental_edits_match_full_build() {
        let store = HeapObjectStore::new();
        let mut tree = build_tree(&store, nodes(400), 0).unwrap();
        for chunk in nodes(1500)[400..].chunks(100) {
            let changes = chunk
                .iter()
                .map(|n| (n.name().to_string(), Some(n.clone())))
                .collect();
            tree = edit_tree(&store, &tree, 0, changes).unwrap();
        }
        let full = build_tree(&store, nodes(1500), 0).unwrap();
        assert_eq!(tree.id(), full.id());

        // shrink back below the leaf limit
        let removals = nodes(1500)[100..]
            .iter()
            .map(|n| (n.name().to_string(), None))
            .collect();
        let shrunk = edit_tree(&store, &tree, 0, removals).unwrap();
        assert!(shrunk.is_leaf());
        assert_eq!(shrunk.id(), build_tree(&store, nodes(100), 0).unwrap().id());
    }

    #[test]
    fn test_editor_creates_and_removes_paths() {
        let store = HeapObjectStore::new();
        let md = ObjectId::from_data(b"feature type");
        let mut editor = TreeEditor::new(&store);
        editor.ensure_tree("roads", Some(md));
        editor.put("roads/r1", feature_node("x", 1));
        editor.put("roads/sub/r2", feature_node("y", 2));
        let root = editor.apply(&RevTree::empty_id()).unwrap();

        let r1 = find_node(&store, &root, "roads/r1").unwrap().unwrap();
        assert_eq!(r1.name(), "r1");
        assert_eq!(r1.parent_path(), "roads");
        assert_eq!(r1.metadata_id(), md);
        let r2 = find_node(&store, &root, "roads/sub/r2").unwrap().unwrap();
        assert_eq!(r2.path(), "roads/sub/r2");
        assert_eq!(r2.metadata_id(), md);

        let mut editor = TreeEditor::new(&store);
        editor.remove("roads/sub");
        editor.remove("roads/sub/r2");
        let root2 = editor.apply(&root).unwrap();
        assert!(find_node(&store, &root2, "roads/sub").unwrap().is_none());
        assert!(find_node(&store, &root2, "roads/r1").unwrap().is_some());

        // removing something that does not exist leaves the tree unchanged
        let mut editor = TreeEditor::new(&store);
        editor.remove("nothing/here");
        assert_eq!(editor.apply(&root2).unwrap(), root2);
    }

    #[test]
    fn test_editor_result_is_order_independent() {
        let store = HeapObjectStore::new();
        let mut a = TreeEditor::new(&store);
        a.put("l/a", feature_node("a", 1)).put("l/b", feature_node("b", 2));
        let one = a.apply(&ObjectId::NULL).unwrap();

        let mut b1 = TreeEditor::new(&store);
        b1.put("l/b", feature_node("b", 2));
        let mid = b1.apply(&ObjectId::NULL).unwrap();
        let mut b2 = TreeEditor::new(&store);
        b2.put("l/a", feature_node("a", 1));
        assert_eq!(b2.apply(&mid).unwrap(), one);
    }
}
