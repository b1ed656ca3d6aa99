//! Tree diff engine
//!
//! Walks two trees in parallel and reports added, removed and modified
//! entries in depth-first order, lexical by name within each tree. Subtrees
//! and buckets with equal ids are skipped without being loaded, so the cost
//! of a diff follows the size of the change, not the size of the trees.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::node_order;
use crate::object::{Node, NodeKind, RevTree};
use crate::progress::ProgressListener;
use crate::storage::ObjectStore;
use crate::tree::{NodeRef, child_path, is_same_or_child};

/// Nodes processed between two cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// One changed entry; `old` only is a removal, `new` only an addition
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    old: Option<NodeRef>,
    new: Option<NodeRef>,
}

impl DiffEntry {
    pub fn new(old: Option<NodeRef>, new: Option<NodeRef>) -> Self {
        debug_assert!(old.is_some() || new.is_some());
        Self { old, new }
    }

    pub fn old(&self) -> Option<&NodeRef> {
        self.old.as_ref()
    }

    pub fn new_ref(&self) -> Option<&NodeRef> {
        self.new.as_ref()
    }

    pub fn change_type(&self) -> ChangeType {
        match (&self.old, &self.new) {
            (None, Some(_)) => ChangeType::Added,
            (Some(_), None) => ChangeType::Removed,
            _ => ChangeType::Modified,
        }
    }

    pub fn path(&self) -> String {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|r| r.path())
            .unwrap_or_default()
    }

    /// Old object id, null when added
    pub fn old_object_id(&self) -> ObjectId {
        self.old.as_ref().map(|r| r.object_id()).unwrap_or(ObjectId::NULL)
    }

    /// New object id, null when removed
    pub fn new_object_id(&self) -> ObjectId {
        self.new.as_ref().map(|r| r.object_id()).unwrap_or(ObjectId::NULL)
    }

    pub fn kind(&self) -> NodeKind {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|r| r.kind())
            .unwrap_or(NodeKind::Feature)
    }

    pub fn is_tree(&self) -> bool {
        self.kind() == NodeKind::Tree
    }

    /// The same change seen from the other side
    pub fn reversed(&self) -> DiffEntry {
        DiffEntry {
            old: self.new.clone(),
            new: self.old.clone(),
        }
    }
}

/// Tally of a diff by entry kind
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffObjectCount {
    pub trees_added: u64,
    pub trees_removed: u64,
    pub trees_changed: u64,
    pub features_added: u64,
    pub features_removed: u64,
    pub features_changed: u64,
}

impl DiffObjectCount {
    pub fn add(&mut self, entry: &DiffEntry) {
        let tree = entry.is_tree();
        let counter = match (entry.change_type(), tree) {
            (ChangeType::Added, true) => &mut self.trees_added,
            (ChangeType::Removed, true) => &mut self.trees_removed,
            (ChangeType::Modified, true) => &mut self.trees_changed,
            (ChangeType::Added, false) => &mut self.features_added,
            (ChangeType::Removed, false) => &mut self.features_removed,
            (ChangeType::Modified, false) => &mut self.features_changed,
        };
        *counter += 1;
    }

    pub fn features_count(&self) -> u64 {
        self.features_added + self.features_removed + self.features_changed
    }

    pub fn trees_count(&self) -> u64 {
        self.trees_added + self.trees_removed + self.trees_changed
    }

    pub fn count(&self) -> u64 {
        self.features_count() + self.trees_count()
    }
}

/// Diff between two trees
///
/// Entries come depth first, ordered by name within a level, with a tree
/// entry (when reported) ahead of its children. A path whose kind changes
/// between feature and tree is always reported as the removal of the old
/// node, with its children, followed by the addition of the new one, in
/// both directions. Reversing each entry of `diff(a, b)` therefore yields
/// the entries of `diff(b, a)` in the same order, except within such a
/// kind-changing group.
///
/// ```ignore
/// let entries = TreeDiff::new(store)
///     .path_filter("roads")
///     .report_trees(true)
///     .entries(&old_tree, &new_tree)?;
/// ```
#[derive(Clone)]
pub struct TreeDiff<'a> {
    store: &'a dyn ObjectStore,
    filters: Vec<String>,
    report_trees: bool,
    listener: Option<&'a dyn ProgressListener>,
}

impl<'a> TreeDiff<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            filters: Vec::new(),
            report_trees: false,
            listener: None,
        }
    }

    /// Restrict the diff to `path` and everything under it; several filters
    /// are combined
    pub fn path_filter(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        let trimmed = path.trim_matches('/').to_string();
        if !trimmed.is_empty() {
            self.filters.push(trimmed);
        }
        self
    }

    pub fn path_filters<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        paths.into_iter().fold(self, |d, p| d.path_filter(p))
    }

    /// Also report entries for trees whose content changed
    pub fn report_trees(mut self, report: bool) -> Self {
        self.report_trees = report;
        self
    }

    /// Check `listener` for cancellation while walking
    pub fn listener(mut self, listener: &'a dyn ProgressListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Stream the changes between two trees to `consumer`; a null id is the
    /// empty tree
    pub fn walk(
        &self,
        old_tree: &ObjectId,
        new_tree: &ObjectId,
        consumer: &mut dyn FnMut(DiffEntry) -> Result<()>,
    ) -> Result<()> {
        let mut walker = Walker {
            diff: self,
            consumer,
            processed: 0,
        };
        let old = walker.load_or_empty(old_tree)?;
        let new = walker.load_or_empty(new_tree)?;
        walker.walk_level("", Side::Tree(old), Side::Tree(new), ObjectId::NULL, ObjectId::NULL)
    }

    /// Collect the changes between two trees
    pub fn entries(&self, old_tree: &ObjectId, new_tree: &ObjectId) -> Result<Vec<DiffEntry>> {
        let mut out = Vec::new();
        self.walk(old_tree, new_tree, &mut |e| {
            out.push(e);
            Ok(())
        })?;
        Ok(out)
    }

    /// Count the changes between two trees, trees included
    pub fn count(&self, old_tree: &ObjectId, new_tree: &ObjectId) -> Result<DiffObjectCount> {
        let mut count = DiffObjectCount::default();
        self.clone().report_trees(true).walk(old_tree, new_tree, &mut |e| {
            count.add(&e);
            Ok(())
        })?;
        Ok(count)
    }

    fn in_scope(&self, path: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| is_same_or_child(path, f))
    }

    fn should_descend(&self, path: &str) -> bool {
        self.in_scope(path) || self.filters.iter().any(|f| is_same_or_child(f, path))
    }
}

/// One side of a comparison at some bucket depth
enum Side {
    Tree(RevTree),
    /// Entries of a leaf tree that fall in one bucket of the other side
    Nodes(Vec<Node>),
}

impl Side {
    fn empty() -> Self {
        Side::Nodes(Vec::new())
    }

    fn is_bucketed(&self) -> bool {
        matches!(self, Side::Tree(t) if !t.is_leaf())
    }

    fn into_nodes(self) -> Vec<Node> {
        match self {
            Side::Tree(t) => t.nodes().cloned().collect(),
            Side::Nodes(n) => n,
        }
    }
}

type NodePair = (Option<Node>, Option<Node>);

fn same_entry(a: &Node, b: &Node) -> bool {
    a.object_id() == b.object_id() && a.metadata_id() == b.metadata_id() && a.kind() == b.kind()
}

fn pair_name(pair: &NodePair) -> &str {
    match pair {
        (Some(n), _) | (None, Some(n)) => n.name(),
        (None, None) => "",
    }
}

struct Walker<'d, 'a, 'c> {
    diff: &'d TreeDiff<'a>,
    consumer: &'c mut dyn FnMut(DiffEntry) -> Result<()>,
    processed: usize,
}

impl Walker<'_, '_, '_> {
    fn tick(&mut self) -> Result<()> {
        self.processed += 1;
        if self.processed % CANCEL_CHECK_INTERVAL == 0 {
            if let Some(listener) = self.diff.listener {
                if listener.is_canceled() {
                    return Err(Error::Canceled);
                }
            }
        }
        Ok(())
    }

    fn load(&mut self, id: &ObjectId) -> Result<RevTree> {
        self.tick()?;
        self.diff.store.get_tree(id)
    }

    fn load_or_empty(&mut self, id: &ObjectId) -> Result<RevTree> {
        if id.is_null() || *id == RevTree::empty_id() {
            return Ok(RevTree::empty());
        }
        self.load(id)
    }

    /// Entries that differ between two logical trees, in no particular order
    fn changed_pairs(&mut self, old: Side, new: Side, depth: usize, out: &mut Vec<NodePair>) -> Result<()> {
        if let (Side::Tree(o), Side::Tree(n)) = (&old, &new) {
            if o.id() == n.id() {
                return Ok(());
            }
        }

        match (old.is_bucketed(), new.is_bucketed()) {
            (false, false) => {
                let mut by_name: BTreeMap<String, NodePair> = BTreeMap::new();
                for node in old.into_nodes() {
                    let name = node.name().to_string();
                    by_name.entry(name).or_default().0 = Some(node);
                }
                for node in new.into_nodes() {
                    let name = node.name().to_string();
                    by_name.entry(name).or_default().1 = Some(node);
                }
                for (_, pair) in by_name {
                    let changed = match &pair {
                        (Some(o), Some(n)) => !same_entry(o, n),
                        _ => true,
                    };
                    if changed {
                        out.push(pair);
                    }
                }
                Ok(())
            }
            (true, true) => {
                let (Side::Tree(o), Side::Tree(n)) = (old, new) else {
                    return Ok(());
                };
                let mut indexes: Vec<u32> = o.buckets().keys().chain(n.buckets().keys()).copied().collect();
                indexes.sort_unstable();
                indexes.dedup();
                for index in indexes {
                    let ob = o.buckets().get(&index).map(|b| b.id());
                    let nb = n.buckets().get(&index).map(|b| b.id());
                    if ob == nb {
                        continue;
                    }
                    let old_child = match ob {
                        Some(id) => Side::Tree(self.load(&id)?),
                        None => Side::empty(),
                    };
                    let new_child = match nb {
                        Some(id) => Side::Tree(self.load(&id)?),
                        None => Side::empty(),
                    };
                    self.changed_pairs(old_child, new_child, depth + 1, out)?;
                }
                Ok(())
            }
            (old_bucketed, _) => {
                // one side is split into buckets, the other is a plain node list
                let (bucketed, leaf) = if old_bucketed { (old, new) } else { (new, old) };
                let Side::Tree(bucketed) = bucketed else {
                    return Ok(());
                };
                let mut groups: BTreeMap<u32, Vec<Node>> = BTreeMap::new();
                for node in leaf.into_nodes() {
                    groups
                        .entry(node_order::bucket(node.name(), depth))
                        .or_default()
                        .push(node);
                }
                let mut indexes: Vec<u32> = bucketed.buckets().keys().chain(groups.keys()).copied().collect();
                indexes.sort_unstable();
                indexes.dedup();
                for index in indexes {
                    let bucket_side = match bucketed.buckets().get(&index) {
                        Some(b) => Side::Tree(self.load(&b.id())?),
                        None => Side::empty(),
                    };
                    let leaf_side = Side::Nodes(groups.remove(&index).unwrap_or_default());
                    if old_bucketed {
                        self.changed_pairs(bucket_side, leaf_side, depth + 1, out)?;
                    } else {
                        self.changed_pairs(leaf_side, bucket_side, depth + 1, out)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn walk_level(
        &mut self,
        parent_path: &str,
        old: Side,
        new: Side,
        old_metadata: ObjectId,
        new_metadata: ObjectId,
    ) -> Result<()> {
        let mut pairs = Vec::new();
        self.changed_pairs(old, new, 0, &mut pairs)?;
        pairs.sort_by(|a, b| pair_name(a).cmp(pair_name(b)));

        for pair in pairs {
            match pair {
                (Some(o), Some(n)) if o.kind() != n.kind() => {
                    self.visit(parent_path, Some(o), None, old_metadata, new_metadata)?;
                    self.visit(parent_path, None, Some(n), old_metadata, new_metadata)?;
                }
                (o, n) => self.visit(parent_path, o, n, old_metadata, new_metadata)?,
            }
        }
        Ok(())
    }

    fn visit(
        &mut self,
        parent_path: &str,
        old: Option<Node>,
        new: Option<Node>,
        old_metadata: ObjectId,
        new_metadata: ObjectId,
    ) -> Result<()> {
        self.tick()?;
        let name = match (&old, &new) {
            (Some(n), _) | (None, Some(n)) => n.name().to_string(),
            (None, None) => return Ok(()),
        };
        let path = child_path(parent_path, &name);
        if !self.diff.should_descend(&path) {
            return Ok(());
        }
        let in_scope = self.diff.in_scope(&path);
        let is_tree = old.as_ref().or(new.as_ref()).map(|n| n.is_tree()).unwrap_or(false);

        if !is_tree {
            if in_scope {
                let entry = DiffEntry::new(
                    old.map(|n| NodeRef::new(parent_path, n, old_metadata)),
                    new.map(|n| NodeRef::new(parent_path, n, new_metadata)),
                );
                (self.consumer)(entry)?;
            }
            return Ok(());
        }

        let old_child_metadata = old.as_ref().and_then(|n| n.metadata_id()).unwrap_or(old_metadata);
        let new_child_metadata = new.as_ref().and_then(|n| n.metadata_id()).unwrap_or(new_metadata);
        let old_tree_id = old.as_ref().map(|n| n.object_id()).unwrap_or(ObjectId::NULL);
        let new_tree_id = new.as_ref().map(|n| n.object_id()).unwrap_or(ObjectId::NULL);

        if in_scope && self.diff.report_trees {
            let entry = DiffEntry::new(
                old.map(|n| NodeRef::new(parent_path, n, old_metadata)),
                new.map(|n| NodeRef::new(parent_path, n, new_metadata)),
            );
            (self.consumer)(entry)?;
        }

        if old_tree_id == new_tree_id {
            return Ok(());
        }
        let old_tree = self.load_or_empty(&old_tree_id)?;
        let new_tree = self.load_or_empty(&new_tree_id)?;
        self.walk_level(
            &path,
            Side::Tree(old_tree),
            Side::Tree(new_tree),
            old_child_metadata,
            new_child_metadata,
        )
    }
}
