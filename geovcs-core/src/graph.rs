//! Commit graph index
//!
//! Maps commit ids to their parents, children, rewrite mapping and free-form
//! properties. Unknown commits read as nodes without parents so that
//! shallow or sparse histories can be walked without special cases.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use tracing::debug;

use crate::codec::{Reader, write_varint};
use crate::error::{Error, Result};
use crate::id::{NUM_BYTES, ObjectId};
use crate::storage::{ConnectionManager, DbHandle};

/// Property marking a commit whose history was only partially copied
pub const SPARSE_FLAG: &str = "sparse";

/// One commit in the graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphNode {
    pub id: ObjectId,
    /// Original commit this one is a rewritten copy of
    pub mapped_to: Option<ObjectId>,
    pub parents: Vec<ObjectId>,
    pub children: Vec<ObjectId>,
    pub properties: BTreeMap<String, String>,
}

impl GraphNode {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.properties
            .get(SPARSE_FLAG)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Stored layout: `id`, `mapped_to`, varint-counted parent and child
    /// lists, varint-counted property pairs. Ids carry a size byte (0 or 20);
    /// property strings a u16 length.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 21 * (self.parents.len() + self.children.len()));
        write_opt_id(&mut out, Some(&self.id));
        write_opt_id(&mut out, self.mapped_to.as_ref());
        for list in [&self.parents, &self.children] {
            write_varint(&mut out, list.len() as u64);
            for id in list {
                write_opt_id(&mut out, Some(id));
            }
        }
        write_varint(&mut out, self.properties.len() as u64);
        for (k, v) in &self.properties {
            write_short_str(&mut out, k);
            write_short_str(&mut out, v);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let id = read_opt_id(&mut r)?
            .ok_or_else(|| Error::Corrupt("graph node without id".to_string()))?;
        let mapped_to = read_opt_id(&mut r)?;
        let mut lists = [Vec::new(), Vec::new()];
        for list in lists.iter_mut() {
            for _ in 0..r.len()? {
                if let Some(id) = read_opt_id(&mut r)? {
                    list.push(id);
                }
            }
        }
        let [parents, children] = lists;
        let mut properties = BTreeMap::new();
        for _ in 0..r.len()? {
            let k = read_short_str(&mut r)?;
            let v = read_short_str(&mut r)?;
            properties.insert(k, v);
        }
        Ok(Self {
            id,
            mapped_to,
            parents,
            children,
            properties,
        })
    }
}

fn write_opt_id(out: &mut Vec<u8>, id: Option<&ObjectId>) {
    match id {
        Some(id) if !id.is_null() => {
            out.push(NUM_BYTES as u8);
            out.extend_from_slice(id.as_bytes());
        }
        _ => out.push(0),
    }
}

fn read_opt_id(r: &mut Reader<'_>) -> Result<Option<ObjectId>> {
    match r.u8()? {
        0 => Ok(None),
        n if n as usize == NUM_BYTES => Ok(Some(r.id()?)),
        n => Err(Error::Corrupt(format!("invalid id size {} in graph node", n))),
    }
}

fn write_short_str(out: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_short_str(r: &mut Reader<'_>) -> Result<String> {
    let len = u16::from_be_bytes(r.array()?) as usize;
    String::from_utf8(r.take(len)?.to_vec()).map_err(|e| Error::Corrupt(e.to_string()))
}

/// Commit ancestry index
pub trait GraphDatabase: Send + Sync {
    fn get_node(&self, id: &ObjectId) -> Result<Option<GraphNode>>;

    /// Record edges for many commits in one atomic write, returning whether
    /// anything changed
    fn put_all(&self, commits: &[(ObjectId, Vec<ObjectId>)]) -> Result<bool>;

    /// Record that `mapped` is a rewritten copy of `original`; a null
    /// `original` clears the mapping
    fn map(&self, mapped: &ObjectId, original: &ObjectId) -> Result<()>;

    fn set_property(&self, id: &ObjectId, key: &str, value: &str) -> Result<()>;

    /// Remove every node
    fn truncate(&self) -> Result<()>;

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.get_node(id)?.is_some())
    }

    /// Record the edges of one commit, returning whether anything changed
    fn put(&self, id: &ObjectId, parents: &[ObjectId]) -> Result<bool> {
        self.put_all(&[(*id, parents.to_vec())])
    }

    fn get_parents(&self, id: &ObjectId) -> Result<Vec<ObjectId>> {
        Ok(self.get_node(id)?.map(|n| n.parents).unwrap_or_default())
    }

    fn get_children(&self, id: &ObjectId) -> Result<Vec<ObjectId>> {
        Ok(self.get_node(id)?.map(|n| n.children).unwrap_or_default())
    }

    fn get_mapping(&self, id: &ObjectId) -> Result<Option<ObjectId>> {
        Ok(self.get_node(id)?.and_then(|n| n.mapped_to))
    }

    /// Distance from `id` to the nearest commit without parents
    fn get_depth(&self, id: &ObjectId) -> Result<usize> {
        let mut level = vec![*id];
        let mut seen: HashSet<ObjectId> = HashSet::from([*id]);
        let mut depth = 0;
        while !level.is_empty() {
            let mut next = Vec::new();
            for commit in &level {
                let parents = self.get_parents(commit)?;
                if parents.is_empty() {
                    return Ok(depth);
                }
                next.extend(parents.into_iter().filter(|p| seen.insert(*p)));
            }
            level = next;
            depth += 1;
        }
        Ok(depth)
    }
}

/// Compute the node updates of a batch of puts against `load`, with a
/// pending overlay so later puts in the batch see earlier ones
fn stage_puts(
    load: &dyn Fn(&ObjectId) -> Result<Option<GraphNode>>,
    commits: &[(ObjectId, Vec<ObjectId>)],
) -> Result<(BTreeMap<ObjectId, GraphNode>, bool)> {
    let mut pending: BTreeMap<ObjectId, GraphNode> = BTreeMap::new();
    let mut changed = false;

    let get = |pending: &BTreeMap<ObjectId, GraphNode>, id: &ObjectId| -> Result<Option<GraphNode>> {
        match pending.get(id) {
            Some(n) => Ok(Some(n.clone())),
            None => load(id),
        }
    };

    for (id, parents) in commits {
        let mut node = match get(&pending, id)? {
            Some(n) => n,
            None => {
                changed = true;
                GraphNode::new(*id)
            }
        };
        for parent in parents {
            if parent == id || parent.is_null() {
                continue;
            }
            if !node.parents.contains(parent) {
                node.parents.push(*parent);
                changed = true;
            }
        }
        pending.insert(*id, node);

        for parent in parents {
            if parent == id || parent.is_null() {
                continue;
            }
            let mut parent_node = get(&pending, parent)?.unwrap_or_else(|| GraphNode::new(*parent));
            if !parent_node.children.contains(id) {
                parent_node.children.push(*id);
                changed = true;
                pending.insert(*parent, parent_node);
            }
        }
    }
    Ok((pending, changed))
}

// ==================== In-memory graph ====================

/// Graph held in a map
#[derive(Default)]
pub struct HeapGraphDatabase {
    nodes: RwLock<HashMap<ObjectId, GraphNode>>,
}

impl HeapGraphDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphDatabase for HeapGraphDatabase {
    fn get_node(&self, id: &ObjectId) -> Result<Option<GraphNode>> {
        Ok(self.nodes.read()?.get(id).cloned())
    }

    fn put_all(&self, commits: &[(ObjectId, Vec<ObjectId>)]) -> Result<bool> {
        let mut nodes = self.nodes.write()?;
        let (pending, changed) = {
            let snapshot = &*nodes;
            stage_puts(&|id| Ok(snapshot.get(id).cloned()), commits)?
        };
        nodes.extend(pending);
        Ok(changed)
    }

    fn map(&self, mapped: &ObjectId, original: &ObjectId) -> Result<()> {
        let mut nodes = self.nodes.write()?;
        let node = nodes.entry(*mapped).or_insert_with(|| GraphNode::new(*mapped));
        node.mapped_to = Some(*original).filter(|o| !o.is_null());
        Ok(())
    }

    fn set_property(&self, id: &ObjectId, key: &str, value: &str) -> Result<()> {
        let mut nodes = self.nodes.write()?;
        nodes
            .entry(*id)
            .or_insert_with(|| GraphNode::new(*id))
            .properties
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        self.nodes.write()?.clear();
        Ok(())
    }
}

// ==================== Persistent graph ====================

/// Graph persisted in a sled database, one key per commit id
pub struct SledGraphDatabase {
    handle: DbHandle,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl SledGraphDatabase {
    pub fn open(manager: &ConnectionManager, path: &Path, read_only: bool) -> Result<Self> {
        let handle = manager.acquire(path, read_only)?;
        debug!(path = %path.display(), "Opened graph database");
        Ok(Self {
            handle,
            write_lock: Mutex::new(()),
        })
    }

    fn load(&self, id: &ObjectId) -> Result<Option<GraphNode>> {
        match self.handle.db().get(id.as_bytes())? {
            Some(raw) => Ok(Some(GraphNode::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn store(&self, nodes: impl IntoIterator<Item = GraphNode>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for node in nodes {
            batch.insert(&node.id.as_bytes()[..], node.encode());
        }
        self.handle.db().apply_batch(batch)?;
        self.handle.db().flush()?;
        Ok(())
    }

    fn update(&self, id: &ObjectId, f: impl FnOnce(&mut GraphNode)) -> Result<()> {
        self.handle.check_writable()?;
        let _guard = self.write_lock.lock()?;
        let mut node = self.load(id)?.unwrap_or_else(|| GraphNode::new(*id));
        f(&mut node);
        self.store([node])
    }
}

impl GraphDatabase for SledGraphDatabase {
    fn get_node(&self, id: &ObjectId) -> Result<Option<GraphNode>> {
        self.load(id)
    }

    fn put_all(&self, commits: &[(ObjectId, Vec<ObjectId>)]) -> Result<bool> {
        self.handle.check_writable()?;
        let _guard = self.write_lock.lock()?;
        let (pending, changed) = stage_puts(&|id| self.load(id), commits)?;
        if !pending.is_empty() && changed {
            self.store(pending.into_values())?;
        }
        Ok(changed)
    }

    fn map(&self, mapped: &ObjectId, original: &ObjectId) -> Result<()> {
        self.update(mapped, |node| {
            node.mapped_to = Some(*original).filter(|o| !o.is_null());
        })
    }

    fn set_property(&self, id: &ObjectId, key: &str, value: &str) -> Result<()> {
        self.update(id, |node| {
            node.properties.insert(key.to_string(), value.to_string());
        })
    }

    fn truncate(&self) -> Result<()> {
        self.handle.check_writable()?;
        let _guard = self.write_lock.lock()?;
        self.handle.db().clear()?;
        self.handle.db().flush()?;
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

    fn check_graph_contract(graph: &dyn GraphDatabase) {
        // 1 <- 2 <- 3 and 2 <- 4, 3 + 4 <- 5
        assert!(graph.put(&id(1), &[]).unwrap());
        assert!(graph.put(&id(2), &[id(1)]).unwrap());
        assert!(!graph.put(&id(2), &[id(1)]).unwrap());
        graph
            .put_all(&[
                (id(3), vec![id(2)]),
                (id(4), vec![id(2)]),
                (id(5), vec![id(3), id(4)]),
            ])
            .unwrap();

        assert_eq!(graph.get_parents(&id(5)).unwrap(), vec![id(3), id(4)]);
        let mut children = graph.get_children(&id(2)).unwrap();
        children.sort();
        let mut expected = vec![id(3), id(4)];
        expected.sort();
        assert_eq!(children, expected);
        assert!(graph.get_parents(&id(99)).unwrap().is_empty());
        assert!(!graph.exists(&id(99)).unwrap());

        assert_eq!(graph.get_depth(&id(1)).unwrap(), 0);
        assert_eq!(graph.get_depth(&id(5)).unwrap(), 3);
        assert_eq!(graph.get_depth(&id(99)).unwrap(), 0);

        graph.map(&id(5), &id(3)).unwrap();
        assert_eq!(graph.get_mapping(&id(5)).unwrap(), Some(id(3)));
        graph.map(&id(5), &ObjectId::NULL).unwrap();
        assert_eq!(graph.get_mapping(&id(5)).unwrap(), None);
        assert_eq!(graph.get_parents(&id(5)).unwrap().len(), 2);

        graph.set_property(&id(1), SPARSE_FLAG, "true").unwrap();
        assert!(graph.get_node(&id(1)).unwrap().unwrap().is_sparse());

        graph.truncate().unwrap();
        assert!(!graph.exists(&id(1)).unwrap());
    }

    #[test]
    fn test_heap_graph() {
        check_graph_contract(&HeapGraphDatabase::new());
    }

    #[test]
    fn test_sled_graph() {
        let temp_dir = TempDir::new().unwrap();
        let graph = SledGraphDatabase::open(&ConnectionManager::new(), &temp_dir.path().join("graph"), false).unwrap();
        check_graph_contract(&graph);
    }

    #[test]
    fn test_node_encoding() {
        let mut node = GraphNode::new(id(1));
        node.mapped_to = Some(id(2));
        node.parents = vec![id(3), id(4)];
        node.children = vec![id(5)];
        node.properties.insert("sparse".into(), "true".into());
        let decoded = GraphNode::decode(&node.encode()).unwrap();
        assert_eq!(decoded, node);
        assert!(GraphNode::decode(&[7]).is_err());
    }

    #[test]
    fn test_sled_graph_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("graph");
        let manager = ConnectionManager::new();
        {
            let graph = SledGraphDatabase::open(&manager, &path, false).unwrap();
            graph.put(&id(2), &[id(1)]).unwrap();
        }
        let graph = SledGraphDatabase::open(&manager, &path, true).unwrap();
        assert_eq!(graph.get_parents(&id(2)).unwrap(), vec![id(1)]);
        assert_eq!(graph.get_children(&id(1)).unwrap(), vec![id(2)]);
        assert!(graph.put(&id(3), &[id(2)]).is_err());
    }
}
