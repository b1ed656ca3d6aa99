//! Merge base search over the commit graph
//!
//! Both sides are walked breadth first through the graph database. Commits
//! reached from both sides are common ancestors; a common ancestor that is
//! itself an ancestor of another common ancestor is stale. The best common
//! ancestor is the first non-stale common ancestor in the order the left
//! side was walked.

use std::collections::{HashMap, HashSet, VecDeque};

use bitflags::bitflags;
use tracing::trace;

use crate::error::Result;
use crate::graph::GraphDatabase;
use crate::id::ObjectId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct VisitState: u8 {
        const SOURCE = 0b001;
        const TARGET = 0b010;
        const BOTH = Self::SOURCE.bits() | Self::TARGET.bits();
        const STALE = 0b100;
    }
}

/// Walk the ancestry of `start`, including `start`, in breadth first order
fn walk(graph: &dyn GraphDatabase, start: ObjectId) -> Result<Vec<ObjectId>> {
    let mut order = Vec::new();
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        order.push(id);
        for parent in graph.get_parents(&id)? {
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(order)
}

/// Best common ancestor of `left` and `right`, `None` for unrelated
/// histories
pub fn find_common_ancestor(
    graph: &dyn GraphDatabase,
    left: &ObjectId,
    right: &ObjectId,
) -> Result<Option<ObjectId>> {
    if left == right {
        return Ok(Some(*left));
    }
    let mut states: HashMap<ObjectId, VisitState> = HashMap::new();
    let left_order = walk(graph, *left)?;
    for id in &left_order {
        *states.entry(*id).or_insert(VisitState::empty()) |= VisitState::SOURCE;
    }
    for id in walk(graph, *right)? {
        *states.entry(id).or_insert(VisitState::empty()) |= VisitState::TARGET;
    }

    let common: Vec<ObjectId> = left_order
        .iter()
        .copied()
        .filter(|id| states.get(id).is_some_and(|s| s.contains(VisitState::BOTH)))
        .collect();

    // every ancestor of a common ancestor is common too, and redundant
    for id in &common {
        if states.get(id).is_some_and(|s| s.contains(VisitState::STALE)) {
            continue;
        }
        let mut queue: VecDeque<ObjectId> = graph.get_parents(id)?.into();
        while let Some(ancestor) = queue.pop_front() {
            let state = states.entry(ancestor).or_insert(VisitState::empty());
            if state.contains(VisitState::STALE) {
                continue;
            }
            *state |= VisitState::STALE;
            queue.extend(graph.get_parents(&ancestor)?);
        }
    }

    let best = common
        .into_iter()
        .find(|id| states.get(id).is_some_and(|s| !s.contains(VisitState::STALE)));
    trace!(left = %left, right = %right, best = ?best, "Common ancestor search");
    Ok(best)
}

/// Whether `ancestor` is reachable from `descendant` (or equal to it)
pub fn is_ancestor(graph: &dyn GraphDatabase, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    let mut seen = HashSet::from([*descendant]);
    let mut queue = VecDeque::from([*descendant]);
    while let Some(id) = queue.pop_front() {
        for parent in graph.get_parents(&id)? {
            if parent == *ancestor {
                return Ok(true);
            }
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}
