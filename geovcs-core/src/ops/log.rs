//! History traversal

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use crate::diff::TreeDiff;
use crate::error::Result;
use crate::id::ObjectId;
use crate::object::{RevCommit, RevTree};
use crate::repository::Repository;
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Default)]
pub struct LogOp {
    until: Option<ObjectId>,
    since: Option<ObjectId>,
    first_parent: bool,
    limit: Option<usize>,
    paths: Vec<String>,
}

impl LogOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest commit to list, HEAD when unset
    pub fn until(mut self, id: ObjectId) -> Self {
        self.until = Some(id);
        self
    }

    /// Stop at `id`: it and its ancestors are not listed
    pub fn since(mut self, id: ObjectId) -> Self {
        self.since = Some(id);
        self
    }

    /// Follow only first parents
    pub fn first_parent(mut self, first_parent: bool) -> Self {
        self.first_parent = first_parent;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Only list commits changing something under `path`
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Commits from newest to oldest by commit time
    pub fn call<'r>(&self, repo: &'r Repository) -> Result<LogIter<'r>> {
        let excluded = match &self.since {
            Some(since) => ancestry(repo, since)?,
            None => HashSet::new(),
        };
        let mut iter = LogIter {
            repo,
            queue: BinaryHeap::new(),
            seen: HashSet::new(),
            excluded,
            first_parent: self.first_parent,
            remaining: self.limit.unwrap_or(usize::MAX),
            paths: self.paths.clone(),
        };
        if let Some(start) = self.until.or(repo.head_id()?) {
            iter.push(start)?;
        }
        Ok(iter)
    }
}

/// `id` and everything reachable from it
fn ancestry(repo: &Repository, id: &ObjectId) -> Result<HashSet<ObjectId>> {
    let mut seen = HashSet::from([*id]);
    let mut queue = VecDeque::from([*id]);
    while let Some(next) = queue.pop_front() {
        for parent in repo.graph().get_parents(&next)? {
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(seen)
}

struct Queued(RevCommit);

impl Queued {
    fn key(&self) -> (i64, ObjectId) {
        (self.0.committer().timestamp, self.0.id())
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

pub struct LogIter<'r> {
    repo: &'r Repository,
    queue: BinaryHeap<Queued>,
    seen: HashSet<ObjectId>,
    excluded: HashSet<ObjectId>,
    first_parent: bool,
    remaining: usize,
    paths: Vec<String>,
}

impl LogIter<'_> {
    fn push(&mut self, id: ObjectId) -> Result<()> {
        if self.excluded.contains(&id) || !self.seen.insert(id) {
            return Ok(());
        }
        let commit = self.repo.objects().get_commit(&id)?;
        self.queue.push(Queued(commit));
        Ok(())
    }

    fn touches_paths(&self, commit: &RevCommit) -> Result<bool> {
        if self.paths.is_empty() {
            return Ok(true);
        }
        let parent_tree = match commit.first_parent() {
            Some(parent) => self.repo.commit_tree_id(&parent)?,
            None => RevTree::empty_id(),
        };
        let count = TreeDiff::new(self.repo.objects())
            .path_filters(self.paths.iter().cloned())
            .count(&parent_tree, &commit.tree_id())?;
        Ok(count.count() > 0)
    }

    fn advance(&mut self) -> Result<Option<RevCommit>> {
        while self.remaining > 0 {
            let Some(Queued(commit)) = self.queue.pop() else {
                return Ok(None);
            };
            let parents: Vec<ObjectId> = if self.first_parent {
                commit.first_parent().into_iter().collect()
            } else {
                commit.parents().to_vec()
            };
            for parent in parents {
                self.push(parent)?;
            }
            if self.touches_paths(&commit)? {
                self.remaining -= 1;
                return Ok(Some(commit));
            }
        }
        Ok(None)
    }
}

impl Iterator for LogIter<'_> {
    type Item = Result<RevCommit>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}
