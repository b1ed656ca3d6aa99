//! Working tree and staging area
//!
//! Both are root tree ids kept in refs (`WORK_HEAD`, `STAGE_HEAD`). An
//! unset ref reads as the HEAD commit's tree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::diff::{DiffEntry, DiffObjectCount, TreeDiff};
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::object::{Envelope, Node, RevFeature, RevFeatureType, RevObject};
use crate::progress::ProgressListener;
use crate::refs::{STAGE_HEAD, WORK_HEAD};
use crate::repository::Repository;
use crate::storage::{NoopListener, ObjectStore};
use crate::tree::{NodeRef, TreeEditor, find_node, node_name};

/// Features written to the object store per batch during inserts
const INSERT_BATCH_SIZE: usize = 1000;

/// A feature to insert and where it goes
#[derive(Debug, Clone)]
pub struct FeatureInfo {
    pub path: String,
    pub feature: RevFeature,
    /// Feature type, when it differs from the parent tree's default
    pub feature_type_id: Option<ObjectId>,
    pub bounds: Option<Envelope>,
}

impl FeatureInfo {
    pub fn new(path: impl Into<String>, feature: RevFeature) -> Self {
        Self {
            path: path.into(),
            feature,
            feature_type_id: None,
            bounds: None,
        }
    }

    pub fn with_feature_type(mut self, feature_type_id: ObjectId) -> Self {
        self.feature_type_id = Some(feature_type_id);
        self
    }

    pub fn with_bounds(mut self, bounds: Envelope) -> Self {
        self.bounds = Some(bounds);
        self
    }

    fn node(&self) -> Node {
        Node::feature(
            node_name(&self.path),
            self.feature.id(),
            self.feature_type_id,
            self.bounds,
        )
    }
}

// ==================== Working tree ====================

pub struct WorkingTree<'r> {
    repo: &'r Repository,
}

impl<'r> WorkingTree<'r> {
    pub(crate) fn new(repo: &'r Repository) -> Self {
        Self { repo }
    }

    /// Root tree of the working tree
    pub fn tree_id(&self) -> Result<ObjectId> {
        match self.repo.refs().resolve_id(WORK_HEAD)? {
            Some(id) => Ok(id),
            None => self.repo.head_tree_id(),
        }
    }

    pub fn update_work_head(&self, tree_id: &ObjectId) -> Result<()> {
        self.repo.refs().put_ref(WORK_HEAD, tree_id)
    }

    pub fn find(&self, path: &str) -> Result<Option<NodeRef>> {
        find_node(self.repo.objects(), &self.tree_id()?, path)
    }

    /// Create a tree at `path` whose features default to `feature_type`
    pub fn create_tree(&self, path: &str, feature_type: &RevFeatureType) -> Result<ObjectId> {
        let store = self.repo.objects();
        store.put(&RevObject::from(feature_type.clone()))?;
        let mut editor = TreeEditor::new(store);
        editor.ensure_tree(path, Some(feature_type.id()));
        self.apply(&editor)
    }

    /// Insert a single feature
    pub fn insert_feature(&self, info: FeatureInfo) -> Result<ObjectId> {
        let store = self.repo.objects();
        store.put(&RevObject::from(info.feature.clone()))?;
        let mut editor = TreeEditor::new(store);
        editor.put(&info.path, info.node());
        self.apply(&editor)
    }

    /// Stream `features` into the working tree and return the new root id
    ///
    /// The input is drained on a producer thread into a bounded queue; the
    /// calling thread stores features in batches and builds the trees.
    /// Canceling `listener` stops both sides and leaves the working tree
    /// untouched. Must not be called from inside an async runtime.
    pub fn insert<I>(&self, features: I, listener: &dyn ProgressListener) -> Result<ObjectId>
    where
        I: IntoIterator<Item = FeatureInfo>,
        I::IntoIter: Send,
    {
        let store = self.repo.objects();
        let root = self.tree_id()?;
        let capacity = self.repo.config().insert_queue_capacity.max(1);
        let (sender, mut receiver) = mpsc::channel::<FeatureInfo>(capacity);
        let canceled = AtomicBool::new(false);
        let canceled = &canceled;
        let features = features.into_iter();
        let start = Instant::now();

        listener.started();
        let result = std::thread::scope(|scope| {
            let producer = scope.spawn(move || {
                for info in features {
                    if canceled.load(Ordering::Relaxed) || listener.is_canceled() {
                        break;
                    }
                    // fails once the consumer is gone
                    if sender.blocking_send(info).is_err() {
                        break;
                    }
                }
            });

            let mut consume = move || -> Result<(ObjectId, usize)> {
                let mut editor = TreeEditor::new(store);
                let mut batch: Vec<RevObject> = Vec::with_capacity(INSERT_BATCH_SIZE);
                let mut count = 0usize;
                while let Some(info) = receiver.blocking_recv() {
                    if listener.is_canceled() {
                        canceled.store(true, Ordering::Relaxed);
                        return Err(Error::Canceled);
                    }
                    editor.put(&info.path, info.node());
                    batch.push(RevObject::from(info.feature));
                    if batch.len() >= INSERT_BATCH_SIZE {
                        store.put_all(&mut batch.drain(..), &NoopListener)?;
                    }
                    count += 1;
                    if count % INSERT_BATCH_SIZE == 0 {
                        listener.set_progress(count as f32);
                    }
                }
                if listener.is_canceled() {
                    return Err(Error::Canceled);
                }
                store.put_all(&mut batch.drain(..), &NoopListener)?;
                Ok((editor.apply(&root)?, count))
            };
            let result = consume();
            if result.is_err() {
                canceled.store(true, Ordering::Relaxed);
            }
            producer
                .join()
                .map_err(|_| Error::IllegalState("feature producer panicked".to_string()))?;
            result
        });

        let (new_root, count) = result?;
        self.update_work_head(&new_root)?;
        listener.complete();
        info!(
            features = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Inserted features into working tree"
        );
        Ok(new_root)
    }

    /// Delete the entry at `path` with everything under it, returning
    /// whether it existed
    pub fn delete(&self, path: &str) -> Result<bool> {
        if self.find(path)?.is_none() {
            return Ok(false);
        }
        let mut editor = TreeEditor::new(self.repo.objects());
        editor.remove(path);
        self.apply(&editor)?;
        Ok(true)
    }

    pub fn delete_all<S: AsRef<str>>(&self, paths: &[S]) -> Result<ObjectId> {
        let mut editor = TreeEditor::new(self.repo.objects());
        for path in paths {
            editor.remove(path.as_ref());
        }
        self.apply(&editor)
    }

    /// Changes from the index to the working tree, changed trees included
    pub fn unstaged(&self, path_filter: Option<&str>) -> Result<Vec<DiffEntry>> {
        let staged = self.repo.staging_area().tree_id()?;
        diff_with_filter(self.repo, path_filter)
            .report_trees(true)
            .entries(&staged, &self.tree_id()?)
    }

    pub fn count_unstaged(&self, path_filter: Option<&str>) -> Result<DiffObjectCount> {
        let staged = self.repo.staging_area().tree_id()?;
        diff_with_filter(self.repo, path_filter).count(&staged, &self.tree_id()?)
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.tree_id()? == self.repo.staging_area().tree_id()?)
    }

    fn apply(&self, editor: &TreeEditor<'_>) -> Result<ObjectId> {
        let new_root = editor.apply(&self.tree_id()?)?;
        self.update_work_head(&new_root)?;
        Ok(new_root)
    }
}

// ==================== Staging area ====================

pub struct StagingArea<'r> {
    repo: &'r Repository,
}

impl<'r> StagingArea<'r> {
    pub(crate) fn new(repo: &'r Repository) -> Self {
        Self { repo }
    }

    /// Root tree of the index
    pub fn tree_id(&self) -> Result<ObjectId> {
        match self.repo.refs().resolve_id(STAGE_HEAD)? {
            Some(id) => Ok(id),
            None => self.repo.head_tree_id(),
        }
    }

    pub fn update_stage_head(&self, tree_id: &ObjectId) -> Result<()> {
        self.repo.refs().put_ref(STAGE_HEAD, tree_id)
    }

    pub fn find(&self, path: &str) -> Result<Option<NodeRef>> {
        find_node(self.repo.objects(), &self.tree_id()?, path)
    }

    /// Apply diff entries to the index and clear the conflicts at their
    /// paths; returns the new index root
    pub fn stage<I>(&self, entries: I) -> Result<ObjectId>
    where
        I: IntoIterator<Item = DiffEntry>,
    {
        let mut editor = TreeEditor::new(self.repo.objects());
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.path();
            match entry.new_ref() {
                None => {
                    editor.remove(&path);
                }
                Some(new) if new.is_tree() => {
                    editor.ensure_tree(&path, new.node().metadata_id());
                }
                Some(new) => {
                    editor.put(&path, new.node().clone());
                }
            }
            paths.push(path);
        }
        let new_root = editor.apply(&self.tree_id()?)?;
        self.update_stage_head(&new_root)?;
        if !paths.is_empty() {
            self.repo.conflicts().remove_conflicts(None, &paths)?;
        }
        debug!(entries = paths.len(), root = %new_root, "Staged changes");
        Ok(new_root)
    }

    /// Changes from HEAD to the index, changed trees included
    pub fn staged(&self, path_filter: Option<&str>) -> Result<Vec<DiffEntry>> {
        let head = self.repo.head_tree_id()?;
        diff_with_filter(self.repo, path_filter)
            .report_trees(true)
            .entries(&head, &self.tree_id()?)
    }

    pub fn count_staged(&self, path_filter: Option<&str>) -> Result<DiffObjectCount> {
        let head = self.repo.head_tree_id()?;
        diff_with_filter(self.repo, path_filter).count(&head, &self.tree_id()?)
    }

    pub fn count_conflicted(&self, path_filter: Option<&str>) -> Result<usize> {
        self.repo.conflicts().get_count_by_prefix(None, path_filter)
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.tree_id()? == self.repo.head_tree_id()?)
    }
}

fn diff_with_filter<'a>(repo: &'a Repository, path_filter: Option<&str>) -> TreeDiff<'a> {
    let diff = TreeDiff::new(repo.objects());
    match path_filter {
        Some(path) => diff.path_filter(path),
        None => diff,
    }
}
