//! Move HEAD, and optionally the index and working tree, to a commit

use tracing::info;

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::ops::{clear_merge_state, reset_trees};
use crate::refs::{MERGE_HEAD, ORIG_HEAD};
use crate::repository::Repository;
use crate::tree::{TreeEditor, find_node};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetMode {
    /// Move HEAD only
    Soft,
    /// Move HEAD and the index
    #[default]
    Mixed,
    /// Move HEAD, the index and the working tree, dropping conflicts
    Hard,
}

#[derive(Debug, Clone, Default)]
pub struct ResetOp {
    commit: Option<ObjectId>,
    mode: ResetMode,
    paths: Vec<String>,
}

impl ResetOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target commit, HEAD when unset
    pub fn commit(mut self, id: ObjectId) -> Self {
        self.commit = Some(id);
        self
    }

    pub fn mode(mut self, mode: ResetMode) -> Self {
        self.mode = mode;
        self
    }

    /// Reset only these index paths to the target commit, leaving HEAD
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn call(&self, repo: &Repository) -> Result<()> {
        let head = repo.head_id()?;
        let target = match self.commit.or(head) {
            Some(id) => id,
            None => {
                return Err(Error::IllegalState(
                    "cannot reset a branch without commits".to_string(),
                ));
            }
        };
        let target_tree = repo.commit_tree_id(&target)?;

        if !self.paths.is_empty() {
            if self.mode != ResetMode::Mixed {
                return Err(Error::InvalidArgument(
                    "path reset only updates the index".to_string(),
                ));
            }
            return self.reset_paths(repo, &target_tree);
        }

        if self.mode == ResetMode::Soft && repo.refs().get_raw(MERGE_HEAD)?.is_some() {
            return Err(Error::IllegalState(
                "cannot do a soft reset in the middle of a merge".to_string(),
            ));
        }

        if let Some(head) = head {
            repo.refs().put_ref(ORIG_HEAD, &head)?;
        }
        match self.mode {
            ResetMode::Soft => {}
            ResetMode::Mixed => repo.staging_area().update_stage_head(&target_tree)?,
            ResetMode::Hard => {
                reset_trees(repo, &target_tree)?;
                repo.conflicts().remove_all(None)?;
                clear_merge_state(repo)?;
            }
        }
        repo.update_head(&target)?;
        info!(target = %target, mode = ?self.mode, "Reset");
        Ok(())
    }

    fn reset_paths(&self, repo: &Repository, target_tree: &ObjectId) -> Result<()> {
        let store = repo.objects();
        let mut editor = TreeEditor::new(store);
        for path in &self.paths {
            match find_node(store, target_tree, path)? {
                Some(node) => {
                    editor.put(path, node.node().clone());
                }
                None => {
                    editor.remove(path);
                }
            }
        }
        let index = repo.staging_area();
        let root = editor.apply(&index.tree_id()?)?;
        index.update_stage_head(&root)?;
        for path in &self.paths {
            repo.conflicts().remove_by_prefix(None, Some(path.as_str()))?;
        }
        Ok(())
    }
}
