//! Switch branches, or restore working tree paths

use tracing::info;

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::ops::{clear_merge_state, reset_trees};
use crate::refs::{self, CHERRY_PICK_HEAD, HEAD, MERGE_HEAD};
use crate::repository::Repository;
use crate::tree::{TreeEditor, find_node};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutResult {
    /// Commit HEAD points at afterwards
    pub head: Option<ObjectId>,
    /// Checked out branch, `None` when HEAD is detached or only paths were
    /// restored
    pub branch: Option<String>,
    /// Restored paths
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutOp {
    target: Option<String>,
    paths: Vec<String>,
    force: bool,
    ours: bool,
    theirs: bool,
}

impl CheckoutOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Branch name or revision to switch to; with paths, the commit to
    /// restore them from
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Discard local changes and conflicts when switching
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Restore conflicted paths to our version
    pub fn ours(mut self, ours: bool) -> Self {
        self.ours = ours;
        self
    }

    /// Restore conflicted paths to the version being merged in
    pub fn theirs(mut self, theirs: bool) -> Self {
        self.theirs = theirs;
        self
    }

    pub fn call(&self, repo: &Repository) -> Result<CheckoutResult> {
        if self.ours && self.theirs {
            return Err(Error::InvalidArgument(
                "ours and theirs are mutually exclusive".to_string(),
            ));
        }
        if !self.paths.is_empty() {
            return self.checkout_paths(repo);
        }
        if self.ours || self.theirs {
            return Err(Error::InvalidArgument(
                "ours and theirs need paths to restore".to_string(),
            ));
        }
        let Some(target) = &self.target else {
            return Err(Error::InvalidArgument("nothing to check out".to_string()));
        };
        self.switch(repo, target)
    }

    fn switch(&self, repo: &Repository, target: &str) -> Result<CheckoutResult> {
        if !self.force {
            if repo.has_conflicts()? {
                return Err(Error::IllegalState(
                    "cannot check out with unresolved conflicts".to_string(),
                ));
            }
            if !repo.is_clean()? {
                return Err(Error::IllegalState(
                    "local changes would be overwritten by checkout".to_string(),
                ));
            }
        }

        let branch_name = refs::branch_ref(target);
        let branch = repo.refs().get_ref(&branch_name)?;
        let commit_id = match &branch {
            Some(b) => b.object_id(),
            None => repo.resolve_commit(target)?.id(),
        };
        let tree = repo.commit_tree_id(&commit_id)?;

        reset_trees(repo, &tree)?;
        if self.force {
            repo.conflicts().remove_all(None)?;
            clear_merge_state(repo)?;
        }
        match &branch {
            Some(_) => repo.refs().put_symref(HEAD, &branch_name)?,
            None => repo.refs().put_ref(HEAD, &commit_id)?,
        }
        info!(target, commit = %commit_id, detached = branch.is_none(), "Checked out");
        Ok(CheckoutResult {
            head: Some(commit_id).filter(|id| !id.is_null()),
            branch: branch.map(|_| branch_name),
            paths: Vec::new(),
        })
    }

    /// Copy paths into the working tree from the index, a commit, or one
    /// side of a conflict
    fn checkout_paths(&self, repo: &Repository) -> Result<CheckoutResult> {
        let source = if self.ours || self.theirs {
            for path in &self.paths {
                if repo.conflicts().get_conflict(None, path)?.is_none() {
                    return Err(Error::IllegalState(format!("path {} is not conflicted", path)));
                }
            }
            if self.ours {
                repo.head_tree_id()?
            } else {
                let theirs = match repo.refs().resolve_id(MERGE_HEAD)? {
                    Some(id) => Some(id),
                    None => repo.refs().resolve_id(CHERRY_PICK_HEAD)?,
                };
                match theirs {
                    Some(id) => repo.commit_tree_id(&id)?,
                    None => {
                        return Err(Error::IllegalState(
                            "no merge or cherry-pick in progress".to_string(),
                        ));
                    }
                }
            }
        } else {
            match &self.target {
                Some(target) => repo.commit_tree_id(&repo.resolve_commit(target)?.id())?,
                None => repo.staging_area().tree_id()?,
            }
        };

        let store = repo.objects();
        let mut editor = TreeEditor::new(store);
        for path in &self.paths {
            match find_node(store, &source, path)? {
                Some(node) => {
                    editor.put(path, node.node().clone());
                }
                // a conflict side may have deleted the feature
                None if self.ours || self.theirs => {
                    editor.remove(path);
                }
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "pathspec '{}' did not match any feature or tree",
                        path
                    )));
                }
            }
        }
        let work = repo.working_tree();
        work.update_work_head(&editor.apply(&work.tree_id()?)?)?;
        Ok(CheckoutResult {
            head: repo.head_id()?,
            branch: None,
            paths: self.paths.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflicts::Conflict;
    use crate::ops::test_util::{commit_all, create_branch, feature, insert, repo};

    #[test]
    fn test_switch_branches() {
        let repo = repo();
        let c1 = commit_all(&repo, "l/a", &feature(1), "first");
        create_branch(&repo, "topic");
        let result = CheckoutOp::new().target("topic").call(&repo).unwrap();
        assert_eq!(result.branch.as_deref(), Some("refs/heads/topic"));
        assert_eq!(result.head, Some(c1));

        let c2 = commit_all(&repo, "l/b", &feature(2), "on topic");
        CheckoutOp::new().target("master").call(&repo).unwrap();
        assert_eq!(repo.head_id().unwrap(), Some(c1));
        assert!(repo.working_tree().find("l/b").unwrap().is_none());
        assert_eq!(repo.refs().resolve_id("refs/heads/topic").unwrap(), Some(c2));
    }

    #[test]
    fn test_detached_checkout() {
        let repo = repo();
        let c1 = commit_all(&repo, "l/a", &feature(1), "first");
        commit_all(&repo, "l/b", &feature(2), "second");
        let result = CheckoutOp::new().target(c1.to_hex()).call(&repo).unwrap();
        assert!(result.branch.is_none());
        assert!(repo.current_branch().unwrap().is_none());
        assert_eq!(repo.head_id().unwrap(), Some(c1));
        assert!(repo.is_clean().unwrap());
    }

    #[test]
    fn test_refuses_dirty_tree_unless_forced() {
        let repo = repo();
        commit_all(&repo, "l/a", &feature(1), "first");
        create_branch(&repo, "topic");
        insert(&repo, "l/dirty", &feature(9));
        assert!(matches!(
            CheckoutOp::new().target("topic").call(&repo),
            Err(Error::IllegalState(_))
        ));
        CheckoutOp::new().target("topic").force(true).call(&repo).unwrap();
        assert!(repo.working_tree().find("l/dirty").unwrap().is_none());
    }

    #[test]
    fn test_restore_path() {
        let repo = repo();
        let c1 = commit_all(&repo, "l/a", &feature(1), "first");
        commit_all(&repo, "l/a", &feature(2), "second");
        insert(&repo, "l/a", &feature(3));

        CheckoutOp::new().path("l/a").call(&repo).unwrap();
        assert_eq!(repo.working_tree().find("l/a").unwrap().unwrap().object_id(), feature(2).id());

        CheckoutOp::new().target(c1.to_hex()).path("l/a").call(&repo).unwrap();
        assert_eq!(repo.working_tree().find("l/a").unwrap().unwrap().object_id(), feature(1).id());
        assert_eq!(repo.head_id().unwrap(), repo.resolve("master").unwrap());
        assert!(CheckoutOp::new().path("l/none").call(&repo).is_err());
    }

    #[test]
    fn test_ours_theirs() {
        let repo = repo();
        let c1 = commit_all(&repo, "l/a", &feature(1), "first");
        let c2 = commit_all(&repo, "l/a", &feature(2), "theirs");
        crate::ops::ResetOp::new()
            .commit(c1)
            .mode(crate::ops::ResetMode::Hard)
            .call(&repo)
            .unwrap();
        repo.refs().put_ref(MERGE_HEAD, &c2).unwrap();
        repo.conflicts()
            .add_conflict(None, Conflict::new("l/a", feature(1).id(), feature(1).id(), feature(2).id()))
            .unwrap();

        assert!(matches!(
            CheckoutOp::new().path("l/b").ours(true).call(&repo),
            Err(Error::IllegalState(_))
        ));
        CheckoutOp::new().path("l/a").theirs(true).call(&repo).unwrap();
        assert_eq!(repo.working_tree().find("l/a").unwrap().unwrap().object_id(), feature(2).id());
        CheckoutOp::new().path("l/a").ours(true).call(&repo).unwrap();
        assert_eq!(repo.working_tree().find("l/a").unwrap().unwrap().object_id(), feature(1).id());
        // still conflicted until added
        assert!(repo.has_conflicts().unwrap());
    }
}
