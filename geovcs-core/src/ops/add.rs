//! Stage working tree changes, or remove paths from both trees

use tracing::debug;

use crate::diff::{ChangeType, DiffEntry};
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::repository::Repository;
use crate::tree::TreeEditor;

/// Copy working tree changes into the index and mark the staged paths as
/// resolved
#[derive(Debug, Clone, Default)]
pub struct AddOp {
    paths: Vec<String>,
    update_only: bool,
}

impl AddOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only stage changes under `path`; may be given several times
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Skip entries that are not in the index yet
    pub fn update_only(mut self, update_only: bool) -> Self {
        self.update_only = update_only;
        self
    }

    /// Returns the new index root
    pub fn call(&self, repo: &Repository) -> Result<ObjectId> {
        let mut entries = Vec::new();
        if self.paths.is_empty() {
            entries = repo.working_tree().unstaged(None)?;
        } else {
            for path in &self.paths {
                entries.extend(repo.working_tree().unstaged(Some(path.as_str()))?);
            }
        }
        if self.update_only {
            entries.retain(|e: &DiffEntry| e.change_type() != ChangeType::Added);
        }
        let count = entries.len();
        let root = repo.staging_area().stage(entries)?;

        // adding a path also resolves conflicts whose working tree version
        // already matched the index
        if self.paths.is_empty() {
            repo.conflicts().remove_all(None)?;
        } else {
            for path in &self.paths {
                repo.conflicts().remove_by_prefix(None, Some(path.as_str()))?;
            }
        }
        debug!(entries = count, root = %root, "Added changes to the index");
        Ok(root)
    }
}

/// Delete paths from the working tree and the index
#[derive(Debug, Clone, Default)]
pub struct RemoveOp {
    paths: Vec<String>,
    recursive: bool,
}

impl RemoveOp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Allow removing whole trees
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Returns the new index root
    pub fn call(&self, repo: &Repository) -> Result<ObjectId> {
        if self.paths.is_empty() {
            return Err(Error::InvalidArgument("no paths to remove".to_string()));
        }
        let work = repo.working_tree();
        let index = repo.staging_area();
        for path in &self.paths {
            let node = match work.find(path)? {
                Some(node) => Some(node),
                None => index.find(path)?,
            };
            match node {
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "pathspec '{}' did not match any feature or tree",
                        path
                    )));
                }
                Some(node) if node.is_tree() && !self.recursive => {
                    return Err(Error::InvalidArgument(format!(
                        "not removing tree '{}' without recursive",
                        path
                    )));
                }
                Some(_) => {}
            }
        }

        let store = repo.objects();
        let mut editor = TreeEditor::new(store);
        for path in &self.paths {
            editor.remove(path);
        }
        work.update_work_head(&editor.apply(&work.tree_id()?)?)?;
        let root = editor.apply(&index.tree_id()?)?;
        index.update_stage_head(&root)?;
        for path in &self.paths {
            repo.conflicts().remove_by_prefix(None, Some(path.as_str()))?;
        }
        debug!(paths = self.paths.len(), "Removed paths");
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflicts::Conflict;
    use crate::ops::test_util::{commit_all, feature, insert, repo};

    #[test]
    fn test_add_all() {
        let repo = repo();
        insert(&repo, "roads/r1", &feature(1));
        insert(&repo, "points/p1", &feature(2));
        let root = AddOp::new().call(&repo).unwrap();
        assert_eq!(root, repo.working_tree().tree_id().unwrap());
        assert_eq!(repo.staging_area().count_staged(None).unwrap().features_count(), 2);
    }

    #[test]
    fn test_add_path() {
        let repo = repo();
        insert(&repo, "roads/r1", &feature(1));
        insert(&repo, "points/p1", &feature(2));
        AddOp::new().path("roads").call(&repo).unwrap();
        let index = repo.staging_area();
        assert!(index.find("roads/r1").unwrap().is_some());
        assert!(index.find("points/p1").unwrap().is_none());
        assert_eq!(repo.working_tree().count_unstaged(None).unwrap().features_count(), 1);
    }

    #[test]
    fn test_update_only() {
        let repo = repo();
        commit_all(&repo, "roads/r1", &feature(1), "first");
        insert(&repo, "roads/r1", &feature(10));
        insert(&repo, "roads/r2", &feature(2));
        AddOp::new().update_only(true).call(&repo).unwrap();
        let index = repo.staging_area();
        assert_eq!(index.find("roads/r1").unwrap().unwrap().object_id(), feature(10).id());
        assert!(index.find("roads/r2").unwrap().is_none());
    }

    #[test]
    fn test_add_resolves_conflicts() {
        let repo = repo();
        commit_all(&repo, "roads/r1", &feature(1), "first");
        let conflict = Conflict::new("roads/r1", feature(1).id(), feature(1).id(), feature(3).id());
        repo.conflicts().add_conflict(None, conflict).unwrap();
        // the working tree keeps ours, so nothing is staged
        AddOp::new().path("roads/r1").call(&repo).unwrap();
        assert!(!repo.has_conflicts().unwrap());
    }

    #[test]
    fn test_remove() {
        let repo = repo();
        commit_all(&repo, "roads/r1", &feature(1), "first");
        commit_all(&repo, "roads/r2", &feature(2), "second");

        RemoveOp::new().path("roads/r1").call(&repo).unwrap();
        assert!(repo.working_tree().find("roads/r1").unwrap().is_none());
        assert!(repo.staging_area().find("roads/r1").unwrap().is_none());
        assert!(repo.staging_area().find("roads/r2").unwrap().is_some());

        assert!(matches!(
            RemoveOp::new().path("roads").call(&repo),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            RemoveOp::new().path("nope").call(&repo),
            Err(Error::InvalidArgument(_))
        ));
        RemoveOp::new().path("roads").recursive(true).call(&repo).unwrap();
        assert!(repo.staging_area().find("roads").unwrap().is_none());
        assert!(repo.working_tree().is_clean().unwrap());
    }
}
