//! Undo the changes of existing commits with new commits

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::ops::require_clean;
use crate::ops::sequencer::{self, OperationKind, PausedOperation, SequenceOutcome, require_idle};
use crate::repository::Repository;
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Default)]
pub struct RevertOp {
    commits: Vec<ObjectId>,
}

impl RevertOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit to revert; commits are reverted in the order given
    pub fn commit(mut self, id: ObjectId) -> Self {
        self.commits.push(id);
        self
    }

    pub fn call(&self, repo: &Repository) -> Result<SequenceOutcome> {
        if self.commits.is_empty() {
            return Err(Error::InvalidArgument("no commits to revert".to_string()));
        }
        require_idle(repo)?;
        require_clean(repo, "revert")?;
        let Some(head) = repo.head_id()? else {
            return Err(Error::IllegalState("cannot revert on an empty branch".to_string()));
        };
        for id in &self.commits {
            let commit = repo.objects().get_commit(id)?;
            if commit.is_merge() {
                return Err(Error::InvalidArgument(format!(
                    "commit {} is a merge; reverting merges is not supported",
                    id.short()
                )));
            }
        }
        let op = PausedOperation::new(OperationKind::Revert, repo, head, self.commits.clone())?;
        sequencer::start(repo, op)
    }
}
