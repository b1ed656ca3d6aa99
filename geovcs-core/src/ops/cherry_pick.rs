//! Apply the change introduced by one commit on top of HEAD

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::ops::require_clean;
use crate::ops::sequencer::{self, OperationKind, PausedOperation, SequenceOutcome, require_idle};
use crate::repository::Repository;
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
pub struct CherryPickOp {
    commit: ObjectId,
}

impl CherryPickOp {
    pub fn new(commit: ObjectId) -> Self {
        Self { commit }
    }

    /// Commits the change with the picked commit's author and message. On
    /// conflicts the sequence pauses with `CHERRY_PICK_HEAD` set.
    pub fn call(&self, repo: &Repository) -> Result<SequenceOutcome> {
        require_idle(repo)?;
        require_clean(repo, "cherry-pick")?;
        let Some(head) = repo.head_id()? else {
            return Err(Error::IllegalState("cannot cherry-pick onto an empty branch".to_string()));
        };
        let commit = repo.objects().get_commit(&self.commit)?;
        if commit.is_merge() {
            return Err(Error::InvalidArgument(format!(
                "commit {} is a merge; cherry-picking merges is not supported",
                commit.id().short()
            )));
        }
        let op = PausedOperation::new(OperationKind::CherryPick, repo, head, vec![self.commit])?;
        sequencer::start(repo, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_util::{checkout, commit_all, create_branch, feature, repo};
    use crate::refs::CHERRY_PICK_HEAD;

    #[test]
    fn test_cherry_pick() {
        let repo = repo();
        commit_all(&repo, "l/base", &feature(0), "base");
        create_branch(&repo, "topic");
        checkout(&repo, "topic");
        commit_all(&repo, "l/skip", &feature(1), "not picked");
        let picked = commit_all(&repo, "l/pick", &feature(2), "picked");
        checkout(&repo, "master");
        let master = commit_all(&repo, "l/main", &feature(3), "main");

        let outcome = CherryPickOp::new(picked).call(&repo).unwrap();
        let SequenceOutcome::Completed(head) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        let commit = repo.objects().get_commit(&head).unwrap();
        assert_eq!(commit.parents(), &[master]);
        assert_eq!(commit.message(), "picked");
        let original = repo.objects().get_commit(&picked).unwrap();
        assert_eq!(commit.author(), original.author());

        let work = repo.working_tree();
        assert!(work.find("l/pick").unwrap().is_some());
        assert!(work.find("l/skip").unwrap().is_none());
        assert!(repo.graph().get_mapping(&head).unwrap().is_none());
        assert!(repo.is_clean().unwrap());
    }

    #[test]
    fn test_conflict_and_abort() {
        let repo = repo();
        commit_all(&repo, "l/a", &feature(0), "base");
        create_branch(&repo, "topic");
        checkout(&repo, "topic");
        let picked = commit_all(&repo, "l/a", &feature(1), "theirs");
        checkout(&repo, "master");
        let master = commit_all(&repo, "l/a", &feature(2), "ours");

        let outcome = CherryPickOp::new(picked).call(&repo).unwrap();
        assert!(matches!(outcome, SequenceOutcome::Paused { commit, .. } if commit == picked));
        assert_eq!(repo.refs().resolve_id(CHERRY_PICK_HEAD).unwrap(), Some(picked));
        assert!(repo.has_conflicts().unwrap());

        sequencer::abort(&repo).unwrap();
        assert_eq!(repo.head_id().unwrap(), Some(master));
        assert!(!repo.has_conflicts().unwrap());
        assert!(repo.refs().resolve_id(CHERRY_PICK_HEAD).unwrap().is_none());
        assert!(repo.is_clean().unwrap());
    }

    #[test]
    fn test_already_applied_change() {
        let repo = repo();
        commit_all(&repo, "l/a", &feature(0), "base");
        let picked = commit_all(&repo, "l/b", &feature(1), "add b");
        let outcome = CherryPickOp::new(picked).call(&repo).unwrap();
        assert_eq!(outcome, SequenceOutcome::Completed(picked));
        assert_eq!(repo.head_id().unwrap(), Some(picked));
    }
}
