//! Replay the commits of the current branch on top of another commit

use std::collections::{HashSet, VecDeque};

use tracing::info;

use crate::ancestor::is_ancestor;
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::ops::sequencer::{self, OperationKind, PausedOperation, SequenceOutcome, require_idle};
use crate::ops::{require_clean, reset_trees};
use crate::refs::ORIG_HEAD;
use crate::repository::Repository;
use crate::storage::ObjectStore;

/// Start a rebase; continue, skip and abort go through [`sequencer`]
#[derive(Debug, Clone)]
pub struct RebaseOp {
    upstream: ObjectId,
    onto: Option<ObjectId>,
}

impl RebaseOp {
    /// Rebase the commits of HEAD that `upstream` does not have
    pub fn new(upstream: ObjectId) -> Self {
        Self { upstream, onto: None }
    }

    /// Replay on `onto` instead of `upstream`
    pub fn onto(mut self, onto: ObjectId) -> Self {
        self.onto = Some(onto);
        self
    }

    pub fn call(&self, repo: &Repository) -> Result<SequenceOutcome> {
        require_idle(repo)?;
        require_clean(repo, "rebase")?;
        let Some(head) = repo.head_id()? else {
            return Err(Error::IllegalState("cannot rebase a branch without commits".to_string()));
        };
        repo.objects().get_commit(&self.upstream)?;
        let onto = self.onto.unwrap_or(self.upstream);
        let graph = repo.graph();

        if onto == self.upstream && is_ancestor(graph, &self.upstream, &head)? {
            return Ok(SequenceOutcome::UpToDate);
        }
        if onto == self.upstream && is_ancestor(graph, &head, &self.upstream)? {
            repo.refs().put_ref(ORIG_HEAD, &head)?;
            reset_trees(repo, &repo.commit_tree_id(&onto)?)?;
            repo.update_head(&onto)?;
            info!(onto = %onto, "Rebase fast-forwarded");
            return Ok(SequenceOutcome::FastForward(onto));
        }

        let queue = self.commits_to_replay(repo, head)?;
        repo.refs().put_ref(ORIG_HEAD, &head)?;
        let mut op = PausedOperation::new(OperationKind::Rebase, repo, head, queue)?;
        op.head = onto;
        reset_trees(repo, &repo.commit_tree_id(&onto)?)?;
        repo.update_head(&onto)?;
        sequencer::start(repo, op)
    }

    /// First-parent commits of `head` missing from `upstream`, oldest
    /// first; merge commits are dropped
    fn commits_to_replay(&self, repo: &Repository, head: ObjectId) -> Result<Vec<ObjectId>> {
        let graph = repo.graph();
        let mut upstream_history = HashSet::from([self.upstream]);
        let mut queue = VecDeque::from([self.upstream]);
        while let Some(id) = queue.pop_front() {
            for parent in graph.get_parents(&id)? {
                if upstream_history.insert(parent) {
                    queue.push_back(parent);
                }
            }
        }

        let mut commits = Vec::new();
        let mut current = Some(head);
        while let Some(id) = current {
            if upstream_history.contains(&id) {
                break;
            }
            let parents = graph.get_parents(&id)?;
            if parents.len() < 2 {
                commits.push(id);
            }
            current = parents.first().copied();
        }
        commits.reverse();
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_util::{checkout, commit_all, create_branch, feature, insert, repo};
    use crate::ops::{AddOp, LogOp};

    fn messages(repo: &Repository) -> Vec<String> {
        LogOp::new()
            .call(repo)
            .unwrap()
            .map(|c| c.unwrap().message().to_string())
            .collect()
    }

    #[test]
    fn test_clean_rebase() {
        let repo = repo();
        commit_all(&repo, "l/base", &feature(0), "base");
        create_branch(&repo, "topic");
        let upstream = commit_all(&repo, "l/up", &feature(1), "upstream");
        checkout(&repo, "topic");
        let t1 = commit_all(&repo, "l/t1", &feature(2), "t1");
        commit_all(&repo, "l/t2", &feature(3), "t2");

        let outcome = RebaseOp::new(upstream).call(&repo).unwrap();
        let SequenceOutcome::Completed(head) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(repo.head_id().unwrap(), Some(head));
        assert_eq!(repo.current_branch().unwrap().as_deref(), Some("refs/heads/topic"));
        assert_eq!(messages(&repo), vec!["t2", "t1", "upstream", "base"]);
        for path in ["l/up", "l/t1", "l/t2"] {
            assert!(repo.working_tree().find(path).unwrap().is_some(), "{}", path);
        }
        assert!(repo.is_clean().unwrap());
        assert!(PausedOperation::load(&repo).unwrap().is_none());

        let replayed_t1 = repo.head_commit().unwrap().unwrap().first_parent().unwrap();
        assert_eq!(repo.graph().get_mapping(&replayed_t1).unwrap(), Some(t1));
    }

    #[test]
    fn test_up_to_date_and_fast_forward() {
        let repo = repo();
        let base = commit_all(&repo, "l/base", &feature(0), "base");
        let tip = commit_all(&repo, "l/a", &feature(1), "a");
        assert_eq!(RebaseOp::new(base).call(&repo).unwrap(), SequenceOutcome::UpToDate);

        crate::ops::branch::create(&repo, "old", Some("HEAD~1"), false).unwrap();
        checkout(&repo, "old");
        assert_eq!(RebaseOp::new(tip).call(&repo).unwrap(), SequenceOutcome::FastForward(tip));
        assert_eq!(repo.head_id().unwrap(), Some(tip));
    }

    #[test]
    fn test_pause_resume() {
        let repo = repo();
        commit_all(&repo, "l/f", &feature(0), "base");
        create_branch(&repo, "topic");
        let upstream = commit_all(&repo, "l/f", &feature(1), "upstream");
        checkout(&repo, "topic");
        commit_all(&repo, "l/f", &feature(2), "conflicting");
        commit_all(&repo, "l/g", &feature(3), "clean");

        let outcome = RebaseOp::new(upstream).call(&repo).unwrap();
        let SequenceOutcome::Paused { conflicts, .. } = outcome else {
            panic!("expected a pause, got {:?}", outcome);
        };
        assert_eq!(conflicts[0].path(), "l/f");
        assert!(matches!(RebaseOp::new(upstream).call(&repo), Err(Error::IllegalState(_))));
        assert!(matches!(sequencer::resume(&repo), Err(Error::IllegalState(_))));

        insert(&repo, "l/f", &feature(12));
        AddOp::new().call(&repo).unwrap();
        let outcome = sequencer::resume(&repo).unwrap();
        assert!(matches!(outcome, SequenceOutcome::Completed(_)));
        assert_eq!(messages(&repo), vec!["clean", "conflicting", "upstream", "base"]);
        assert_eq!(
            repo.working_tree().find("l/f").unwrap().unwrap().object_id(),
            feature(12).id()
        );
    }
}
