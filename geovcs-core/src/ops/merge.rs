//! Merge one or more commits into HEAD

use tracing::{debug, info};

use crate::ancestor::{find_common_ancestor, is_ancestor};
use crate::conflicts::Conflict;
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::merge_scenario::{MergeScenarioReport, apply_report, report_merge_scenario};
use crate::object::{RevCommit, RevTree};
use crate::ops::{CommitOp, ResetMode, ResetOp, branch_at, require_clean, reset_trees};
use crate::progress::{DefaultProgressListener, ProgressListener};
use crate::refs::{self, MERGE_HEAD, MERGE_MSG, ORIG_HEAD};
use crate::repository::Repository;
use crate::storage::ObjectStore;
use crate::tree::{TreeEditor, find_node};

/// How conflicting changes are settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Record conflicts and stop
    #[default]
    Recursive,
    /// Keep our version of conflicted paths
    Ours,
    /// Take their version of conflicted paths
    Theirs,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Everything was already merged
    UpToDate,
    /// The branch moved forward to the merged commit
    FastForward(ObjectId),
    Merged(RevCommit),
    /// Changes are staged and `MERGE_HEAD` is set; commit to conclude
    Staged,
    /// Conflicts were recorded and `MERGE_HEAD` is set; resolve, add and
    /// commit, or abort
    Conflicted(Vec<Conflict>),
}

pub struct MergeOp<'l> {
    commits: Vec<ObjectId>,
    strategy: MergeStrategy,
    no_ff: bool,
    ff_only: bool,
    no_commit: bool,
    message: Option<String>,
    listener: Option<&'l dyn ProgressListener>,
}

impl Default for MergeOp<'_> {
    fn default() -> Self {
        Self {
            commits: Vec::new(),
            strategy: MergeStrategy::default(),
            no_ff: false,
            ff_only: false,
            no_commit: false,
            message: None,
            listener: None,
        }
    }
}

impl<'l> MergeOp<'l> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit to merge; several make an octopus merge
    pub fn commit(mut self, id: ObjectId) -> Self {
        self.commits.push(id);
        self
    }

    pub fn strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Create a merge commit even when a fast-forward is possible
    pub fn no_ff(mut self, no_ff: bool) -> Self {
        self.no_ff = no_ff;
        self
    }

    /// Refuse anything but a fast-forward
    pub fn ff_only(mut self, ff_only: bool) -> Self {
        self.ff_only = ff_only;
        self
    }

    /// Stage the merge result without committing it
    pub fn no_commit(mut self, no_commit: bool) -> Self {
        self.no_commit = no_commit;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn listener(mut self, listener: &'l dyn ProgressListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn call(&self, repo: &Repository) -> Result<MergeOutcome> {
        if self.commits.is_empty() {
            return Err(Error::InvalidArgument("no commits to merge".to_string()));
        }
        if self.no_ff && self.ff_only {
            return Err(Error::InvalidArgument(
                "no_ff and ff_only are mutually exclusive".to_string(),
            ));
        }
        if repo.refs().get_raw(MERGE_HEAD)?.is_some() {
            return Err(Error::IllegalState(
                "a merge is already in progress; commit or abort it first".to_string(),
            ));
        }
        require_clean(repo, "merge")?;
        for id in &self.commits {
            repo.objects().get_commit(id)?;
        }

        let default_listener = DefaultProgressListener::new();
        let listener: &dyn ProgressListener = match self.listener {
            Some(listener) => listener,
            None => &default_listener,
        };
        listener.started();

        let Some(head) = repo.head_id()? else {
            return self.merge_into_unborn(repo);
        };

        let mut pending = Vec::new();
        for id in &self.commits {
            if !is_ancestor(repo.graph(), id, &head)? && !pending.contains(id) {
                pending.push(*id);
            }
        }
        let outcome = match pending.as_slice() {
            [] => MergeOutcome::UpToDate,
            [theirs] => self.merge_one(repo, head, *theirs, listener)?,
            _ => self.merge_octopus(repo, head, &pending, listener)?,
        };
        listener.complete();
        Ok(outcome)
    }

    /// Abort a conflicted or staged merge, restoring the pre-merge HEAD
    pub fn abort(repo: &Repository) -> Result<()> {
        if repo.refs().get_raw(MERGE_HEAD)?.is_none() {
            return Err(Error::IllegalState("no merge in progress".to_string()));
        }
        let orig = repo.refs().resolve_id(ORIG_HEAD)?;
        let mut reset = ResetOp::new().mode(ResetMode::Hard);
        if let Some(orig) = orig {
            reset = reset.commit(orig);
        }
        reset.call(repo)?;
        info!("Merge aborted");
        Ok(())
    }

    fn merge_into_unborn(&self, repo: &Repository) -> Result<MergeOutcome> {
        let [theirs] = self.commits.as_slice() else {
            return Err(Error::InvalidArgument(
                "cannot merge several commits into a branch without commits".to_string(),
            ));
        };
        self.fast_forward(repo, None, *theirs)
    }

    fn fast_forward(&self, repo: &Repository, head: Option<ObjectId>, theirs: ObjectId) -> Result<MergeOutcome> {
        if let Some(head) = head {
            repo.refs().put_ref(ORIG_HEAD, &head)?;
        }
        reset_trees(repo, &repo.commit_tree_id(&theirs)?)?;
        repo.update_head(&theirs)?;
        info!(commit = %theirs, "Fast-forward merge");
        Ok(MergeOutcome::FastForward(theirs))
    }

    fn merge_one(
        &self,
        repo: &Repository,
        head: ObjectId,
        theirs: ObjectId,
        listener: &dyn ProgressListener,
    ) -> Result<MergeOutcome> {
        let can_fast_forward = is_ancestor(repo.graph(), &head, &theirs)?;
        if can_fast_forward && !self.no_ff {
            return self.fast_forward(repo, Some(head), theirs);
        }
        if self.ff_only {
            return Err(Error::IllegalState(
                "ff_only was requested but the histories diverged".to_string(),
            ));
        }

        let base = find_common_ancestor(repo.graph(), &head, &theirs)?;
        let base_tree = match base {
            Some(base) => repo.commit_tree_id(&base)?,
            None => RevTree::empty_id(),
        };
        let ours_tree = repo.commit_tree_id(&head)?;
        let theirs_tree = repo.commit_tree_id(&theirs)?;
        listener.set_description(&format!("Merging {} onto {}", theirs.short(), head.short()));
        let report = report_merge_scenario(repo.objects(), &base_tree, &ours_tree, &theirs_tree, listener)?;
        debug!(base = ?base, conflicts = report.conflicts.len(), "Merge scenario computed");

        let message = self.merge_message(repo, &[theirs])?;
        repo.refs().put_ref(ORIG_HEAD, &head)?;
        repo.refs().put_ref(MERGE_HEAD, &theirs)?;
        repo.refs().put_blob(MERGE_MSG, message.as_bytes())?;

        match self.strategy {
            MergeStrategy::Recursive => apply_report(repo, &report)?,
            MergeStrategy::Ours => apply_report(repo, &without_conflicts(&report))?,
            MergeStrategy::Theirs => {
                apply_report(repo, &without_conflicts(&report))?;
                take_theirs(repo, &report.conflicts, &theirs_tree)?;
            }
        }

        if self.strategy == MergeStrategy::Recursive && report.has_conflicts() {
            info!(conflicts = report.conflicts.len(), "Merge stopped with conflicts");
            return Ok(MergeOutcome::Conflicted(report.conflicts));
        }
        if self.no_commit {
            return Ok(MergeOutcome::Staged);
        }
        let commit = CommitOp::new().message(message).allow_empty(true).call(repo)?;
        Ok(MergeOutcome::Merged(commit))
    }

    /// Merge several commits at once; refuses when any of them conflicts
    fn merge_octopus(
        &self,
        repo: &Repository,
        head: ObjectId,
        commits: &[ObjectId],
        listener: &dyn ProgressListener,
    ) -> Result<MergeOutcome> {
        if self.no_commit || self.ff_only || self.strategy != MergeStrategy::Recursive {
            return Err(Error::InvalidArgument(
                "merging several commits only supports the default strategy with a commit".to_string(),
            ));
        }
        let head_tree = repo.commit_tree_id(&head)?;
        let mut current = head_tree;
        for theirs in commits {
            let base = find_common_ancestor(repo.graph(), &head, theirs)?;
            let base_tree = match base {
                Some(base) => repo.commit_tree_id(&base)?,
                None => RevTree::empty_id(),
            };
            let theirs_tree = repo.commit_tree_id(theirs)?;
            let report = report_merge_scenario(repo.objects(), &base_tree, &current, &theirs_tree, listener)?;
            if report.has_conflicts() {
                reset_trees(repo, &head_tree)?;
                return Err(Error::IllegalState(format!(
                    "cannot merge several commits when {} conflicts with the others",
                    theirs.short()
                )));
            }
            apply_report(repo, &report)?;
            current = repo.staging_area().tree_id()?;
        }

        let message = self.merge_message(repo, commits)?;
        repo.refs().put_ref(ORIG_HEAD, &head)?;
        let mut commit = CommitOp::new().message(message).allow_empty(true);
        for theirs in commits {
            commit = commit.parent(*theirs);
        }
        let commit = commit.call(repo)?;
        info!(commit = %commit.id(), parents = commit.parents().len(), "Octopus merge");
        Ok(MergeOutcome::Merged(commit))
    }

    fn merge_message(&self, repo: &Repository, commits: &[ObjectId]) -> Result<String> {
        if let Some(message) = &self.message {
            return Ok(message.clone());
        }
        let mut parts = Vec::new();
        for id in commits {
            parts.push(match branch_at(repo, id)? {
                Some(name) => format!("Merge branch {}", refs::short_name(&name)),
                None => format!("Merge commit '{}'", id),
            });
        }
        Ok(parts.join("\n"))
    }
}

fn without_conflicts(report: &MergeScenarioReport) -> MergeScenarioReport {
    MergeScenarioReport {
        unconflicted: report.unconflicted.clone(),
        merged: report.merged.clone(),
        conflicts: Vec::new(),
    }
}

/// Overwrite conflicted paths in the index and working tree with their
/// version from `theirs_tree`
fn take_theirs(repo: &Repository, conflicts: &[Conflict], theirs_tree: &ObjectId) -> Result<()> {
    if conflicts.is_empty() {
        return Ok(());
    }
    let store = repo.objects();
    let mut editor = TreeEditor::new(store);
    for conflict in conflicts {
        match find_node(store, theirs_tree, conflict.path())? {
            Some(node) if node.is_tree() => {
                editor.ensure_tree(conflict.path(), node.node().metadata_id());
            }
            Some(node) => {
                editor.put(conflict.path(), node.node().clone());
            }
            None => {
                editor.remove(conflict.path());
            }
        }
    }
    let root = editor.apply(&repo.staging_area().tree_id()?)?;
    reset_trees(repo, &root)
}
