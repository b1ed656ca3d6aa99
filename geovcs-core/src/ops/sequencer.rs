//! Resumable replay of commits shared by rebase, cherry-pick and revert
//!
//! A sequence replays a queue of commits on top of HEAD one at a time. Each
//! step is a three-way merge whose result is committed right away. A step
//! that conflicts leaves its clean changes staged, records the conflicts and
//! parks the whole sequence as one [`PausedOperation`] blob. From there the
//! caller resolves and [`resume`]s, [`skip`]s the step, or [`abort`]s back to
//! the original HEAD.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflicts::Conflict;
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::merge_scenario::{apply_report, report_merge_scenario};
use crate::object::{RevCommit, RevObject, RevPerson, RevTree};
use crate::ops::{ResetMode, ResetOp, clear_merge_state};
use crate::progress::DefaultProgressListener;
use crate::refs::{CHERRY_PICK_HEAD, MERGE_MSG, PAUSED_OPERATION};
use crate::repository::Repository;
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Rebase,
    CherryPick,
    Revert,
}

/// Persisted state of a sequence in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedOperation {
    pub kind: OperationKind,
    /// Branch being rewritten, `None` on a detached HEAD
    pub branch: Option<String>,
    /// HEAD before the operation started; abort returns here
    pub original_head: ObjectId,
    /// Commit the next step applies on
    pub head: ObjectId,
    /// Commit whose step stopped with conflicts
    pub current: Option<ObjectId>,
    /// Commits still to replay, in order
    pub remaining: Vec<ObjectId>,
    /// (original, replayed) pairs produced so far
    pub rewritten: Vec<(ObjectId, ObjectId)>,
}

impl PausedOperation {
    pub(crate) fn new(kind: OperationKind, repo: &Repository, head: ObjectId, queue: Vec<ObjectId>) -> Result<Self> {
        Ok(Self {
            kind,
            branch: repo.current_branch()?,
            original_head: head,
            head,
            current: None,
            remaining: queue,
            rewritten: Vec::new(),
        })
    }

    /// The operation in progress, if any
    pub fn load(repo: &Repository) -> Result<Option<Self>> {
        match repo.refs().get_blob(PAUSED_OPERATION)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn save(&self, repo: &Repository) -> Result<()> {
        let data = bincode::serialize(self)?;
        repo.refs().put_blob(PAUSED_OPERATION, &data)
    }

    fn clear(repo: &Repository) -> Result<()> {
        repo.refs().remove_blob(PAUSED_OPERATION)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOutcome {
    /// Nothing to replay
    UpToDate,
    /// The branch moved forward without replaying anything
    FastForward(ObjectId),
    /// Every step was applied; holds the new HEAD
    Completed(ObjectId),
    /// A step conflicted; resolve and resume, skip, or abort
    Paused {
        commit: ObjectId,
        conflicts: Vec<Conflict>,
    },
}

enum Step {
    Committed(ObjectId),
    /// The change was already present
    Empty,
    Conflicted(Vec<Conflict>),
}

/// Fail when another sequence is parked
pub(crate) fn require_idle(repo: &Repository) -> Result<()> {
    match PausedOperation::load(repo)? {
        Some(op) => Err(Error::IllegalState(format!(
            "a {:?} is in progress; resume, skip or abort it first",
            op.kind
        ))),
        None => Ok(()),
    }
}

/// Persist `op` and replay its queue
pub(crate) fn start(repo: &Repository, op: PausedOperation) -> Result<SequenceOutcome> {
    info!(kind = ?op.kind, commits = op.remaining.len(), onto = %op.head, "Starting sequence");
    op.save(repo)?;
    run(repo, op)
}

/// Commit the resolved step and replay the rest
pub fn resume(repo: &Repository) -> Result<SequenceOutcome> {
    let mut op = load_required(repo)?;
    if repo.has_conflicts()? {
        return Err(Error::IllegalState(
            "resolve and add all conflicted paths before resuming".to_string(),
        ));
    }
    if let Some(current) = op.current.take() {
        let commit = repo.objects().get_commit(&current)?;
        let (author, message) = step_identity(repo, op.kind, &commit)?;
        commit_step(repo, &mut op, &commit, author, message)?;
        clear_merge_state(repo)?;
    }
    run(repo, op)
}

/// Drop the conflicted step and replay the rest
pub fn skip(repo: &Repository) -> Result<SequenceOutcome> {
    let mut op = load_required(repo)?;
    let skipped = op.current.take();
    ResetOp::new().commit(op.head).mode(ResetMode::Hard).call(repo)?;
    debug!(skipped = ?skipped, "Skipped step");
    run(repo, op)
}

/// Restore HEAD, the index and the working tree to where the operation
/// started and forget its state
pub fn abort(repo: &Repository) -> Result<()> {
    let op = load_required(repo)?;
    ResetOp::new()
        .commit(op.original_head)
        .mode(ResetMode::Hard)
        .call(repo)?;
    for (_, replayed) in &op.rewritten {
        repo.graph().map(replayed, &ObjectId::NULL)?;
    }
    PausedOperation::clear(repo)?;
    info!(kind = ?op.kind, head = %op.original_head, "Aborted sequence");
    Ok(())
}

fn load_required(repo: &Repository) -> Result<PausedOperation> {
    PausedOperation::load(repo)?
        .ok_or_else(|| Error::IllegalState("no rebase, cherry-pick or revert in progress".to_string()))
}

fn run(repo: &Repository, mut op: PausedOperation) -> Result<SequenceOutcome> {
    while !op.remaining.is_empty() {
        let next = op.remaining.remove(0);
        match apply_step(repo, &mut op, next)? {
            Step::Committed(id) => debug!(original = %next, replayed = %id, "Applied step"),
            Step::Empty => debug!(commit = %next, "Step left nothing to commit"),
            Step::Conflicted(conflicts) => {
                op.current = Some(next);
                op.save(repo)?;
                info!(commit = %next, conflicts = conflicts.len(), "Sequence paused on conflicts");
                return Ok(SequenceOutcome::Paused {
                    commit: next,
                    conflicts,
                });
            }
        }
        op.save(repo)?;
    }
    PausedOperation::clear(repo)?;
    clear_merge_state(repo)?;
    info!(kind = ?op.kind, head = %op.head, "Sequence completed");
    Ok(SequenceOutcome::Completed(op.head))
}

/// Author and message of the commit a step produces
fn step_identity(repo: &Repository, kind: OperationKind, commit: &RevCommit) -> Result<(RevPerson, String)> {
    match kind {
        OperationKind::Rebase | OperationKind::CherryPick => {
            Ok((commit.author().clone(), commit.message().to_string()))
        }
        OperationKind::Revert => Ok((
            repo.person()?,
            format!("Revert '{}'\nThis reverts {}", commit.message(), commit.id()),
        )),
    }
}

fn apply_step(repo: &Repository, op: &mut PausedOperation, id: ObjectId) -> Result<Step> {
    let commit = repo.objects().get_commit(&id)?;
    let parent_tree = match commit.first_parent() {
        Some(parent) => repo.commit_tree_id(&parent)?,
        None => RevTree::empty_id(),
    };
    let (ancestor, theirs) = match op.kind {
        OperationKind::Rebase | OperationKind::CherryPick => (parent_tree, commit.tree_id()),
        OperationKind::Revert => (commit.tree_id(), parent_tree),
    };
    let head_tree = repo.commit_tree_id(&op.head)?;
    let report = report_merge_scenario(
        repo.objects(),
        &ancestor,
        &head_tree,
        &theirs,
        &DefaultProgressListener::new(),
    )?;
    apply_report(repo, &report)?;

    let (author, message) = step_identity(repo, op.kind, &commit)?;
    if report.has_conflicts() {
        if op.kind != OperationKind::Revert {
            repo.refs().put_ref(CHERRY_PICK_HEAD, &id)?;
        }
        repo.refs().put_blob(MERGE_MSG, message.as_bytes())?;
        return Ok(Step::Conflicted(report.conflicts));
    }
    commit_step(repo, op, &commit, author, message)
}

/// Commit the index on top of `op.head`
fn commit_step(
    repo: &Repository,
    op: &mut PausedOperation,
    original: &RevCommit,
    author: RevPerson,
    message: String,
) -> Result<Step> {
    let tree = repo.staging_area().tree_id()?;
    if tree == repo.commit_tree_id(&op.head)? {
        return Ok(Step::Empty);
    }
    let committer = repo.person()?;
    let replayed = RevCommit::new(tree, vec![op.head], author, committer, message);
    repo.objects().put(&RevObject::from(replayed.clone()))?;
    repo.update_head(&replayed.id())?;
    if op.kind == OperationKind::Rebase {
        repo.graph().map(&replayed.id(), &original.id())?;
    }
    op.head = replayed.id();
    op.rewritten.push((original.id(), replayed.id()));
    Ok(Step::Committed(replayed.id()))
}
