//! History and workspace operations
//!
//! Each operation is a small builder finished by `call(&repo)`. Operations
//! check their preconditions before touching anything and move refs as
//! their last step, so a failed call leaves the repository where it was.
//! Conflicts are reported through outcome values, never as errors.

pub mod add;
pub mod branch;
pub mod checkout;
pub mod cherry_pick;
pub mod commit;
pub mod log;
pub mod merge;
pub mod rebase;
pub mod reset;
pub mod revert;
pub mod sequencer;
pub mod tag;

#[cfg(test)]
pub(crate) mod test_util;

pub use add::{AddOp, RemoveOp};
pub use checkout::{CheckoutOp, CheckoutResult};
pub use cherry_pick::CherryPickOp;
pub use commit::CommitOp;
pub use log::LogOp;
pub use merge::{MergeOp, MergeOutcome, MergeStrategy};
pub use rebase::RebaseOp;
pub use reset::{ResetMode, ResetOp};
pub use revert::RevertOp;
pub use sequencer::{OperationKind, PausedOperation, SequenceOutcome};

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::refs::{self, CHERRY_PICK_HEAD, HEAD, MERGE_HEAD, MERGE_MSG};
use crate::repository::Repository;

/// Fail unless the index and working tree match HEAD and nothing is
/// conflicted
pub(crate) fn require_clean(repo: &Repository, action: &str) -> Result<()> {
    if repo.has_conflicts()? {
        return Err(Error::IllegalState(format!(
            "cannot {} with unresolved conflicts",
            action
        )));
    }
    if !repo.working_tree().is_clean()? {
        return Err(Error::IllegalState(format!(
            "cannot {} with unstaged changes in the working tree",
            action
        )));
    }
    if !repo.staging_area().is_clean()? {
        return Err(Error::IllegalState(format!(
            "cannot {} with staged changes in the index",
            action
        )));
    }
    Ok(())
}

/// Point both the index and the working tree at `tree_id`
pub(crate) fn reset_trees(repo: &Repository, tree_id: &ObjectId) -> Result<()> {
    repo.staging_area().update_stage_head(tree_id)?;
    repo.working_tree().update_work_head(tree_id)
}

/// Forget a pending merge or cherry-pick commit
pub(crate) fn clear_merge_state(repo: &Repository) -> Result<()> {
    repo.refs().delete_ref(MERGE_HEAD)?;
    repo.refs().delete_ref(CHERRY_PICK_HEAD)?;
    repo.refs().remove_blob(MERGE_MSG)
}

/// Move the checked out branch (or the detached HEAD) from `expected` to
/// `new`, failing when it moved meanwhile
pub(crate) fn advance_head(repo: &Repository, expected: Option<&ObjectId>, new: &ObjectId) -> Result<()> {
    let name = repo.current_branch()?.unwrap_or_else(|| HEAD.to_string());
    repo.refs().update_ref(&name, expected, new)
}

/// Full name of the branch a commit is the tip of, if any
pub(crate) fn branch_at(repo: &Repository, id: &ObjectId) -> Result<Option<String>> {
    Ok(repo
        .refs()
        .list_refs(refs::HEADS_PREFIX)?
        .into_iter()
        .find(|r| r.object_id() == *id)
        .map(|r| r.name().to_string()))
}

/// Reject names git-like tools cannot tell apart from revision expressions
pub(crate) fn validate_ref_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.contains("..")
        || name.contains("//")
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if invalid {
        return Err(Error::InvalidArgument(format!("invalid ref name '{}'", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ref_name() {
        for ok in ["master", "feature/roads", "v1.0", "fix-12"] {
            assert!(validate_ref_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "a b", "a..b", "x^", "x~1", "/x", "x/", "x.lock", "a//b", "a:b"] {
            assert!(validate_ref_name(bad).is_err(), "{}", bad);
        }
    }
}
