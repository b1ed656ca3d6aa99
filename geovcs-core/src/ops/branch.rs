//! Branch management

use tracing::info;

use crate::error::{Error, Result};
use crate::ops::validate_ref_name;
use crate::refs::{self, HEAD, Ref};
use crate::repository::Repository;

/// Create branch `name` at `start` (a revision, HEAD when `None`)
///
/// An existing branch is only moved when `force` is set.
pub fn create(repo: &Repository, name: &str, start: Option<&str>, force: bool) -> Result<Ref> {
    validate_ref_name(name)?;
    let full_name = refs::branch_ref(name);
    if !force && repo.refs().get_raw(&full_name)?.is_some() {
        return Err(Error::IllegalState(format!("branch {} already exists", name)));
    }
    let commit = repo.resolve_commit(start.unwrap_or(HEAD))?;
    repo.refs().put_ref(&full_name, &commit.id())?;
    info!(branch = name, commit = %commit.id(), "Created branch");
    repo.refs()
        .get_ref(&full_name)?
        .ok_or(Error::RefNotFound(full_name))
}

/// Delete branch `name`, which must not be checked out
pub fn delete(repo: &Repository, name: &str) -> Result<Ref> {
    let full_name = refs::branch_ref(name);
    if repo.current_branch()?.as_deref() == Some(full_name.as_str()) {
        return Err(Error::IllegalState(format!(
            "cannot delete the checked out branch {}",
            name
        )));
    }
    let Some(existing) = repo.refs().get_ref(&full_name)? else {
        return Err(Error::RefNotFound(full_name));
    };
    repo.refs().delete_ref(&full_name)?;
    info!(branch = name, "Deleted branch");
    Ok(existing)
}

/// Rename branch `old` to `new`, following HEAD when it is checked out
pub fn rename(repo: &Repository, old: &str, new: &str, force: bool) -> Result<Ref> {
    validate_ref_name(new)?;
    let old_name = refs::branch_ref(old);
    let new_name = refs::branch_ref(new);
    let Some(existing) = repo.refs().get_ref(&old_name)? else {
        return Err(Error::RefNotFound(old_name));
    };
    if old_name == new_name {
        return Ok(existing);
    }
    if repo.refs().get_raw(&new_name)?.is_some() {
        if !force {
            return Err(Error::IllegalState(format!("branch {} already exists", new)));
        }
        // HEAD would move while the index and working tree stay behind
        if repo.current_branch()?.as_deref() == Some(new_name.as_str()) {
            return Err(Error::IllegalState(format!(
                "cannot overwrite the checked out branch {}",
                new
            )));
        }
    }
    repo.refs().put_ref(&new_name, &existing.object_id())?;
    if repo.current_branch()?.as_deref() == Some(old_name.as_str()) {
        repo.refs().put_symref(HEAD, &new_name)?;
    }
    repo.refs().delete_ref(&old_name)?;
    repo.refs()
        .get_ref(&new_name)?
        .ok_or(Error::RefNotFound(new_name))
}

/// Every local branch, sorted by name
pub fn list(repo: &Repository) -> Result<Vec<Ref>> {
    repo.refs().list_refs(refs::HEADS_PREFIX)
}
