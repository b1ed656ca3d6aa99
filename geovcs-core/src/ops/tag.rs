//! Annotated tags

use tracing::info;

use crate::error::{Error, Result};
use crate::object::{RevObject, RevTag};
use crate::ops::validate_ref_name;
use crate::refs::{self, HEAD};
use crate::repository::Repository;
use crate::storage::ObjectStore;

/// Tag the commit `target` resolves to (HEAD when `None`)
pub fn create(repo: &Repository, name: &str, target: Option<&str>, message: &str) -> Result<RevTag> {
    validate_ref_name(name)?;
    let full_name = refs::tag_ref(name);
    if repo.refs().get_raw(&full_name)?.is_some() {
        return Err(Error::IllegalState(format!("tag {} already exists", name)));
    }
    let commit = repo.resolve_commit(target.unwrap_or(HEAD))?;
    let tag = RevTag::new(name, commit.id(), message, repo.person()?);
    repo.objects().put(&RevObject::from(tag.clone()))?;
    repo.refs().put_ref(&full_name, &tag.id())?;
    info!(tag = name, commit = %commit.id(), "Created tag");
    Ok(tag)
}

pub fn delete(repo: &Repository, name: &str) -> Result<RevTag> {
    let full_name = refs::tag_ref(name);
    let Some(id) = repo.refs().resolve_id(&full_name)? else {
        return Err(Error::RefNotFound(full_name));
    };
    let tag = repo.objects().get_tag(&id)?;
    repo.refs().delete_ref(&full_name)?;
    Ok(tag)
}

/// Every tag, sorted by name
pub fn list(repo: &Repository) -> Result<Vec<RevTag>> {
    repo.refs()
        .list_refs(refs::TAGS_PREFIX)?
        .iter()
        .map(|r| repo.objects().get_tag(&r.object_id()))
        .collect()
}
