//! Revision expressions
//!
//! A revision is a base followed by any number of ancestry suffixes:
//!
//! - base: a full 40 character id, a ref name (`HEAD`, `master`,
//!   `refs/heads/master`, `v1.0`), or an abbreviated id of at least
//!   [`MIN_ABBREVIATED_LEN`] hex characters
//! - `^N`: the Nth parent (`^` alone is `^1`, `^0` the commit itself)
//! - `~N`: the Nth first-parent ancestor (`~` alone is `~1`)

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::object::{ObjectKind, RevCommit, RevObject};
use crate::refs::{HEADS_PREFIX, TAGS_PREFIX};
use crate::repository::Repository;
use crate::storage::ObjectStore;

pub const MIN_ABBREVIATED_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Parent(usize),
    Ancestor(usize),
}

fn split_steps(spec: &str) -> Result<(&str, Vec<Step>)> {
    let Some(pos) = spec.find(['^', '~']) else {
        return Ok((spec, Vec::new()));
    };
    let (base, mut rest) = spec.split_at(pos);
    let mut steps = Vec::new();
    while let Some(op) = rest.chars().next() {
        rest = &rest[1..];
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let n = if digits == 0 {
            1
        } else {
            rest[..digits]
                .parse::<usize>()
                .map_err(|e| Error::InvalidArgument(format!("{}: {}", spec, e)))?
        };
        rest = &rest[digits..];
        steps.push(match op {
            '^' => Step::Parent(n),
            '~' => Step::Ancestor(n),
            _ => return Err(Error::InvalidArgument(format!("invalid revision {}", spec))),
        });
    }
    Ok((base, steps))
}

/// Resolve the base of a revision, without ancestry suffixes
fn resolve_base(repo: &Repository, base: &str) -> Result<Option<ObjectId>> {
    if base.is_empty() {
        return Ok(None);
    }
    if base.len() == 2 * crate::id::NUM_BYTES && ObjectId::is_hex_id(base) {
        let id = ObjectId::from_hex(base)?;
        return Ok(repo.objects().exists(&id)?.then_some(id));
    }
    let candidates = [
        base.to_string(),
        format!("{}{}", HEADS_PREFIX, base),
        format!("{}{}", TAGS_PREFIX, base),
        format!("refs/{}", base),
    ];
    for name in &candidates {
        if let Some(id) = repo.refs().resolve_id(name)? {
            return Ok(Some(id));
        }
    }
    if base.len() >= MIN_ABBREVIATED_LEN && base.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut found = repo.objects().look_up(base)?;
        return match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            _ => Err(Error::AmbiguousPrefix {
                prefix: base.to_string(),
                candidates: found,
            }),
        };
    }
    Ok(None)
}

/// Follow tags until a non-tag object
pub fn peel(repo: &Repository, id: &ObjectId) -> Result<RevObject> {
    let mut object = repo.objects().get(id)?;
    while let RevObject::Tag(tag) = &object {
        object = repo.objects().get(&tag.commit_id())?;
    }
    Ok(object)
}

fn peel_commit(repo: &Repository, id: &ObjectId) -> Result<RevCommit> {
    match peel(repo, id)? {
        RevObject::Commit(c) => Ok(c),
        other => Err(Error::UnexpectedType {
            id: *id,
            expected: ObjectKind::Commit,
            actual: other.kind(),
        }),
    }
}

/// Resolve `spec` to an object id, `None` when nothing matches
pub fn rev_parse(repo: &Repository, spec: &str) -> Result<Option<ObjectId>> {
    let spec = spec.trim();
    let (base, steps) = split_steps(spec)?;
    let Some(mut id) = resolve_base(repo, base)? else {
        return Ok(None);
    };
    for step in steps {
        let commit = peel_commit(repo, &id)?;
        let next = match step {
            Step::Parent(0) => Some(commit.id()),
            Step::Parent(n) => commit.parent_n(n - 1),
            Step::Ancestor(n) => {
                let mut current = commit;
                let mut reached = Some(current.id());
                for _ in 0..n {
                    reached = current.first_parent();
                    match reached {
                        Some(parent) => current = repo.objects().get_commit(&parent)?,
                        None => break,
                    }
                }
                reached
            }
        };
        match next {
            Some(next) => id = next,
            None => return Ok(None),
        }
    }
    Ok(Some(id))
}

/// Resolve `spec` to a commit, peeling tags; fails when nothing matches
pub fn resolve_commit(repo: &Repository, spec: &str) -> Result<RevCommit> {
    let id = rev_parse(repo, spec)?.ok_or_else(|| Error::RefNotFound(spec.to_string()))?;
    peel_commit(repo, &id)
}
