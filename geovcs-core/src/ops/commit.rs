//! Record the index as a new commit

use tracing::info;

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::object::{RevCommit, RevObject, RevPerson};
use crate::ops::{AddOp, advance_head, clear_merge_state};
use crate::refs::{MERGE_HEAD, MERGE_MSG};
use crate::repository::Repository;
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Default)]
pub struct CommitOp {
    message: Option<String>,
    allow_empty: bool,
    amend: bool,
    all: bool,
    author: Option<RevPerson>,
    extra_parents: Vec<ObjectId>,
}

impl CommitOp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Commit even when the index matches HEAD
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Replace the HEAD commit instead of adding a child to it
    pub fn amend(mut self, amend: bool) -> Self {
        self.amend = amend;
        self
    }

    /// Stage every working tree change first
    pub fn all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    /// Author of the new commit; the committer is always the repository
    /// identity
    pub fn author(mut self, author: RevPerson) -> Self {
        self.author = Some(author);
        self
    }

    /// Additional parents after HEAD (and a pending `MERGE_HEAD`)
    pub fn parent(mut self, id: ObjectId) -> Self {
        self.extra_parents.push(id);
        self
    }

    pub fn call(&self, repo: &Repository) -> Result<RevCommit> {
        if repo.has_conflicts()? {
            return Err(Error::IllegalState(
                "cannot commit with unresolved conflicts".to_string(),
            ));
        }
        if self.all {
            AddOp::new().call(repo)?;
        }

        let head_id = repo.head_id()?;
        let head = head_id.map(|id| repo.objects().get_commit(&id)).transpose()?;
        let merge_head = repo.refs().resolve_id(MERGE_HEAD)?;

        let mut parents: Vec<ObjectId> = if self.amend {
            match &head {
                Some(head) => head.parents().to_vec(),
                None => {
                    return Err(Error::IllegalState(
                        "cannot amend on a branch without commits".to_string(),
                    ));
                }
            }
        } else {
            head_id.into_iter().collect()
        };
        for parent in merge_head.iter().chain(&self.extra_parents) {
            if !parents.contains(parent) {
                parents.push(*parent);
            }
        }

        let tree_id = repo.staging_area().tree_id()?;
        let head_tree = repo.head_tree_id()?;
        if tree_id == head_tree && !self.allow_empty && !self.amend && parents.len() < 2 {
            return Err(Error::NothingToCommit("no changes added to commit".to_string()));
        }

        let message = match &self.message {
            Some(m) => m.clone(),
            None => self.default_message(repo, head.as_ref(), merge_head.is_some())?,
        };
        let committer = repo.person()?;
        let author = match (&self.author, &head) {
            (Some(author), _) => author.clone(),
            (None, Some(head)) if self.amend => head.author().clone(),
            _ => committer.clone(),
        };

        let commit = RevCommit::new(tree_id, parents, author, committer, message);
        repo.objects().put(&RevObject::from(commit.clone()))?;
        advance_head(repo, head_id.as_ref(), &commit.id())?;
        clear_merge_state(repo)?;
        info!(
            commit = %commit.id(),
            parents = commit.parents().len(),
            amend = self.amend,
            "Committed"
        );
        Ok(commit)
    }

    fn default_message(&self, repo: &Repository, head: Option<&RevCommit>, merging: bool) -> Result<String> {
        if merging {
            if let Some(saved) = repo.refs().get_blob(MERGE_MSG)? {
                return String::from_utf8(saved).map_err(|e| Error::Corrupt(e.to_string()));
            }
        }
        match head {
            Some(head) if self.amend => Ok(head.message().to_string()),
            _ => Err(Error::InvalidArgument("no commit message given".to_string())),
        }
    }
}
