//! Error type shared by every layer of the repository core

use crate::id::ObjectId;
use crate::object::ObjectKind;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or mutating a repository
///
/// Merge, rebase and cherry-pick conflicts are not errors; those operations
/// report them through their outcome types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Ref not found: {0}")]
    RefNotFound(String),

    #[error("Ambiguous object id prefix {prefix}: {} candidates", .candidates.len())]
    AmbiguousPrefix {
        prefix: String,
        candidates: Vec<ObjectId>,
    },

    #[error("Object {id} is a {actual}, expected a {expected}")]
    UnexpectedType {
        id: ObjectId,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Nothing to commit: {0}")]
    NothingToCommit(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::IllegalState("lock poisoned".to_string())
    }
}
