//! Fixtures shared by the operation tests

use std::sync::Arc;

use crate::config::{RepositoryConfig, TestPlatform};
use crate::id::ObjectId;
use crate::object::{RevFeature, Value};
use crate::ops::{AddOp, CommitOp, branch};
use crate::repository::Repository;
use crate::workspace::FeatureInfo;

pub(crate) fn repo() -> Repository {
    let config = RepositoryConfig::default().with_user("groldan", "groldan@example.com");
    Repository::in_memory(config)
        .unwrap()
        .with_platform(Arc::new(TestPlatform::default()))
}

pub(crate) fn feature(n: i32) -> RevFeature {
    RevFeature::new(vec![Value::Int(n), Value::from("name")])
}

pub(crate) fn insert(repo: &Repository, path: &str, feature: &RevFeature) {
    repo.working_tree()
        .insert_feature(FeatureInfo::new(path, feature.clone()))
        .unwrap();
}

pub(crate) fn delete(repo: &Repository, path: &str) {
    assert!(repo.working_tree().delete(path).unwrap());
}

/// Stage everything and commit
pub(crate) fn commit(repo: &Repository, message: &str) -> ObjectId {
    AddOp::new().call(repo).unwrap();
    CommitOp::new().message(message).call(repo).unwrap().id()
}

/// Insert one feature and commit it
pub(crate) fn commit_all(repo: &Repository, path: &str, feature: &RevFeature, message: &str) -> ObjectId {
    insert(repo, path, feature);
    commit(repo, message)
}

pub(crate) fn checkout(repo: &Repository, branch_name: &str) {
    crate::ops::CheckoutOp::new().target(branch_name).call(repo).unwrap();
}

pub(crate) fn create_branch(repo: &Repository, name: &str) {
    branch::create(repo, name, None, false).unwrap();
}
