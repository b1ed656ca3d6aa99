//! Repository integration tests
//!
//! Sled-backed repositories lock their directory; each test uses its own
//! temp dir and drops the repository before reopening it.

use std::sync::Arc;

use geovcs_core::ops::{
    AddOp, CheckoutOp, CommitOp, LogOp, MergeOp, MergeOutcome, PausedOperation, RebaseOp, SequenceOutcome, branch,
    sequencer,
};
use geovcs_core::{
    Conflict, FeatureInfo, ObjectId, ObjectStore, Repository, RepositoryConfig, RevFeature, TestPlatform, Value,
};
use tempfile::TempDir;

fn feature(n: i32) -> RevFeature {
    RevFeature::new(vec![Value::Int(n), Value::from("road")])
}

fn config() -> RepositoryConfig {
    RepositoryConfig::default().with_user("groldan", "groldan@example.com")
}

fn commit(repo: &Repository, path: &str, feature: &RevFeature, message: &str) -> ObjectId {
    repo.working_tree()
        .insert_feature(FeatureInfo::new(path, feature.clone()))
        .unwrap();
    AddOp::new().call(repo).unwrap();
    CommitOp::new().message(message).call(repo).unwrap().id()
}

fn checkout(repo: &Repository, name: &str) {
    CheckoutOp::new().target(name).call(repo).unwrap();
}

#[test]
fn test_init_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repository::init(temp_dir.path(), config()).unwrap();
    let uuid = repo.config().uuid.clone();
    assert_eq!(uuid.len(), 36);
    let head = commit(&repo, "roads/r1", &feature(1), "first");
    drop(repo);

    assert!(Repository::init(temp_dir.path(), config()).is_err());
    let repo = Repository::open(temp_dir.path()).unwrap();
    assert_eq!(repo.config().uuid, uuid);
    assert_eq!(repo.head_id().unwrap(), Some(head));
    assert_eq!(
        repo.working_tree().find("roads/r1").unwrap().unwrap().object_id(),
        feature(1).id()
    );
    assert!(repo.is_clean().unwrap());
}

#[test]
fn test_delete_modify_conflict_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repository::init(temp_dir.path(), config()).unwrap();

    let original = feature(1);
    let modified = feature(2);
    commit(&repo, "layer/f1", &original, "A");
    branch::create(&repo, "b", None, false).unwrap();
    checkout(&repo, "b");
    let theirs = commit(&repo, "layer/f1", &modified, "modify f1");
    checkout(&repo, "master");
    assert!(repo.working_tree().delete("layer/f1").unwrap());
    AddOp::new().call(&repo).unwrap();
    CommitOp::new().message("delete f1").call(&repo).unwrap();

    let outcome = MergeOp::new().commit(theirs).call(&repo).unwrap();
    let MergeOutcome::Conflicted(conflicts) = outcome else {
        panic!("expected conflicts, got {:?}", outcome);
    };
    assert_eq!(
        conflicts,
        vec![Conflict::new("layer/f1", original.id(), ObjectId::NULL, modified.id())]
    );
    drop(repo);

    let repo = Repository::open(temp_dir.path()).unwrap();
    let stored: Vec<Conflict> = repo
        .conflicts()
        .get_by_prefix(None, None)
        .collect::<geovcs_core::Result<_>>()
        .unwrap();
    assert_eq!(stored, conflicts);
    assert!(repo.refs().resolve_id("MERGE_HEAD").unwrap().is_some());

    repo.conflicts().remove_all(None).unwrap();
    assert!(!repo.conflicts().has_conflicts(None).unwrap());
}

#[test]
fn test_fast_forward_merge() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repository::init(temp_dir.path(), config()).unwrap();
    commit(&repo, "roads/r1", &feature(1), "first");
    branch::create(&repo, "topic", None, false).unwrap();
    checkout(&repo, "topic");
    let tip = commit(&repo, "roads/r2", &feature(2), "second");
    checkout(&repo, "master");

    let outcome = MergeOp::new().commit(tip).call(&repo).unwrap();
    assert_eq!(outcome, MergeOutcome::FastForward(tip));
    assert_eq!(repo.head_id().unwrap(), Some(tip));
    assert!(!repo.has_conflicts().unwrap());
    assert!(repo.is_clean().unwrap());
    assert_eq!(LogOp::new().call(&repo).unwrap().count(), 2);
}

/// master: base, upstream(f=1); topic: base, one, conflicting(f=2), three
fn diverged_rebase_setup() -> (Repository, ObjectId, ObjectId) {
    let repo = Repository::in_memory(config())
        .unwrap()
        .with_platform(Arc::new(TestPlatform::default()));
    commit(&repo, "layer/f", &feature(0), "base");
    branch::create(&repo, "topic", None, false).unwrap();
    let upstream = commit(&repo, "layer/f", &feature(1), "upstream");
    checkout(&repo, "topic");
    commit(&repo, "layer/one", &feature(11), "one");
    commit(&repo, "layer/f", &feature(2), "conflicting");
    let tip = commit(&repo, "layer/three", &feature(33), "three");
    (repo, upstream, tip)
}

fn paused_rebase(repo: &Repository, upstream: ObjectId) -> PausedOperation {
    let outcome = RebaseOp::new(upstream).call(repo).unwrap();
    assert!(matches!(outcome, SequenceOutcome::Paused { .. }), "{:?}", outcome);
    let op = PausedOperation::load(repo).unwrap().unwrap();
    assert_eq!(op.rewritten.len(), 1);
    assert_eq!(op.remaining.len(), 1);
    op
}

#[test]
fn test_rebase_skip_applies_remaining_commits() {
    let (repo, upstream, _) = diverged_rebase_setup();
    paused_rebase(&repo, upstream);

    let outcome = sequencer::skip(&repo).unwrap();
    assert!(matches!(outcome, SequenceOutcome::Completed(_)));
    let messages: Vec<String> = LogOp::new()
        .call(&repo)
        .unwrap()
        .map(|c| c.unwrap().message().to_string())
        .collect();
    assert_eq!(messages, vec!["three", "one", "upstream", "base"]);

    let work = repo.working_tree();
    assert_eq!(work.find("layer/f").unwrap().unwrap().object_id(), feature(1).id());
    assert!(work.find("layer/one").unwrap().is_some());
    assert!(work.find("layer/three").unwrap().is_some());
    assert!(!repo.has_conflicts().unwrap());
    assert!(PausedOperation::load(&repo).unwrap().is_none());
}

#[test]
fn test_rebase_abort_restores_branch_tip() {
    let (repo, upstream, tip) = diverged_rebase_setup();
    let op = paused_rebase(&repo, upstream);
    let (original, replayed) = op.rewritten[0];
    assert_eq!(repo.graph().get_mapping(&replayed).unwrap(), Some(original));

    sequencer::abort(&repo).unwrap();
    assert_eq!(repo.head_id().unwrap(), Some(tip));
    assert_eq!(repo.current_branch().unwrap().as_deref(), Some("refs/heads/topic"));
    assert!(!repo.has_conflicts().unwrap());
    assert!(repo.graph().get_mapping(&replayed).unwrap().is_none());
    assert!(repo.is_clean().unwrap());
    assert_eq!(
        repo.working_tree().find("layer/f").unwrap().unwrap().object_id(),
        feature(2).id()
    );
    assert!(PausedOperation::load(&repo).unwrap().is_none());
    assert!(repo.objects().exists(&replayed).unwrap());
}
