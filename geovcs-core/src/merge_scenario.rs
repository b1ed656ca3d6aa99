//! Three-way classification of changes between a common ancestor and two
//! descendant trees
//!
//! Changes are computed as `ancestor -> ours` and `ancestor -> theirs` and
//! paired by path. A change only `theirs` made is unconflicted and has to be
//! applied on top of `ours`; a change only `ours` made is already there.
//! Where both sides changed the same path the report decides whether the
//! changes agree, can be merged attribute by attribute, or conflict.

use std::collections::HashMap;

use tracing::debug;

use crate::conflicts::Conflict;
use crate::diff::{ChangeType, DiffEntry, TreeDiff};
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::object::{RevFeature, RevObject, Value};
use crate::progress::ProgressListener;
use crate::repository::Repository;
use crate::storage::{NoopListener, ObjectStore};
use crate::tree::NodeRef;

/// Feature whose attribute changes from both sides were combined
#[derive(Debug, Clone)]
pub struct MergedFeature {
    /// Change to apply on top of `ours`
    pub entry: DiffEntry,
    pub feature: RevFeature,
}

#[derive(Debug, Clone, Default)]
pub struct MergeScenarioReport {
    pub unconflicted: Vec<DiffEntry>,
    pub merged: Vec<MergedFeature>,
    pub conflicts: Vec<Conflict>,
}

impl MergeScenarioReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Whether there is nothing to apply on top of `ours`
    pub fn is_empty(&self) -> bool {
        self.unconflicted.is_empty() && self.merged.is_empty() && self.conflicts.is_empty()
    }

    /// Every change to stage on top of `ours`, merged features last
    pub fn changes(&self) -> impl Iterator<Item = &DiffEntry> {
        self.unconflicted.iter().chain(self.merged.iter().map(|m| &m.entry))
    }
}

/// Classify the changes `ancestor -> theirs` against `ancestor -> ours`.
/// All three arguments are root tree ids; the null id is the empty tree.
pub fn report_merge_scenario(
    store: &dyn ObjectStore,
    ancestor: &ObjectId,
    ours: &ObjectId,
    theirs: &ObjectId,
    listener: &dyn ProgressListener,
) -> Result<MergeScenarioReport> {
    let mut ours_changes: HashMap<String, DiffEntry> = HashMap::new();
    TreeDiff::new(store)
        .report_trees(true)
        .listener(listener)
        .walk(ancestor, ours, &mut |entry| {
            ours_changes.insert(entry.path(), entry);
            Ok(())
        })?;

    let mut report = MergeScenarioReport::default();
    TreeDiff::new(store)
        .report_trees(true)
        .listener(listener)
        .walk(ancestor, theirs, &mut |theirs_change| {
            match ours_changes.get(&theirs_change.path()) {
                None => report.unconflicted.push(theirs_change),
                Some(ours_change) => classify(store, &mut report, ours_change, theirs_change)?,
            }
            Ok(())
        })?;

    if listener.is_canceled() {
        return Err(Error::Canceled);
    }
    debug!(
        unconflicted = report.unconflicted.len(),
        merged = report.merged.len(),
        conflicts = report.conflicts.len(),
        "Merge scenario"
    );
    Ok(report)
}

/// Decide what to do with a path both sides changed
fn classify(
    store: &dyn ObjectStore,
    report: &mut MergeScenarioReport,
    ours: &DiffEntry,
    theirs: DiffEntry,
) -> Result<()> {
    let path = theirs.path();
    let conflict = || {
        Conflict::new(
            path.clone(),
            theirs.old_object_id(),
            ours.new_object_id(),
            theirs.new_object_id(),
        )
    };

    if ours.change_type() != theirs.change_type() || ours.kind() != theirs.kind() {
        report.conflicts.push(conflict());
        return Ok(());
    }
    match theirs.change_type() {
        ChangeType::Removed => {}
        ChangeType::Added => {
            if ours.new_object_id() == theirs.new_object_id() {
                if theirs.is_tree() {
                    check_tree_metadata(report, &path, ours, &theirs);
                } else if new_metadata(ours) != new_metadata(&theirs) {
                    report.conflicts.push(conflict());
                }
            } else if theirs.is_tree() {
                // contents are reconciled child by child
                check_tree_metadata(report, &path, ours, &theirs);
            } else {
                report.conflicts.push(conflict());
            }
        }
        ChangeType::Modified => {
            if theirs.is_tree() {
                check_tree_metadata(report, &path, ours, &theirs);
            } else if ours.new_object_id() == theirs.new_object_id()
                && new_metadata(ours) == new_metadata(&theirs)
            {
                // same change on both sides
            } else {
                merge_features(store, report, ours, theirs)?;
            }
        }
    }
    Ok(())
}

fn new_metadata(entry: &DiffEntry) -> ObjectId {
    entry.new_ref().map(NodeRef::metadata_id).unwrap_or(ObjectId::NULL)
}

fn old_metadata(entry: &DiffEntry) -> ObjectId {
    entry.old().map(NodeRef::metadata_id).unwrap_or(ObjectId::NULL)
}

/// Both sides touched the tree at `path`; only its default feature type can
/// conflict here
fn check_tree_metadata(report: &mut MergeScenarioReport, path: &str, ours: &DiffEntry, theirs: &DiffEntry) {
    let ours_md = new_metadata(ours);
    let theirs_md = new_metadata(theirs);
    if ours_md == theirs_md {
        return;
    }
    let ancestor_md = old_metadata(theirs);
    if ours_md == ancestor_md {
        // only theirs changed the feature type
        report.unconflicted.push(theirs.clone());
    } else if theirs_md != ancestor_md {
        report
            .conflicts
            .push(Conflict::new(path, ancestor_md, ours_md, theirs_md));
    }
}

/// Combine attribute changes made to the same feature on both sides
fn merge_features(
    store: &dyn ObjectStore,
    report: &mut MergeScenarioReport,
    ours: &DiffEntry,
    theirs: DiffEntry,
) -> Result<()> {
    let path = theirs.path();
    let conflict = Conflict::new(
        path.as_str(),
        theirs.old_object_id(),
        ours.new_object_id(),
        theirs.new_object_id(),
    );
    let ancestor_md = old_metadata(&theirs);
    if new_metadata(ours) != ancestor_md || new_metadata(&theirs) != ancestor_md {
        report.conflicts.push(conflict);
        return Ok(());
    }

    let ancestor = store.get_feature(&theirs.old_object_id())?;
    let ours_feature = store.get_feature(&ours.new_object_id())?;
    let theirs_feature = store.get_feature(&theirs.new_object_id())?;
    let Some(values) = merge_values(
        ancestor.values(),
        ours_feature.values(),
        theirs_feature.values(),
    ) else {
        report.conflicts.push(conflict);
        return Ok(());
    };

    let merged = RevFeature::new(values);
    if merged.id() == theirs_feature.id() {
        report.unconflicted.push(theirs);
    } else if merged.id() != ours_feature.id() {
        let Some(ours_new) = ours.new_ref() else {
            return Err(Error::IllegalState(format!("modified entry {} has no new node", path)));
        };
        let node = ours_new.node().with_object_id(merged.id());
        let new = NodeRef::new(ours_new.parent_path(), node, ours_new.metadata_id());
        report.merged.push(MergedFeature {
            entry: DiffEntry::new(ours.new_ref().cloned(), Some(new)),
            feature: merged,
        });
    }
    Ok(())
}

/// Attribute-wise three-way merge; `None` when both sides changed the same
/// attribute differently or the schemas disagree
fn merge_values(ancestor: &[Value], ours: &[Value], theirs: &[Value]) -> Option<Vec<Value>> {
    if ancestor.len() != ours.len() || ancestor.len() != theirs.len() {
        return None;
    }
    ancestor
        .iter()
        .zip(ours)
        .zip(theirs)
        .map(|((base, o), t)| {
            if o == base || o == t {
                Some(t.clone())
            } else if t == base {
                Some(o.clone())
            } else {
                None
            }
        })
        .collect()
}

/// Apply a report on top of the current index and working tree: stage every
/// unconflicted and merged change, then record the conflicts. Conflicted
/// paths keep `ours` in both trees.
pub fn apply_report(repo: &Repository, report: &MergeScenarioReport) -> Result<()> {
    let features: Vec<RevObject> = report
        .merged
        .iter()
        .map(|m| RevObject::from(m.feature.clone()))
        .collect();
    if !features.is_empty() {
        repo.objects().put_all(&mut features.into_iter(), &NoopListener)?;
    }
    let index = repo.staging_area();
    let new_root = index.stage(report.changes().cloned())?;
    repo.working_tree().update_work_head(&new_root)?;
    if report.has_conflicts() {
        repo.conflicts().add_conflicts(None, &report.conflicts)?;
        debug!(conflicts = report.conflicts.len(), "Recorded merge conflicts");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Node, RevFeatureType, AttributeDescriptor, FieldType};
    use crate::progress::DefaultProgressListener;
    use crate::storage::HeapObjectStore;
    use crate::tree::TreeEditor;

    fn feature(values: &[i32]) -> RevFeature {
        RevFeature::new(values.iter().map(|v| Value::Int(*v)).collect())
    }

    fn tree(store: &HeapObjectStore, features: &[(&str, &RevFeature)]) -> ObjectId {
        let mut editor = TreeEditor::new(store);
        for (path, f) in features {
            store.put(&RevObject::from((*f).clone())).unwrap();
            editor.put(path, Node::feature("x", f.id(), None, None));
        }
        editor.apply(&ObjectId::NULL).unwrap()
    }

    fn report(store: &HeapObjectStore, a: &ObjectId, o: &ObjectId, t: &ObjectId) -> MergeScenarioReport {
        report_merge_scenario(store, a, o, t, &DefaultProgressListener::new()).unwrap()
    }

    #[test]
    fn test_merge_values() {
        assert_eq!(
            merge_values(&[Value::Int(1), Value::Int(2)], &[Value::Int(5), Value::Int(2)], &[Value::Int(1), Value::Int(7)]),
            Some(vec![Value::Int(5), Value::Int(7)])
        );
        assert_eq!(
            merge_values(&[Value::Int(1)], &[Value::Int(2)], &[Value::Int(3)]),
            None
        );
        assert_eq!(merge_values(&[Value::Int(1)], &[Value::Int(1), Value::Int(2)], &[Value::Int(1)]), None);
    }

    #[test]
    fn test_delete_modify_conflict() {
        let store = HeapObjectStore::new();
        let f1 = feature(&[1]);
        let f1b = feature(&[2]);
        let ancestor = tree(&store, &[("layer/f1", &f1), ("layer/f2", &f1)]);
        let ours = tree(&store, &[("layer/f2", &f1)]);
        let theirs = tree(&store, &[("layer/f1", &f1b), ("layer/f2", &f1)]);

        let r = report(&store, &ancestor, &ours, &theirs);
        assert_eq!(r.conflicts.len(), 1);
        let c = &r.conflicts[0];
        assert_eq!(c.path(), "layer/f1");
        assert_eq!(c.ancestor(), f1.id());
        assert!(c.ours().is_null());
        assert_eq!(c.theirs(), f1b.id());
        assert!(r.merged.is_empty());
    }

    #[test]
    fn test_one_sided_changes() {
        let store = HeapObjectStore::new();
        let f = feature(&[1]);
        let g = feature(&[2]);
        let ancestor = tree(&store, &[("l/a", &f)]);
        let ours = tree(&store, &[("l/a", &f), ("l/ours", &g)]);
        let theirs = tree(&store, &[("l/a", &g), ("l/theirs", &g)]);

        let r = report(&store, &ancestor, &ours, &theirs);
        assert!(!r.has_conflicts());
        let mut paths: Vec<String> = r.unconflicted.iter().filter(|e| !e.is_tree()).map(DiffEntry::path).collect();
        paths.sort();
        assert_eq!(paths, vec!["l/a", "l/theirs"]);
    }

    #[test]
    fn test_same_change_both_sides() {
        let store = HeapObjectStore::new();
        let f = feature(&[1]);
        let g = feature(&[2]);
        let ancestor = tree(&store, &[("l/a", &f)]);
        let both = tree(&store, &[("l/a", &g), ("l/new", &g)]);
        let r = report(&store, &ancestor, &both, &both);
        assert!(r.is_empty());
    }

    #[test]
    fn test_both_added_differently() {
        let store = HeapObjectStore::new();
        let ancestor = tree(&store, &[("l/x", &feature(&[0]))]);
        let ours = tree(&store, &[("l/x", &feature(&[0])), ("l/a", &feature(&[1]))]);
        let theirs = tree(&store, &[("l/x", &feature(&[0])), ("l/a", &feature(&[2]))]);
        let r = report(&store, &ancestor, &ours, &theirs);
        assert_eq!(r.conflicts.len(), 1);
        assert!(r.conflicts[0].ancestor().is_null());
    }

    #[test]
    fn test_attribute_merge() {
        let store = HeapObjectStore::new();
        let ancestor = tree(&store, &[("l/a", &feature(&[1, 1]))]);
        let ours = tree(&store, &[("l/a", &feature(&[2, 1]))]);
        let theirs = tree(&store, &[("l/a", &feature(&[1, 3]))]);
        let r = report(&store, &ancestor, &ours, &theirs);
        assert!(!r.has_conflicts());
        assert_eq!(r.merged.len(), 1);
        assert_eq!(r.merged[0].feature, feature(&[2, 3]));
        assert_eq!(r.merged[0].entry.new_object_id(), feature(&[2, 3]).id());
        assert_eq!(r.merged[0].entry.path(), "l/a");

        // both changed the same attribute
        let theirs = tree(&store, &[("l/a", &feature(&[5, 1]))]);
        let r = report(&store, &ancestor, &ours, &theirs);
        assert_eq!(r.conflicts.len(), 1);
    }

    #[test]
    fn test_removed_tree_modified_child() {
        let store = HeapObjectStore::new();
        let f = feature(&[1]);
        let ancestor = tree(&store, &[("l/a", &f), ("m/b", &f)]);
        let ours = tree(&store, &[("m/b", &f)]);
        let theirs = tree(&store, &[("l/a", &feature(&[9])), ("m/b", &f)]);
        let r = report(&store, &ancestor, &ours, &theirs);
        let mut paths: Vec<&str> = r.conflicts.iter().map(Conflict::path).collect();
        paths.sort();
        assert_eq!(paths, vec!["l", "l/a"]);
    }

    #[test]
    fn test_tree_feature_type_conflict() {
        let store = HeapObjectStore::new();
        let ft = |n: &str| RevFeatureType::new(n, vec![AttributeDescriptor::new("v", FieldType::Int)], None);
        let (a, b) = (ft("a"), ft("b"));
        let with_type = |md: Option<ObjectId>| {
            let mut editor = TreeEditor::new(&store);
            editor.ensure_tree("l", md);
            editor.apply(&ObjectId::NULL).unwrap()
        };
        let ancestor = with_type(None);
        let r = report(&store, &ancestor, &with_type(Some(a.id())), &with_type(Some(b.id())));
        assert_eq!(r.conflicts.len(), 1);
        assert_eq!(r.conflicts[0].ours(), a.id());
        assert_eq!(r.conflicts[0].theirs(), b.id());

        let r = report(&store, &ancestor, &ancestor, &with_type(Some(b.id())));
        assert!(!r.has_conflicts());
        assert_eq!(r.unconflicted.len(), 1);
    }

    #[test]
    fn test_apply_report() {
        let repo = Repository::in_memory(Default::default()).unwrap();
        let store = repo.objects();
        let f = feature(&[1, 1]);
        let mut editor = TreeEditor::new(store);
        store.put(&RevObject::from(f.clone())).unwrap();
        editor.put("l/a", Node::feature("a", f.id(), None, None));
        editor.put("l/b", Node::feature("b", f.id(), None, None));
        let ancestor = editor.apply(&ObjectId::NULL).unwrap();

        let edit = |changes: &[(&str, RevFeature)]| {
            let mut editor = TreeEditor::new(store);
            for (path, feature) in changes {
                store.put(&RevObject::from(feature.clone())).unwrap();
                editor.put(path, Node::feature("x", feature.id(), None, None));
            }
            editor.apply(&ancestor).unwrap()
        };
        let ours = edit(&[("l/a", feature(&[2, 1])), ("l/b", feature(&[7, 7]))]);
        let theirs = edit(&[("l/a", feature(&[1, 3])), ("l/b", feature(&[8, 8]))]);
        repo.staging_area().update_stage_head(&ours).unwrap();
        repo.working_tree().update_work_head(&ours).unwrap();

        let r = report_merge_scenario(store, &ancestor, &ours, &theirs, &DefaultProgressListener::new()).unwrap();
        apply_report(&repo, &r).unwrap();

        let merged = repo.staging_area().find("l/a").unwrap().unwrap();
        assert_eq!(merged.object_id(), feature(&[2, 3]).id());
        assert!(store.exists(&merged.object_id()).unwrap());
        assert_eq!(repo.working_tree().tree_id().unwrap(), repo.staging_area().tree_id().unwrap());
        let conflict = repo.conflicts().get_conflict(None, "l/b").unwrap().unwrap();
        assert_eq!(conflict.ours(), feature(&[7, 7]).id());
        assert_eq!(repo.staging_area().find("l/b").unwrap().unwrap().object_id(), feature(&[7, 7]).id());
    }
}
