//! GeoVCS Core Library
//!
//! Version control for geospatial features:
//! - Object model (features, feature types, trees, commits, tags) and its
//!   content-addressed binary codec
//! - Object, graph, ref and conflict stores over sled or the heap
//! - Bucketed revision trees and a streaming tree diff
//! - Working tree and staging area
//! - Porcelain operations: commit, merge, rebase, cherry-pick, revert,
//!   reset, checkout, branch, tag and log

pub mod ancestor;
pub mod codec;
pub mod config;
pub mod conflicts;
pub mod diff;
pub mod error;
pub mod graph;
pub mod id;
pub mod merge_scenario;
pub mod node_order;
pub mod object;
pub mod odb;
pub mod ops;
pub mod progress;
pub mod refs;
pub mod repository;
pub mod rev_parse;
pub mod storage;
pub mod tree;
pub mod workspace;

pub use config::{Backend, DefaultPlatform, Platform, RepositoryConfig, TestPlatform};
pub use conflicts::{Conflict, ConflictsDatabase};
pub use diff::{ChangeType, DiffEntry, TreeDiff};
pub use error::{Error, Result};
pub use graph::GraphDatabase;
pub use id::ObjectId;
pub use merge_scenario::{MergeScenarioReport, MergedFeature};
pub use object::{
    Envelope, FieldType, Node, NodeKind, ObjectKind, RevCommit, RevFeature, RevFeatureType, RevObject,
    RevPerson, RevTag, RevTree, Value,
};
pub use progress::{DefaultProgressListener, ProgressListener};
pub use refs::{Ref, RefDatabase};
pub use repository::Repository;
pub use storage::ObjectStore;
pub use workspace::{FeatureInfo, StagingArea, WorkingTree};
