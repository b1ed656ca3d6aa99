//! Repository: the stores plus the refs tying them together
//!
//! On disk a repository directory holds `config.json` and one sled
//! database per store:
//!
//! ```text
//! <repo>/config.json
//! <repo>/objects/
//! <repo>/graph/
//! <repo>/refs/
//! <repo>/conflicts/.default/   (one directory per transaction namespace)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::codec::ObjectCodec;
use crate::config::{Backend, CONFIG_FILE, DefaultPlatform, Platform, RepositoryConfig};
use crate::conflicts::{ConflictsDatabase, HeapConflictsDatabase, SledConflictsDatabase};
use crate::error::{Error, Result};
use crate::graph::{GraphDatabase, HeapGraphDatabase, SledGraphDatabase};
use crate::id::ObjectId;
use crate::object::{RevCommit, RevPerson, RevTree};
use crate::odb::ObjectDatabase;
use crate::refs::{self, HeapRefDatabase, RefDatabase, SledRefDatabase};
use crate::rev_parse;
use crate::storage::{ConnectionManager, HeapObjectStore, ObjectStore, SledObjectStore, SledStoreOptions};
use crate::workspace::{StagingArea, WorkingTree};

pub struct Repository {
    path: Option<PathBuf>,
    config: RepositoryConfig,
    objects: Arc<ObjectDatabase>,
    refs: Arc<dyn RefDatabase>,
    conflicts: Arc<dyn ConflictsDatabase>,
    platform: Arc<dyn Platform>,
}

impl Repository {
    /// Create a repository at `path`
    pub fn init(path: &Path, config: RepositoryConfig) -> Result<Self> {
        Self::init_with(path, config, &ConnectionManager::new())
    }

    pub fn init_with(path: &Path, mut config: RepositoryConfig, manager: &ConnectionManager) -> Result<Self> {
        if path.join(CONFIG_FILE).exists() {
            return Err(Error::IllegalState(format!(
                "{} is already a repository",
                path.display()
            )));
        }
        if config.read_only {
            return Err(Error::InvalidArgument("cannot create a read-only repository".to_string()));
        }
        std::fs::create_dir_all(path)?;
        if config.uuid.is_empty() {
            config.uuid = RepositoryConfig::generate().uuid;
        }
        config.save(path)?;
        let repo = Self::assemble(Some(path), config, manager)?;
        repo.init_head()?;
        info!(path = %path.display(), uuid = %repo.config.uuid, "Initialized repository");
        Ok(repo)
    }

    /// Open an existing repository
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &ConnectionManager::new())
    }

    /// Open an existing repository sharing database handles through
    /// `manager`
    pub fn open_with(path: &Path, manager: &ConnectionManager) -> Result<Self> {
        if !path.join(CONFIG_FILE).exists() {
            return Err(Error::IllegalState(format!(
                "{} is not a repository",
                path.display()
            )));
        }
        let config = RepositoryConfig::load(path)?;
        Self::assemble(Some(path), config, manager)
    }

    /// Transient repository held entirely in memory
    pub fn in_memory(mut config: RepositoryConfig) -> Result<Self> {
        config.backend = Backend::Heap;
        if config.uuid.is_empty() {
            config.uuid = RepositoryConfig::generate().uuid;
        }
        let repo = Self::assemble(None, config, &ConnectionManager::new())?;
        repo.init_head()?;
        Ok(repo)
    }

    fn assemble(path: Option<&Path>, config: RepositoryConfig, manager: &ConnectionManager) -> Result<Self> {
        let (store, graph, refs, conflicts): (
            Arc<dyn ObjectStore>,
            Arc<dyn GraphDatabase>,
            Arc<dyn RefDatabase>,
            Arc<dyn ConflictsDatabase>,
        ) = match (config.backend, path) {
            (Backend::Sled, Some(path)) => {
                let options = SledStoreOptions {
                    read_only: config.read_only,
                    sync_writes: config.sync_writes,
                    batch_size: config.put_all_batch_size.max(1),
                    codec: ObjectCodec::CURRENT,
                };
                (
                    Arc::new(SledObjectStore::open(manager, &path.join("objects"), options)?),
                    Arc::new(SledGraphDatabase::open(manager, &path.join("graph"), config.read_only)?),
                    Arc::new(SledRefDatabase::open(manager, &path.join("refs"), config.read_only)?),
                    Arc::new(SledConflictsDatabase::open(manager, &path.join("conflicts"), config.read_only)?),
                )
            }
            _ => (
                Arc::new(HeapObjectStore::new()),
                Arc::new(HeapGraphDatabase::new()),
                Arc::new(HeapRefDatabase::new()),
                Arc::new(HeapConflictsDatabase::new()),
            ),
        };
        Ok(Self {
            path: path.map(Path::to_path_buf),
            objects: Arc::new(ObjectDatabase::new(store, graph, config.object_cache_size)),
            config,
            refs,
            conflicts,
            platform: Arc::new(DefaultPlatform),
        })
    }

    fn init_head(&self) -> Result<()> {
        if self.refs.get_raw(refs::HEAD)?.is_none() {
            self.refs.put_symref(refs::HEAD, refs::MASTER)?;
        }
        Ok(())
    }

    /// Replace the clock and timezone source
    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    // ==================== Accessors ====================

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Object database; puts of commits also update the graph
    pub fn objects(&self) -> &ObjectDatabase {
        &self.objects
    }

    pub fn graph(&self) -> &dyn GraphDatabase {
        self.objects.graph().as_ref()
    }

    pub fn refs(&self) -> &dyn RefDatabase {
        self.refs.as_ref()
    }

    pub fn conflicts(&self) -> &dyn ConflictsDatabase {
        self.conflicts.as_ref()
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn working_tree(&self) -> WorkingTree<'_> {
        WorkingTree::new(self)
    }

    pub fn staging_area(&self) -> StagingArea<'_> {
        StagingArea::new(self)
    }

    // ==================== HEAD ====================

    /// Commit HEAD points at, `None` on an unborn branch
    pub fn head_id(&self) -> Result<Option<ObjectId>> {
        self.refs.resolve_id(refs::HEAD)
    }

    pub fn head_commit(&self) -> Result<Option<RevCommit>> {
        self.head_id()?
            .map(|id| self.objects.get_commit(&id))
            .transpose()
    }

    /// Root tree of the HEAD commit, the empty tree on an unborn branch
    pub fn head_tree_id(&self) -> Result<ObjectId> {
        Ok(self
            .head_commit()?
            .map(|c| c.tree_id())
            .unwrap_or_else(RevTree::empty_id))
    }

    /// Full name of the checked out branch, `None` when HEAD is detached
    pub fn current_branch(&self) -> Result<Option<String>> {
        self.refs.symref_target(refs::HEAD)
    }

    /// Move the checked out branch, or the detached HEAD, to `id`
    pub fn update_head(&self, id: &ObjectId) -> Result<()> {
        match self.current_branch()? {
            Some(branch) => self.refs.put_ref(&branch, id),
            None => self.refs.put_ref(refs::HEAD, id),
        }
    }

    /// Root tree of `commit_id`, the empty tree for the null id
    pub fn commit_tree_id(&self, commit_id: &ObjectId) -> Result<ObjectId> {
        if commit_id.is_null() {
            return Ok(RevTree::empty_id());
        }
        Ok(self.objects.get_commit(commit_id)?.tree_id())
    }

    // ==================== Helpers ====================

    /// Resolve a revision expression to an object id
    pub fn resolve(&self, spec: &str) -> Result<Option<ObjectId>> {
        rev_parse::rev_parse(self, spec)
    }

    /// Resolve a revision expression to a commit, peeling tags
    pub fn resolve_commit(&self, spec: &str) -> Result<RevCommit> {
        rev_parse::resolve_commit(self, spec)
    }

    /// Identity for a commit made now
    pub fn person(&self) -> Result<RevPerson> {
        self.config.person(self.platform.as_ref())
    }

    pub fn has_conflicts(&self) -> Result<bool> {
        self.conflicts.has_conflicts(None)
    }

    /// Whether the index and working tree both match HEAD
    pub fn is_clean(&self) -> Result<bool> {
        let head = self.head_tree_id()?;
        Ok(self.staging_area().tree_id()? == head && self.working_tree().tree_id()? == head)
    }
}
