//! Repository lifecycle
//!
//! A `Repository` is the process-wide handle to one store. It owns the
//! container, the item and version tables, the value file store and the
//! optional full-text index, and hands out [`RepositoryView`]s.
//!
//! ## Lifecycle
//!
//! ```text
//! create | open | ephemeral  →  [create_view / close_view]*  →  close
//! ```
//!
//! Durable repositories live in a directory holding `cairn.toml`, the
//! container log and a `.lock` file held exclusively while open.

use crate::config::{RepositoryConfig, CONFIG_FILE_NAME};
use crate::view::RepositoryView;
use cairn_core::{Container, Error, ItemId, Result, Schema, Version};
use cairn_search::FullTextIndex;
use cairn_storage::{
    BlockFileStore, CommitRecord, ItemRecord, ItemStore, KvContainer, VersionLog, INDEX_BLOCK_SHIFT,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Container log file inside the repository directory
pub const CONTAINER_FILE_NAME: &str = "repository.log";
const LOCK_FILE_NAME: &str = ".lock";

/// Store behind a repository, shared with its views
pub(crate) struct RepoInner {
    pub path: Option<PathBuf>,
    pub config: RepositoryConfig,
    pub schema: Arc<Schema>,
    pub container: Arc<dyn Container>,
    pub items: ItemStore,
    pub log: VersionLog,
    pub files: BlockFileStore,
    pub full_text: Option<FullTextIndex>,
    pub version: AtomicU64,
    /// Serializes the check-and-write section of commits
    pub commit_lock: Mutex<()>,
    views: Mutex<BTreeMap<u64, String>>,
    next_view: AtomicU64,
    open: AtomicBool,
    lock_file: Mutex<Option<File>>,
}

impl RepoInner {
    pub fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::RepositoryClosed)
        }
    }

    pub fn latest(&self) -> Version {
        self.version.load(Ordering::Acquire)
    }

    pub fn register_view(&self, name: &str) -> u64 {
        let id = self.next_view.fetch_add(1, Ordering::Relaxed);
        self.views.lock().insert(id, name.to_string());
        id
    }

    pub fn unregister_view(&self, id: u64) {
        self.views.lock().remove(&id);
    }
}

/// One versioned item store
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct Repository {
    pub(crate) inner: Arc<RepoInner>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.inner.path)
            .field("version", &self.inner.latest())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Repository {
    /// Create a new durable repository in `path`
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` if a repository already exists there.
    pub fn create(path: impl AsRef<Path>, schema: Schema) -> Result<Self> {
        Self::create_with_config(path, schema, RepositoryConfig::default())
    }

    /// Create a new durable repository with an explicit configuration
    pub fn create_with_config(
        path: impl AsRef<Path>,
        schema: Schema,
        config: RepositoryConfig,
    ) -> Result<Self> {
        let dir = path.as_ref();
        if dir.join(CONTAINER_FILE_NAME).exists() {
            return Err(Error::invalid_state(format!(
                "repository already exists at '{}'",
                dir.display()
            )));
        }
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        config.write_to_file(&dir.join(CONFIG_FILE_NAME))?;
        Self::open_dir(dir, schema, config)
    }

    /// Open an existing durable repository
    ///
    /// Settings come from `cairn.toml`; a default one is written if missing.
    ///
    /// # Errors
    ///
    /// `Error::FileNotFound` if there is no repository at `path`.
    pub fn open(path: impl AsRef<Path>, schema: Schema) -> Result<Self> {
        let dir = path.as_ref();
        if !dir.join(CONTAINER_FILE_NAME).exists() {
            return Err(Error::FileNotFound(dir.display().to_string()));
        }
        let config_path = dir.join(CONFIG_FILE_NAME);
        RepositoryConfig::write_default_if_missing(&config_path)?;
        let config = RepositoryConfig::from_file(&config_path)?;
        Self::open_dir(dir, schema, config)
    }

    /// Open an in-memory repository
    pub fn ephemeral(schema: Schema) -> Result<Self> {
        Self::ephemeral_with_config(schema, RepositoryConfig::default())
    }

    /// Open an in-memory repository with an explicit configuration
    pub fn ephemeral_with_config(schema: Schema, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let container: Arc<dyn Container> = Arc::new(
            KvContainer::in_memory()
                .with_lock_timeout(Duration::from_millis(config.lock_timeout_ms)),
        );
        Self::assemble(None, container, schema, config, None)
    }

    /// Assemble a repository over any container
    ///
    /// Used for in-memory stores and for injecting containers in tests.
    pub fn with_container(
        container: Arc<dyn Container>,
        schema: Schema,
        config: RepositoryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(None, container, schema, config, None)
    }

    fn open_dir(dir: &Path, schema: Schema, config: RepositoryConfig) -> Result<Self> {
        let canonical = dir.canonicalize()?;
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(canonical.join(LOCK_FILE_NAME))?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            Error::invalid_state(format!(
                "repository at '{}' is already in use by another process",
                canonical.display()
            ))
        })?;

        let container: Arc<dyn Container> = Arc::new(
            KvContainer::open(canonical.join(CONTAINER_FILE_NAME))?
                .with_lock_timeout(Duration::from_millis(config.lock_timeout_ms)),
        );
        Self::assemble(Some(canonical), container, schema, config, Some(lock_file))
    }

    fn assemble(
        path: Option<PathBuf>,
        container: Arc<dyn Container>,
        schema: Schema,
        config: RepositoryConfig,
        lock_file: Option<File>,
    ) -> Result<Self> {
        let items = ItemStore::new(Arc::clone(&container));
        let log = VersionLog::new(Arc::clone(&container));
        let files = BlockFileStore::new(Arc::clone(&container), "values", config.block_shift)?;
        let full_text = if config.full_text {
            let store = BlockFileStore::new(Arc::clone(&container), "fulltext", INDEX_BLOCK_SHIFT)?;
            Some(FullTextIndex::open(store)?)
        } else {
            None
        };
        let version = log.latest()?;

        info!(
            path = ?path,
            version,
            full_text = full_text.is_some(),
            "Opened repository"
        );

        Ok(Self {
            inner: Arc::new(RepoInner {
                path,
                config,
                schema: Arc::new(schema),
                container,
                items,
                log,
                files,
                full_text,
                version: AtomicU64::new(version),
                commit_lock: Mutex::new(()),
                views: Mutex::new(BTreeMap::new()),
                next_view: AtomicU64::new(1),
                open: AtomicBool::new(true),
                lock_file: Mutex::new(lock_file),
            }),
        })
    }

    /// Close the repository
    ///
    /// Views still open fail with `Error::RepositoryClosed` afterwards. The
    /// directory lock is released. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let open_views = self.inner.views.lock().len();
        self.inner.lock_file.lock().take();
        info!(
            path = ?self.inner.path,
            version = self.inner.latest(),
            open_views,
            "Closed repository"
        );
        Ok(())
    }

    /// True until [`close`](Self::close)
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Repository directory, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Active configuration
    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// Schema items are checked against
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Latest committed version
    pub fn latest_version(&self) -> Version {
        self.inner.latest()
    }

    /// Store for large values kept as block files
    pub fn files(&self) -> &BlockFileStore {
        &self.inner.files
    }

    /// Full-text index, when enabled
    pub fn full_text(&self) -> Option<&FullTextIndex> {
        self.inner.full_text.as_ref()
    }

    /// Open a view
    ///
    /// `name` defaults to the current thread's name. `version` defaults to
    /// the latest committed version and may not exceed it.
    pub fn create_view(&self, name: Option<&str>, version: Option<Version>) -> Result<RepositoryView> {
        self.inner.check_open()?;
        let latest = self.inner.latest();
        let version = version.unwrap_or(latest);
        if version > latest {
            return Err(Error::invalid_state(format!(
                "version {} is newer than the latest committed version {}",
                version, latest
            )));
        }
        let name = match name {
            Some(n) => n.to_string(),
            None => std::thread::current()
                .name()
                .unwrap_or("view")
                .to_string(),
        };
        Ok(RepositoryView::new(self.clone(), name, version))
    }

    /// Names of views currently open
    pub fn open_views(&self) -> Vec<String> {
        self.inner.views.lock().values().cloned().collect()
    }

    /// Commit log, oldest first
    pub fn version_info(&self) -> Result<Vec<CommitRecord>> {
        self.inner.check_open()?;
        self.inner.log.range(1, self.inner.latest())
    }

    /// Every committed record of `item`, oldest first
    pub fn item_versions(&self, item: ItemId) -> Result<Vec<(Version, ItemRecord)>> {
        self.inner.check_open()?;
        self.inner.items.history(item)
    }

    /// Merge full-text segments
    pub fn optimize_index(&self) -> Result<()> {
        self.inner.check_open()?;
        match &self.inner.full_text {
            Some(index) => index.optimize(),
            None => Ok(()),
        }
    }
}
