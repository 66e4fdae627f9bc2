//! Service configuration.
//!
//! One TOML document selects the storage backend, the index location, and
//! the facade's retry budget at startup. Missing files and missing keys
//! fall back to defaults, so an empty deployment starts with the embedded
//! branch backend and an in-memory index.

use anyhow::{Context, Result};
use keel_search::TicketIndexer;
use keel_store::{BranchStore, FileStore, MemoryRefDb, RedisStore, TicketStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default = "default_update_retries")]
    pub update_retries: u32,
}

/// Which physical store holds the change logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Branch,
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    /// Root directory of the file backend.
    #[serde(default = "default_file_root")]
    pub root: PathBuf,
    /// Connection URL of the Redis backend.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Per-operation timeout for remote backends, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            root: default_file_root(),
            url: default_redis_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexConfig {
    /// Index database file. `None` keeps the index in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ServiceConfig {
    /// Load configuration from a TOML file, defaulting when it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<Self>(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Construct the configured ticket store.
    ///
    /// The branch backend is built over the in-process [`MemoryRefDb`];
    /// hosts embedding the engine in a real repository construct
    /// [`BranchStore`] directly over their own ref database.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    pub fn build_store(&self) -> Result<Arc<dyn TicketStore>> {
        match self.backend.kind {
            BackendKind::Branch => Ok(Arc::new(BranchStore::new(MemoryRefDb::new()))),
            BackendKind::File => {
                let store = FileStore::open(&self.backend.root).with_context(|| {
                    format!("open file store at {}", self.backend.root.display())
                })?;
                Ok(Arc::new(store))
            }
            BackendKind::Redis => {
                let store = RedisStore::open_with_timeout(
                    &self.backend.url,
                    Duration::from_secs(self.backend.timeout_secs),
                )
                .with_context(|| format!("open redis store at {}", self.backend.url))?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Construct the configured search index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index database cannot be opened or migrated.
    pub fn build_indexer(&self) -> Result<TicketIndexer> {
        match &self.index.path {
            Some(path) => TicketIndexer::open(path),
            None => TicketIndexer::in_memory(),
        }
    }
}

const fn default_update_retries() -> u32 {
    3
}

const fn default_backend_kind() -> BackendKind {
    BackendKind::Branch
}

fn default_file_root() -> PathBuf {
    PathBuf::from("tickets")
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

const fn default_timeout_secs() -> u64 {
    5
}
