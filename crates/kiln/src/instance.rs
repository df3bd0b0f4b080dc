//! Server-side instances: loaded board/platform/library working sets.
//!
//! An instance is an opaque handle a client creates once and then references
//! from every subsequent call, so the daemon parses platform and library
//! metadata a single time instead of per request. Handles are assigned
//! monotonically and are never reused or implicitly destroyed.
//!
//! Loading the working set from disk is delegated to a [`WorkingSetLoader`];
//! index formats and storage are a collaborator's concern, not kiln's.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::board::{Library, Platform};

/// Errors for instance lookups and initialization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstanceError {
    /// The handle does not name a live instance.
    #[error("unknown instance {0}")]
    Unknown(i32),
    /// The instance exists but `Init` has not completed on it.
    #[error("instance {0} is not initialized")]
    NotInitialized(i32),
}

/// Failures while loading the installed working set.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Filesystem failure.
    #[error("failed to read installed metadata: {0}")]
    Io(#[from] std::io::Error),
    /// The installed snapshot could not be parsed.
    #[error("invalid installed metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One client's loaded working set.
///
/// Mutations (initialization, rescans) must hold the write side of the
/// owning `RwLock`; read-only calls share the read side and run concurrently.
#[derive(Debug, Default)]
pub struct InstanceState {
    /// Installed platforms, populated by `Init`.
    pub platforms: Vec<Platform>,
    /// Installed libraries, populated by `Init`.
    pub libraries: Vec<Library>,
    /// Whether `Init` has completed at least once.
    pub initialized: bool,
}

/// Loads the installed platform/library working set.
///
/// The two stages are separate so callers can report progress between them.
#[async_trait]
pub trait WorkingSetLoader: Send + Sync {
    /// Load all installed platforms.
    async fn load_platforms(&self) -> Result<Vec<Platform>, LoadError>;
    /// Load all installed libraries.
    async fn load_libraries(&self) -> Result<Vec<Library>, LoadError>;
}

/// Directory-backed loader reading a flat `installed.json` snapshot.
///
/// A missing snapshot is an empty working set, not an error (fresh host).
#[derive(Debug)]
pub struct DirLoader {
    data_dir: PathBuf,
}

impl DirLoader {
    /// Loader rooted at `data_dir`.
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    async fn snapshot(&self) -> Result<InstalledSnapshot, LoadError> {
        let path = self.data_dir.join("installed.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no installed snapshot, starting empty");
                Ok(InstalledSnapshot::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct InstalledSnapshot {
    #[serde(default)]
    platforms: Vec<Platform>,
    #[serde(default)]
    libraries: Vec<Library>,
}

#[async_trait]
impl WorkingSetLoader for DirLoader {
    async fn load_platforms(&self) -> Result<Vec<Platform>, LoadError> {
        Ok(self.snapshot().await?.platforms)
    }

    async fn load_libraries(&self) -> Result<Vec<Library>, LoadError> {
        Ok(self.snapshot().await?.libraries)
    }
}

/// Registry of live instances, shared by every service on one server.
pub struct InstanceRegistry {
    loader: Arc<dyn WorkingSetLoader>,
    instances: Mutex<HashMap<i32, Arc<RwLock<InstanceState>>>>,
    next_id: AtomicI32,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl InstanceRegistry {
    /// Registry whose instances load through `loader`.
    pub fn new(loader: Arc<dyn WorkingSetLoader>) -> Self {
        Self {
            loader,
            instances: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
        }
    }

    /// The loader instances initialize from.
    pub fn loader(&self) -> Arc<dyn WorkingSetLoader> {
        Arc::clone(&self.loader)
    }

    /// Create a new, uninitialized instance and return its handle.
    pub fn create(&self) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut instances = lock(&self.instances);
        instances.insert(id, Arc::new(RwLock::new(InstanceState::default())));
        debug!(instance = id, "instance created");
        id
    }

    /// Look up an instance by handle.
    pub fn get(&self, id: i32) -> Result<Arc<RwLock<InstanceState>>, InstanceError> {
        lock(&self.instances)
            .get(&id)
            .cloned()
            .ok_or(InstanceError::Unknown(id))
    }

    /// Drop an instance. Calls holding the state `Arc` finish undisturbed.
    pub fn destroy(&self, id: i32) -> Result<(), InstanceError> {
        lock(&self.instances)
            .remove(&id)
            .map(|_| debug!(instance = id, "instance destroyed"))
            .ok_or(InstanceError::Unknown(id))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
