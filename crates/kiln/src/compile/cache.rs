//! Build-cache bookkeeping.
//!
//! The cache directory holds intermediate artifacts plus two small markers:
//! a fingerprint written only after a fully successful build, and an
//! in-progress marker present while a build is running. Reuse requires a
//! matching fingerprint and no marker, so cancelled or failed builds are
//! never mistaken for valid cached state.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const FINGERPRINT_FILE: &str = "fingerprint.json";
const IN_PROGRESS_FILE: &str = ".building";

/// Cache bookkeeping failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure underneath the cache directory.
    #[error("build cache error at {path}: {source}")]
    Io {
        /// Cache path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Everything that keys cache validity for one build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    /// Full FQBN string, options included.
    pub fqbn: String,
    /// Sketch root the build came from.
    pub sketch: PathBuf,
    /// Effective build properties.
    pub properties: BTreeMap<String, String>,
    /// Warning level, part of the compiler flag set.
    pub warnings: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Fingerprint {
    key: CacheKey,
    sections: Vec<(String, u64)>,
}

/// A previously completed build found in the cache.
#[derive(Debug, Clone)]
pub struct CachedBuild {
    /// Section sizes recorded when the cached build completed.
    pub sections: Vec<(String, u64)>,
}

/// One build-cache directory.
#[derive(Debug, Clone)]
pub struct BuildCache {
    root: PathBuf,
}

impl BuildCache {
    /// Cache rooted at `root`; the directory is created lazily by
    /// [`BuildCache::begin`].
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory object files are compiled into.
    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("obj")
    }

    /// Discard all cached state, valid or not.
    pub async fn clean(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(path = %self.root.display(), "build cache cleaned");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                path: self.root.clone(),
                source,
            }),
        }
    }

    /// Look for a completed build matching `key`.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CachedBuild> {
        if tokio::fs::try_exists(self.root.join(IN_PROGRESS_FILE))
            .await
            .unwrap_or(false)
        {
            return None;
        }
        let bytes = tokio::fs::read(self.root.join(FINGERPRINT_FILE)).await.ok()?;
        let fingerprint: Fingerprint = serde_json::from_slice(&bytes).ok()?;
        (&fingerprint.key == key).then_some(CachedBuild {
            sections: fingerprint.sections,
        })
    }

    /// Mark a build as in progress, invalidating any previous fingerprint.
    pub async fn begin(&self) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: self.root.clone(),
            source,
        };
        tokio::fs::create_dir_all(self.objects_dir())
            .await
            .map_err(io_err)?;
        remove_if_present(&self.root.join(FINGERPRINT_FILE))
            .await
            .map_err(io_err)?;
        tokio::fs::write(self.root.join(IN_PROGRESS_FILE), b"")
            .await
            .map_err(io_err)
    }

    /// Record a successful build: write the fingerprint, clear the marker.
    pub async fn commit(&self, key: &CacheKey, sections: &[(String, u64)]) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: self.root.clone(),
            source,
        };
        let fingerprint = Fingerprint {
            key: key.clone(),
            sections: sections.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&fingerprint).map_err(|e| CacheError::Io {
            path: self.root.clone(),
            source: io::Error::other(e),
        })?;
        tokio::fs::write(self.root.join(FINGERPRINT_FILE), bytes)
            .await
            .map_err(io_err)?;
        remove_if_present(&self.root.join(IN_PROGRESS_FILE))
            .await
            .map_err(io_err)
    }

    /// Drop markers after a failed or cancelled build so partial state is
    /// never reused. Best effort: the cache must already be unusable.
    pub async fn invalidate(&self) {
        let _ = tokio::fs::remove_file(self.root.join(FINGERPRINT_FILE)).await;
        let _ = tokio::fs::remove_file(self.root.join(IN_PROGRESS_FILE)).await;
    }
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
