//! Sketch discovery and in-memory source overrides.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Extensions treated as compilation units inside a sketch.
const SOURCE_EXTENSIONS: &[&str] = &["ino", "cpp", "c", "S"];

/// Errors while loading a sketch or validating overrides against it.
#[derive(Debug, Error)]
pub enum SketchError {
    /// The sketch directory does not exist or is not a directory.
    #[error("sketch path {0} is not a directory")]
    NotADirectory(PathBuf),
    /// The `<dir-name>.ino` primary file is missing.
    #[error("missing primary sketch file {0}")]
    MissingPrimary(PathBuf),
    /// A source override key escapes the sketch directory.
    #[error("source override {0:?} resolves outside the sketch directory")]
    OverrideOutsideSketch(String),
    /// Filesystem failure while scanning the sketch.
    #[error("failed to read sketch: {0}")]
    Io(#[from] std::io::Error),
}

/// A sketch on disk: one primary `.ino` plus any additional sources.
#[derive(Debug, Clone)]
pub struct Sketch {
    /// Sketch root directory.
    pub root: PathBuf,
    /// Sketch name (the directory's file name).
    pub name: String,
    /// All compilation units, relative to `root`, primary first and the rest
    /// sorted for deterministic builds.
    pub sources: Vec<PathBuf>,
}

impl Sketch {
    /// Load a sketch from `dir`.
    ///
    /// The primary file must be named after the directory; sibling sources in
    /// the root are collected as additional compilation units.
    pub async fn load(dir: &Path) -> Result<Self, SketchError> {
        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|_| SketchError::NotADirectory(dir.to_path_buf()))?;
        if !meta.is_dir() {
            return Err(SketchError::NotADirectory(dir.to_path_buf()));
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SketchError::NotADirectory(dir.to_path_buf()))?;

        let primary = PathBuf::from(format!("{name}.ino"));
        if !dir.join(&primary).is_file() {
            return Err(SketchError::MissingPrimary(dir.join(&primary)));
        }

        let mut extras = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let is_source = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e));
            if is_source && entry.file_name().as_os_str() != primary.as_os_str() {
                extras.push(PathBuf::from(entry.file_name()));
            }
        }
        extras.sort();

        let mut sources = vec![primary];
        sources.append(&mut extras);

        Ok(Sketch {
            root: dir.to_path_buf(),
            name,
            sources,
        })
    }

    /// The sketch's primary source, relative to [`Sketch::root`].
    pub fn primary(&self) -> &Path {
        &self.sources[0]
    }
}

/// Check that a source-override key stays inside the sketch directory.
///
/// Keys are interpreted relative to the sketch root. Absolute paths and paths
/// whose lexical normalization climbs above the root are rejected; no
/// filesystem access is performed.
pub fn check_override_key(key: &str) -> Result<PathBuf, SketchError> {
    let path = Path::new(key);
    let mut depth: i32 = 0;
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                depth += 1;
                normalized.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(SketchError::OverrideOutsideSketch(key.to_string()));
                }
                normalized.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SketchError::OverrideOutsideSketch(key.to_string()));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(SketchError::OverrideOutsideSketch(key.to_string()));
    }
    Ok(normalized)
}

/// Validate every key of a source-override map.
pub fn check_overrides(overrides: &BTreeMap<String, String>) -> Result<(), SketchError> {
    for key in overrides.keys() {
        check_override_key(key)?;
    }
    Ok(())
}
