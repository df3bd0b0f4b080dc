//! The sketch compilation pipeline.
//!
//! One [`CompileRequest`] turns into a stream of [`CompileEvent`]s: raw
//! stdout/stderr chunks from the toolchain, task progress, and exactly one
//! terminal [`CompileSummary`] on success. On failure the event channel ends
//! without a summary and the caller receives the [`CompileError`] instead;
//! the two terminals are mutually exclusive.
//!
//! Cancellation is the receiver going away: every send and every toolchain
//! step races against the channel closing, and abandoned compiler processes
//! are killed (`kill_on_drop`). A cancelled or failed build invalidates the
//! build cache so partial artifacts are never reused.

pub mod cache;
pub mod toolchain;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::board::{resolve_platforms, Board, Library, PlatformResolution, ResolveError};
use crate::fqbn::{Fqbn, FqbnError};
use crate::instance::InstanceState;
use crate::sketch::{self, Sketch, SketchError};

pub use cache::{BuildCache, CacheError, CacheKey, CachedBuild};
pub use toolchain::{
    CompileUnit, HostToolchainProvider, ProcessToolchain, StepOutput, Toolchain, ToolchainProvider,
};

/// Compiler warning level requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Warnings {
    /// Suppress warnings entirely.
    None,
    /// The platform's default warning set.
    #[default]
    Default,
    /// Default plus `-Wall`.
    More,
    /// Everything: `-Wall -Wextra`.
    All,
}

/// Error for unrecognized warning-level strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid warning level {0:?}")]
pub struct InvalidWarningLevel(String);

impl Warnings {
    /// Canonical name, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Warnings::None => "none",
            Warnings::Default => "default",
            Warnings::More => "more",
            Warnings::All => "all",
        }
    }

    /// Compiler flags implementing this level.
    pub fn flags(&self) -> &'static [&'static str] {
        match self {
            Warnings::None => &["-w"],
            Warnings::Default => &[],
            Warnings::More => &["-Wall"],
            Warnings::All => &["-Wall", "-Wextra"],
        }
    }
}

impl FromStr for Warnings {
    type Err = InvalidWarningLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // An unset wire field means the default level.
            "" | "default" => Ok(Warnings::Default),
            "none" => Ok(Warnings::None),
            "more" => Ok(Warnings::More),
            "all" => Ok(Warnings::All),
            other => Err(InvalidWarningLevel(other.to_string())),
        }
    }
}

/// References to the keys used to sign/encrypt the final image.
///
/// Forwarded to the toolchain as `build.keys.*` properties; kiln does not
/// interpret them further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeys {
    /// Directory holding the keychain.
    pub keychain: String,
    /// Name of the signing key.
    pub sign_key: String,
    /// Name of the encryption key, if the image is to be encrypted.
    pub encrypt_key: Option<String>,
}

/// Immutable description of one compilation.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Target board, as an FQBN string.
    pub fqbn: String,
    /// Sketch directory.
    pub sketch_path: PathBuf,
    /// Where build artifacts go; a temp directory per sketch when unset.
    pub build_path: Option<PathBuf>,
    /// Reusable intermediate-artifact directory; defaults under the build
    /// path. Supplying the same path across calls is what enables reuse.
    pub build_cache_path: Option<PathBuf>,
    /// Additional library search paths.
    pub libraries: Vec<PathBuf>,
    /// Build property overrides, highest precedence.
    pub build_properties: BTreeMap<String, String>,
    /// Warning level.
    pub warnings: Warnings,
    /// Max concurrent compiler invocations; 0 means all logical CPUs.
    pub jobs: u32,
    /// In-memory replacements for sketch files, keyed by sketch-relative
    /// path. Keys resolving outside the sketch are rejected.
    pub source_override: BTreeMap<String, String>,
    /// Only print the effective build properties.
    pub show_properties: bool,
    /// Only run the preprocessor on the primary source.
    pub preprocess_only: bool,
    /// Only produce `compile_commands.json`.
    pub compilation_db_only: bool,
    /// Discard cached state before building, regardless of validity.
    pub clean: bool,
    /// Copy final binaries next to the sketch.
    pub export_binaries: bool,
    /// Signing/encryption key references, if any.
    pub keys: Option<SigningKeys>,
}

impl CompileRequest {
    /// A request with defaults for everything but the target and sketch.
    pub fn new(fqbn: impl Into<String>, sketch_path: impl Into<PathBuf>) -> Self {
        Self {
            fqbn: fqbn.into(),
            sketch_path: sketch_path.into(),
            build_path: None,
            build_cache_path: None,
            libraries: Vec::new(),
            build_properties: BTreeMap::new(),
            warnings: Warnings::default(),
            jobs: 0,
            source_override: BTreeMap::new(),
            show_properties: false,
            preprocess_only: false,
            compilation_db_only: false,
            clean: false,
            export_binaries: false,
            keys: None,
        }
    }

    /// Filesystem-free validation, safe to run before any stream starts:
    /// parses the FQBN, rejects conflicting short-circuit modes and
    /// out-of-tree source overrides.
    pub fn validate(&self) -> Result<Fqbn, CompileError> {
        let fqbn: Fqbn = self.fqbn.parse()?;
        let modes = [
            self.show_properties,
            self.preprocess_only,
            self.compilation_db_only,
        ];
        if modes.iter().filter(|on| **on).count() > 1 {
            return Err(CompileError::ConflictingModes);
        }
        sketch::check_overrides(&self.source_override)?;
        Ok(fqbn)
    }

    /// Concurrency cap for this request's compiler invocations.
    pub fn resolved_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs as usize
        }
    }
}

/// Progress of one named task within a compile.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    /// Task name (stable across updates of the same task).
    pub name: String,
    /// Human-readable detail.
    pub message: String,
    /// Completion percentage, 0..=100.
    pub percent: f32,
    /// Whether the task finished.
    pub completed: bool,
}

/// Occupied and allowed size for one section of the produced binary.
///
/// Advisory only: nothing here enforces the maxima.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableSectionSize {
    /// Section name (`text`, `data`, ...).
    pub name: String,
    /// Occupied bytes.
    pub size: i64,
    /// Board-declared budget, -1 when the board declares none.
    pub max_size: i64,
}

/// Terminal result of a successful compile.
#[derive(Debug, Clone)]
pub struct CompileSummary {
    /// Resolved build directory.
    pub build_path: PathBuf,
    /// Libraries the sketch actually used.
    pub used_libraries: Vec<Library>,
    /// Per-section size accounting of the produced executable.
    pub executable_sections: Vec<ExecutableSectionSize>,
    /// Platform that supplied the board definition.
    pub board_platform: String,
    /// Platform that supplied the build core/toolchain.
    pub build_platform: String,
}

/// One emitted value in a compile's response stream.
#[derive(Debug, Clone)]
pub enum CompileEvent {
    /// Raw toolchain stdout chunk.
    Stdout(Vec<u8>),
    /// Raw toolchain stderr chunk.
    Stderr(Vec<u8>),
    /// Task progress update.
    Progress(TaskProgress),
    /// Terminal summary; sent exactly once, last, and only on success.
    Finished(CompileSummary),
}

/// Why a compile did not produce a summary.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Bad FQBN in the request.
    #[error(transparent)]
    Fqbn(#[from] FqbnError),
    /// Bad warning level in the request.
    #[error(transparent)]
    Warnings(#[from] InvalidWarningLevel),
    /// Sketch missing/invalid, or an override escapes it.
    #[error(transparent)]
    Sketch(#[from] SketchError),
    /// FQBN does not match the instance's installed platforms.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// More than one of the introspection-only modes requested.
    #[error("show_properties, preprocess and compilation-database modes are mutually exclusive")]
    ConflictingModes,
    /// A toolchain step exited non-zero.
    #[error("{step} failed with exit code {code}")]
    ToolchainFailed {
        /// Which step failed.
        step: String,
        /// Its exit code.
        code: i32,
    },
    /// The client went away mid-build.
    #[error("compilation cancelled by the client")]
    Cancelled,
    /// Build-cache bookkeeping failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Other filesystem/process failure.
    #[error("build I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CompileError {
    /// Whether the caller (not the daemon) is in a position to fix this.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CompileError::Fqbn(_)
                | CompileError::Warnings(_)
                | CompileError::Sketch(_)
                | CompileError::Resolve(_)
                | CompileError::ConflictingModes
        )
    }
}

/// Run one compile, emitting events into `events`.
///
/// Returns `Ok(())` exactly when a [`CompileEvent::Finished`] summary was
/// delivered. The caller holds (at least) a read lock on the instance state
/// for the duration of the call.
pub async fn run(
    state: &InstanceState,
    provider: &dyn ToolchainProvider,
    request: CompileRequest,
    events: mpsc::Sender<CompileEvent>,
) -> Result<(), CompileError> {
    let fqbn = request.validate()?;
    let sketch = Sketch::load(&request.sketch_path).await?;
    let resolution = resolve_platforms(&state.platforms, &fqbn)?;
    let toolchain = provider.toolchain(resolution.build_platform);

    let build_path = request
        .build_path
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("kiln-build-{}", sketch.name)));
    let properties = effective_properties(&request, &fqbn, &build_path, &resolution);

    if request.show_properties {
        let mut listing = String::new();
        for (key, value) in &properties {
            listing.push_str(key);
            listing.push('=');
            listing.push_str(value);
            listing.push('\n');
        }
        send(&events, CompileEvent::Stdout(listing.into_bytes())).await?;
        return finish(&events, summary(&build_path, Vec::new(), Vec::new(), &resolution)).await;
    }

    debug!(fqbn = %fqbn, sketch = %sketch.root.display(), jobs = request.resolved_jobs(), "compile starting");
    progress(&events, "build", "Preparing build", 0.0, false).await?;

    let merged = merge_sources(&sketch, &request.source_override, &build_path).await?;
    let mut flags: Vec<String> = request
        .warnings
        .flags()
        .iter()
        .map(|f| f.to_string())
        .collect();
    for dir in &request.libraries {
        flags.push(format!("-I{}", dir.display()));
    }

    if request.preprocess_only {
        let primary = merged.dir.join(sketch.primary());
        let out = cancellable(&events, toolchain.preprocess(&primary, &flags)).await?;
        let (success, code) = (out.success, out.exit_code);
        forward_step(&events, out).await?;
        if !success {
            return Err(CompileError::ToolchainFailed {
                step: "preprocess".to_string(),
                code,
            });
        }
        return finish(&events, summary(&build_path, Vec::new(), Vec::new(), &resolution)).await;
    }

    let cache = BuildCache::new(
        request
            .build_cache_path
            .clone()
            .unwrap_or_else(|| build_path.join("cache")),
    );
    if request.clean {
        cache.clean().await?;
    }
    let units = plan_units(&merged, &cache);

    if request.compilation_db_only {
        let db_path = build_path.join("compile_commands.json");
        write_compile_commands(&db_path, &merged.dir, &units, toolchain.as_ref(), &flags).await?;
        let note = format!("Compilation database written to {}\n", db_path.display());
        send(&events, CompileEvent::Stdout(note.into_bytes())).await?;
        return finish(&events, summary(&build_path, Vec::new(), Vec::new(), &resolution)).await;
    }

    let used_libraries = detect_used_libraries(&merged.includes, &state.libraries);
    let key = CacheKey {
        fqbn: fqbn.to_string(),
        sketch: sketch.root.clone(),
        properties: properties.clone(),
        warnings: request.warnings.as_str().to_string(),
    };
    let executable = build_path.join(format!("{}.elf", sketch.name));

    let raw_sections = match cache.lookup(&key).await {
        Some(hit) => {
            debug!(cache = %cache.root().display(), "build cache hit");
            progress(&events, "build", "Reusing cached build", 100.0, true).await?;
            if tokio::fs::try_exists(&executable).await.unwrap_or(false) {
                hit.sections
            } else {
                // Cached objects survived but the image is gone: relink only.
                let objects: Vec<PathBuf> = units.iter().map(|u| u.object.clone()).collect();
                let out = cancellable(&events, toolchain.link(&objects, &executable)).await?;
                let (success, code) = (out.success, out.exit_code);
                forward_step(&events, out).await?;
                if !success {
                    cache.invalidate().await;
                    return Err(CompileError::ToolchainFailed {
                        step: "link".to_string(),
                        code,
                    });
                }
                hit.sections
            }
        }
        None => {
            cache.begin().await?;
            match build_all(
                &toolchain,
                &units,
                &flags,
                request.resolved_jobs(),
                &events,
                &executable,
            )
            .await
            {
                Ok(sections) => {
                    cache.commit(&key, &sections).await?;
                    sections
                }
                Err(e) => {
                    cache.invalidate().await;
                    return Err(e);
                }
            }
        }
    };

    if request.export_binaries {
        let export_dir = sketch
            .root
            .join("build")
            .join(fqbn.to_string().replace(':', "."));
        tokio::fs::create_dir_all(&export_dir).await?;
        if let Some(name) = executable.file_name() {
            tokio::fs::copy(&executable, export_dir.join(name)).await?;
        }
    }

    let sections = attach_limits(raw_sections, resolution.board);
    finish(
        &events,
        summary(&build_path, used_libraries, sections, &resolution),
    )
    .await
}

fn summary(
    build_path: &Path,
    used_libraries: Vec<Library>,
    executable_sections: Vec<ExecutableSectionSize>,
    resolution: &PlatformResolution<'_>,
) -> CompileSummary {
    CompileSummary {
        build_path: build_path.to_path_buf(),
        used_libraries,
        executable_sections,
        board_platform: resolution.board_platform.id.clone(),
        build_platform: resolution.build_platform.id.clone(),
    }
}

async fn finish(
    events: &mpsc::Sender<CompileEvent>,
    summary: CompileSummary,
) -> Result<(), CompileError> {
    send(events, CompileEvent::Finished(summary)).await
}

async fn send(events: &mpsc::Sender<CompileEvent>, event: CompileEvent) -> Result<(), CompileError> {
    events
        .send(event)
        .await
        .map_err(|_| CompileError::Cancelled)
}

async fn progress(
    events: &mpsc::Sender<CompileEvent>,
    name: &str,
    message: &str,
    percent: f32,
    completed: bool,
) -> Result<(), CompileError> {
    send(
        events,
        CompileEvent::Progress(TaskProgress {
            name: name.to_string(),
            message: message.to_string(),
            percent,
            completed,
        }),
    )
    .await
}

/// Forward a step's captured output as stream chunks, stdout before stderr.
async fn forward_step(
    events: &mpsc::Sender<CompileEvent>,
    out: StepOutput,
) -> Result<(), CompileError> {
    if !out.stdout.is_empty() {
        send(events, CompileEvent::Stdout(out.stdout)).await?;
    }
    if !out.stderr.is_empty() {
        send(events, CompileEvent::Stderr(out.stderr)).await?;
    }
    Ok(())
}

/// Race a toolchain step against the client going away. Dropping the step's
/// future kills any process it spawned (`kill_on_drop`).
async fn cancellable<T>(
    events: &mpsc::Sender<CompileEvent>,
    step: impl Future<Output = io::Result<T>>,
) -> Result<T, CompileError> {
    tokio::select! {
        out = step => Ok(out?),
        _ = events.closed() => Err(CompileError::Cancelled),
    }
}

/// Sketch sources with overrides applied, written under the build directory.
#[derive(Debug)]
struct MergedSources {
    /// Directory the merged tree was written to.
    dir: PathBuf,
    /// Sketch-relative paths of every compilation unit.
    files: Vec<PathBuf>,
    /// `#include` targets seen across all sources.
    includes: BTreeSet<String>,
}

async fn merge_sources(
    sketch: &Sketch,
    overrides: &BTreeMap<String, String>,
    build_path: &Path,
) -> Result<MergedSources, CompileError> {
    let dir = build_path.join("sketch");
    let mut files = Vec::new();
    let mut includes = BTreeSet::new();
    let mut remaining: BTreeMap<PathBuf, &String> = BTreeMap::new();
    for (key, content) in overrides {
        remaining.insert(sketch::check_override_key(key)?, content);
    }

    for rel in &sketch.sources {
        let content = match remaining.remove(rel.as_path()) {
            Some(replacement) => replacement.clone().into_bytes(),
            None => tokio::fs::read(sketch.root.join(rel)).await?,
        };
        scan_includes(&content, &mut includes);
        write_merged(&dir, rel, &content).await?;
        files.push(rel.clone());
    }

    // Overrides that match no on-disk file become additional units.
    for (rel, content) in remaining {
        let content = content.clone().into_bytes();
        scan_includes(&content, &mut includes);
        write_merged(&dir, &rel, &content).await?;
        files.push(rel);
    }

    Ok(MergedSources {
        dir,
        files,
        includes,
    })
}

async fn write_merged(dir: &Path, rel: &Path, content: &[u8]) -> io::Result<()> {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

/// Collect `#include <X.h>` / `#include "X.h"` targets from one source.
fn scan_includes(content: &[u8], includes: &mut BTreeSet<String>) {
    for line in String::from_utf8_lossy(content).lines() {
        let line = line.trim_start();
        let Some(rest) = line.strip_prefix("#include") else {
            continue;
        };
        let rest = rest.trim_start();
        let (open, close) = match rest.chars().next() {
            Some('<') => ('<', '>'),
            Some('"') => ('"', '"'),
            _ => continue,
        };
        if let Some(inner) = rest
            .strip_prefix(open)
            .and_then(|r| r.split(close).next())
        {
            includes.insert(inner.to_string());
        }
    }
}

/// Libraries whose primary header appears in the sketch's includes.
fn detect_used_libraries(includes: &BTreeSet<String>, installed: &[Library]) -> Vec<Library> {
    installed
        .iter()
        .filter(|lib| includes.contains(&format!("{}.h", lib.name)))
        .cloned()
        .collect()
}

fn plan_units(merged: &MergedSources, cache: &BuildCache) -> Vec<CompileUnit> {
    merged
        .files
        .iter()
        .map(|rel| {
            let flat = rel
                .to_string_lossy()
                .replace(['/', '\\'], "_");
            CompileUnit {
                source: merged.dir.join(rel),
                object: cache.objects_dir().join(format!("{flat}.o")),
            }
        })
        .collect()
}

async fn write_compile_commands(
    db_path: &Path,
    source_dir: &Path,
    units: &[CompileUnit],
    toolchain: &dyn Toolchain,
    flags: &[String],
) -> Result<(), CompileError> {
    let entries: Vec<serde_json::Value> = units
        .iter()
        .map(|unit| {
            serde_json::json!({
                "directory": source_dir.display().to_string(),
                "arguments": toolchain.compile_command_line(unit, flags),
                "file": unit.source.display().to_string(),
            })
        })
        .collect();
    let bytes = serde_json::to_vec_pretty(&entries).map_err(io::Error::other)?;
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(db_path, bytes).await?;
    Ok(())
}

/// Compile every unit (bounded by `jobs` permits), link, and measure.
async fn build_all(
    toolchain: &Arc<dyn Toolchain>,
    units: &[CompileUnit],
    flags: &[String],
    jobs: usize,
    events: &mpsc::Sender<CompileEvent>,
    executable: &Path,
) -> Result<Vec<(String, u64)>, CompileError> {
    let semaphore = Arc::new(Semaphore::new(jobs));
    let total = units.len().max(1);
    let mut set: JoinSet<Result<(), CompileError>> = JoinSet::new();

    for (index, unit) in units.iter().cloned().enumerate() {
        let toolchain = Arc::clone(toolchain);
        let semaphore = Arc::clone(&semaphore);
        let events = events.clone();
        let flags = flags.to_vec();
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| CompileError::Cancelled)?;
            let out = tokio::select! {
                out = toolchain.compile_unit(&unit, &flags) => out?,
                _ = events.closed() => return Err(CompileError::Cancelled),
            };
            let (success, code) = (out.success, out.exit_code);
            forward_step(&events, out).await?;
            if !success {
                return Err(CompileError::ToolchainFailed {
                    step: format!("compiling {}", unit.source.display()),
                    code,
                });
            }
            progress(
                &events,
                "compile",
                &format!("Compiled {}", unit.source.display()),
                (index + 1) as f32 / total as f32 * 80.0,
                false,
            )
            .await
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            // Dropping the set aborts the remaining tasks, which kills
            // their in-flight compiler processes.
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_cancelled() => return Err(CompileError::Cancelled),
            Err(e) => return Err(CompileError::Io(io::Error::other(e))),
        }
    }

    let objects: Vec<PathBuf> = units.iter().map(|u| u.object.clone()).collect();
    let out = cancellable(events, toolchain.link(&objects, executable)).await?;
    let (success, code) = (out.success, out.exit_code);
    forward_step(events, out).await?;
    if !success {
        return Err(CompileError::ToolchainFailed {
            step: "link".to_string(),
            code,
        });
    }
    progress(events, "build", "Linking complete", 90.0, false).await?;

    let sections = cancellable(events, toolchain.sizes(executable)).await?;
    progress(events, "build", "Build complete", 100.0, true).await?;
    Ok(sections)
}

fn effective_properties(
    request: &CompileRequest,
    fqbn: &Fqbn,
    build_path: &Path,
    resolution: &PlatformResolution<'_>,
) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    props.insert("build.fqbn".to_string(), fqbn.to_string());
    props.insert("build.arch".to_string(), fqbn.architecture.clone());
    props.insert(
        "build.board".to_string(),
        resolution.board.board_id.clone(),
    );
    props.insert(
        "build.core".to_string(),
        resolution.build_platform.id.clone(),
    );
    props.insert(
        "build.path".to_string(),
        build_path.display().to_string(),
    );
    props.insert(
        "build.warnings".to_string(),
        request.warnings.as_str().to_string(),
    );
    for (key, value) in &fqbn.options {
        props.insert(format!("build.options.{key}"), value.clone());
    }
    for (key, value) in &request.build_properties {
        props.insert(key.clone(), value.clone());
    }
    if let Some(keys) = &request.keys {
        props.insert("build.keys.keychain".to_string(), keys.keychain.clone());
        props.insert("build.keys.sign_key".to_string(), keys.sign_key.clone());
        if let Some(encrypt) = &keys.encrypt_key {
            props.insert("build.keys.encrypt_key".to_string(), encrypt.clone());
        }
    }
    props
}

/// Pair measured sections with the board's advisory budgets.
fn attach_limits(raw: Vec<(String, u64)>, board: &Board) -> Vec<ExecutableSectionSize> {
    raw.into_iter()
        .map(|(name, size)| {
            let max = match name.as_str() {
                "text" | "program" | "flash" => board.maximum_size,
                "data" | "bss" => board.maximum_data_size,
                _ => None,
            };
            ExecutableSectionSize {
                name,
                size: size as i64,
                max_size: max.map(|m| m as i64).unwrap_or(-1),
            }
        })
        .collect()
}
