//! Kiln: board and sketch-compilation engine
//!
//! Kiln holds the state a board-management daemon keeps loaded between
//! requests: installed platforms, boards and libraries, grouped into
//! server-owned *instances*, plus the compilation pipeline that turns a
//! sketch into a board image while streaming its output.
//!
//! The expensive parts of the toolchain (compiler processes, metadata
//! storage) sit behind trait seams ([`compile::Toolchain`],
//! [`instance::WorkingSetLoader`]) so the daemon in `kiln-grpc` stays a thin
//! transport over this crate.

pub mod board;
pub mod compile;
pub mod fqbn;
pub mod instance;
pub mod sketch;

pub use board::{Board, Library, Platform, ResolveError};
pub use compile::{
    CompileError, CompileEvent, CompileRequest, CompileSummary, ExecutableSectionSize,
    TaskProgress, Warnings,
};
pub use fqbn::{Fqbn, FqbnError};
pub use instance::{InstanceError, InstanceRegistry, InstanceState, WorkingSetLoader};
pub use sketch::{Sketch, SketchError};
