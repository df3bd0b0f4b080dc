//! Installed platforms, boards and libraries.
//!
//! These are the in-memory shapes of an instance's working set. How they get
//! on disk (package indexes, archives) is the loader collaborator's business;
//! kiln only consumes the loaded values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fqbn::Fqbn;

/// One board definition inside a platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    /// Human-readable board name (e.g. "Acme Uno").
    pub name: String,
    /// Board identifier, the last FQBN segment.
    pub board_id: String,
    /// Platform id (`vendor:architecture`) of the core this board builds
    /// with, when it is not the owning platform's own core.
    #[serde(default)]
    pub core_reference: Option<String>,
    /// Advisory flash budget in bytes, if the board declares one.
    #[serde(default)]
    pub maximum_size: Option<u64>,
    /// Advisory RAM budget in bytes, if the board declares one.
    #[serde(default)]
    pub maximum_data_size: Option<u64>,
}

/// Commands a platform release brings for building sketches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Compiler driver command (also used for preprocessing and linking).
    pub compiler_command: String,
    /// Section-size reporting command, when the platform ships one.
    #[serde(default)]
    pub size_command: Option<String>,
}

/// One installed platform release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// Platform id: `vendor:architecture`.
    pub id: String,
    /// Human-readable platform name.
    pub name: String,
    /// Installed release version.
    pub version: String,
    /// Maintainer string from the platform metadata.
    pub maintainer: String,
    /// Boards this platform defines.
    pub boards: Vec<Board>,
    /// Build tools this platform supplies.
    pub tools: ToolSpec,
}

/// One installed library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    /// Library name as declared by its metadata.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Directory the library is installed in.
    pub install_dir: String,
}

/// Failures while resolving an FQBN against the loaded platforms.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No installed platform matches the FQBN's `vendor:architecture`.
    #[error("platform {0} is not installed")]
    PlatformNotFound(String),
    /// The platform is installed but does not define the board.
    #[error("board {board} not found in platform {platform}")]
    BoardNotFound {
        /// Board id that was looked up.
        board: String,
        /// Platform the lookup ran against.
        platform: String,
    },
    /// The board references a core from a platform that is not installed.
    #[error("board {board} references core from {core}, which is not installed")]
    ReferencedCoreNotFound {
        /// Board whose core reference failed.
        board: String,
        /// The missing `vendor:architecture` core.
        core: String,
    },
}

/// The platforms involved in building for one board.
///
/// `board_platform` owns the board definition; `build_platform` supplies the
/// toolchain and core. They differ exactly when the board carries a
/// [`Board::core_reference`] to another vendor's platform.
#[derive(Debug, Clone, Copy)]
pub struct PlatformResolution<'a> {
    /// Platform that defines the board.
    pub board_platform: &'a Platform,
    /// Platform that supplies the build core and tools.
    pub build_platform: &'a Platform,
    /// The resolved board.
    pub board: &'a Board,
}

/// Resolve which installed platforms serve a compile for `fqbn`.
pub fn resolve_platforms<'a>(
    platforms: &'a [Platform],
    fqbn: &Fqbn,
) -> Result<PlatformResolution<'a>, ResolveError> {
    let platform_id = fqbn.platform_id();
    let board_platform = platforms
        .iter()
        .find(|p| p.id == platform_id)
        .ok_or_else(|| ResolveError::PlatformNotFound(platform_id.clone()))?;
    let board = board_platform
        .boards
        .iter()
        .find(|b| b.board_id == fqbn.board_id)
        .ok_or_else(|| ResolveError::BoardNotFound {
            board: fqbn.board_id.clone(),
            platform: platform_id.clone(),
        })?;
    let build_platform = match &board.core_reference {
        None => board_platform,
        Some(core) => platforms.iter().find(|p| &p.id == core).ok_or_else(|| {
            ResolveError::ReferencedCoreNotFound {
                board: fqbn.board_id.clone(),
                core: core.clone(),
            }
        })?,
    };
    Ok(PlatformResolution {
        board_platform,
        build_platform,
        board,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn platform(id: &str, boards: Vec<Board>) -> Platform {
        Platform {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            maintainer: "Test".to_string(),
            boards,
            tools: ToolSpec {
                compiler_command: "cc".to_string(),
                size_command: None,
            },
        }
    }

    fn board(id: &str, core: Option<&str>) -> Board {
        Board {
            name: id.to_string(),
            board_id: id.to_string(),
            core_reference: core.map(str::to_string),
            maximum_size: None,
            maximum_data_size: None,
        }
    }

    #[test]
    fn test_resolves_same_platform() {
        let platforms = vec![platform("acme:avr", vec![board("uno", None)])];
        let fqbn: Fqbn = "acme:avr:uno".parse().unwrap();
        let res = resolve_platforms(&platforms, &fqbn).unwrap();
        assert_eq!(res.board_platform.id, "acme:avr");
        assert_eq!(res.build_platform.id, "acme:avr");
    }

    #[test]
    fn test_resolves_referenced_core() {
        let platforms = vec![
            platform("clone:avr", vec![board("mini", Some("acme:avr"))]),
            platform("acme:avr", vec![board("uno", None)]),
        ];
        let fqbn: Fqbn = "clone:avr:mini".parse().unwrap();
        let res = resolve_platforms(&platforms, &fqbn).unwrap();
        assert_eq!(res.board_platform.id, "clone:avr");
        assert_eq!(res.build_platform.id, "acme:avr");
    }

    #[test]
    fn test_missing_platform_and_board() {
        let platforms = vec![platform("acme:avr", vec![board("uno", None)])];
        let missing: Fqbn = "other:avr:uno".parse().unwrap();
        assert_eq!(
            resolve_platforms(&platforms, &missing).unwrap_err(),
            ResolveError::PlatformNotFound("other:avr".to_string())
        );
        let no_board: Fqbn = "acme:avr:mega".parse().unwrap();
        assert!(matches!(
            resolve_platforms(&platforms, &no_board).unwrap_err(),
            ResolveError::BoardNotFound { .. }
        ));
    }

    #[test]
    fn test_missing_referenced_core() {
        let platforms = vec![platform("clone:avr", vec![board("mini", Some("acme:avr"))])];
        let fqbn: Fqbn = "clone:avr:mini".parse().unwrap();
        assert!(matches!(
            resolve_platforms(&platforms, &fqbn).unwrap_err(),
            ResolveError::ReferencedCoreNotFound { .. }
        ));
    }
}
