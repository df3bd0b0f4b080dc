//! Daemon configuration.
//!
//! One [`DaemonConfig`] value is built at startup (from flags and the
//! settings file) and moved into [`crate::Daemon`]; nothing here is global
//! or mutable afterwards.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Diagnostic call-logging options.
#[derive(Debug, Clone, Default)]
pub struct DebugOptions {
    /// Log every gRPC call (and each streamed message) as it happens.
    pub enabled: bool,
    /// Append diagnostics to this file instead of stderr. Requires
    /// `enabled`.
    pub file: Option<PathBuf>,
    /// When non-empty, only log calls whose `/package.Service/Method` path
    /// contains one of these entries.
    pub filters: Vec<String>,
}

impl DebugOptions {
    /// Reject invalid flag combinations before any socket operation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file.is_some() && !self.enabled {
            return Err(ConfigError::DebugFileWithoutDebug);
        }
        Ok(())
    }
}

/// Runtime configuration for one daemon process.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Host or IP to bind.
    pub host: String,
    /// Port to bind, as given by the operator. `"0"` means "assign any free
    /// ephemeral port"; the resolved port is reported after binding.
    pub port: String,
    /// Keep running after the parent process exits.
    pub daemonize: bool,
    /// Call-logging options.
    pub debug: DebugOptions,
    /// Directory the instance working sets load from.
    pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: "50051".to_string(),
            daemonize: false,
            debug: DebugOptions::default(),
            data_dir: PathBuf::from("."),
        }
    }
}
