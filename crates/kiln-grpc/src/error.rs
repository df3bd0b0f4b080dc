//! Daemon failure classification and exit statuses.
//!
//! Socket-bind failures are classified by an explicit match over the bind
//! step's structured errors, never by inspecting error strings, and every
//! failure class maps to its own process exit status so automation can tell
//! "port busy" from "bad address" from "unknown failure".

use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors, detected before any socket operation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `--debug-file` given without `--debug`.
    #[error("the debug-file option must be used together with debug")]
    DebugFileWithoutDebug,
    /// The diagnostic sink file could not be opened for appending.
    #[error("error opening debug logging file {path}: {source}")]
    DebugSink {
        /// The requested sink path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The settings file exists but is not valid JSON.
    #[error("invalid settings file {path}: {source}")]
    Settings {
        /// The settings file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The settings file exists but could not be read.
    #[error("cannot read settings file {path}: {source}")]
    SettingsRead {
        /// The settings file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Why the daemon failed to bind its listening socket.
///
/// Every variant carries the offending host/port so operators see what was
/// actually attempted.
#[derive(Debug, Error)]
pub enum BindError {
    /// The bind host did not resolve.
    #[error("failed to listen on {host}:{port}: {host} is an unknown name")]
    HostResolution {
        /// Requested host.
        host: String,
        /// Requested port.
        port: String,
        /// Underlying resolver error.
        #[source]
        source: std::io::Error,
    },
    /// The port is not a valid port number.
    #[error("failed to listen on {host}:{port}: {port} is an invalid port")]
    InvalidPort {
        /// Requested host.
        host: String,
        /// Requested port.
        port: String,
    },
    /// Another process already listens on the address.
    #[error("failed to listen on {host}:{port}: address already in use")]
    AddressInUse {
        /// Requested host.
        host: String,
        /// Requested port.
        port: String,
    },
    /// Any other transport-level bind failure.
    #[error("failed to listen on {host}:{port}: {source}")]
    Transport {
        /// Requested host.
        host: String,
        /// Requested port.
        port: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Top-level daemon failure, as seen by the binary.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Invalid configuration; nothing was bound.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The listening socket could not be bound.
    #[error(transparent)]
    Bind(#[from] BindError),
    /// The serve loop failed after a successful bind. Unrecoverable: the
    /// daemon has no restart policy of its own.
    #[error("daemon terminated: {0}")]
    Serve(#[source] tonic::transport::Error),
}

/// Process exit statuses, one per failure classification.
pub mod exit_code {
    /// Clean exit.
    pub const SUCCESS: i32 = 0;
    /// Unclassified failure.
    pub const GENERIC: i32 = 1;
    /// Generic network failure (e.g. address already in use).
    pub const NETWORK: i32 = 2;
    /// Host name resolution failure.
    pub const DNS: i32 = 3;
    /// Port/address failure (syntactically invalid port).
    pub const ADDRESS: i32 = 4;
    /// A required call failed (e.g. unopenable debug sink or settings file).
    pub const BAD_CALL: i32 = 5;
    /// Invalid flag combination.
    pub const BAD_ARGUMENT: i32 = 6;
}

impl DaemonError {
    /// The process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::Config(ConfigError::DebugFileWithoutDebug) => exit_code::BAD_ARGUMENT,
            DaemonError::Config(ConfigError::DebugSink { .. })
            | DaemonError::Config(ConfigError::Settings { .. })
            | DaemonError::Config(ConfigError::SettingsRead { .. }) => exit_code::BAD_CALL,
            DaemonError::Bind(BindError::HostResolution { .. }) => exit_code::DNS,
            DaemonError::Bind(BindError::InvalidPort { .. }) => exit_code::ADDRESS,
            DaemonError::Bind(BindError::AddressInUse { .. }) => exit_code::NETWORK,
            DaemonError::Bind(BindError::Transport { .. }) => exit_code::GENERIC,
            DaemonError::Serve(_) => exit_code::GENERIC,
        }
    }
}
