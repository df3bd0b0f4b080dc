//! Kiln gRPC daemon
//!
//! A long-lived background service exposing board/platform/library management
//! and sketch compilation over gRPC, so front-end tools pay the cost of
//! loading platform metadata once per instance instead of once per command.
//!
//! # Architecture
//!
//! ```text
//! Client                                      kilnd
//! │                                             │
//! │  Create()                                   │
//! │ ───────────────────────────────────────────>│  instance 1 allocated
//! │  Init(instance: 1)                          │
//! │ ───────────────────────────────────────────>│  platforms + libraries load
//! │       stream InitResponse{progress}         │
//! │<─────────────────────────────────────────── │
//! │  Compile(instance: 1, fqbn, sketch)         │
//! │ ───────────────────────────────────────────>│
//! │       stream {out_stream, progress, ...}    │
//! │<─────────────────────────────────────────── │
//! │       CompileResponse{summary}              │
//! │<─────────────────────────────────────────── │
//! ```
//!
//! Four services share one listening socket: the core service above plus
//! Monitor, Settings and Debug. An optional call-logging layer wraps them all
//! (see [`intercept`]); the daemon watches its parent process and terminates
//! with it unless daemonized (see [`watcher`]).

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("kiln.v1");
}

pub mod config;
pub mod error;
pub mod intercept;
pub mod server;
pub mod services;
pub mod watcher;

pub use config::{DaemonConfig, DebugOptions};
pub use error::{BindError, ConfigError, DaemonError};
pub use intercept::{CallLogger, DebugLogLayer};
pub use server::{BoundDaemon, Daemon, DaemonAddress};

// Re-export proto entry points for convenience
pub use proto::{
    debug_client::DebugClient, kiln_core_client::KilnCoreClient, monitor_client::MonitorClient,
    settings_client::SettingsClient,
};
