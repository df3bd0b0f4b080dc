//! gRPC service implementations registered by the daemon.
//!
//! Each service owns its own state and is registered independently on the
//! one listening socket; nothing here knows about the call-logging layer
//! wrapped around it.

pub mod core;
pub mod debug;
pub mod monitor;
pub mod settings;

pub use core::CoreService;
pub use debug::DebugService;
pub use monitor::{LoopbackBackend, MonitorBackend, MonitorReader, MonitorService, MonitorWriter};
pub use settings::{SettingsService, SettingsStore};
