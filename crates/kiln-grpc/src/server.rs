//! Daemon bootstrap and socket lifecycle.
//!
//! [`Daemon::bind`] validates configuration, classifies every bind failure
//! (unknown host / invalid port / address in use / other transport error)
//! and resolves the "any free port" sentinel to the concrete assigned port.
//! [`BoundDaemon::serve`] registers all services on one tonic server,
//! wraps them in the call-logging layer when requested, and runs until a
//! fatal transport error or (unless daemonized) until the parent process
//! exits.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use kiln::compile::{HostToolchainProvider, ToolchainProvider};
use kiln::instance::{DirLoader, InstanceRegistry, WorkingSetLoader};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::error::{BindError, DaemonError};
use crate::intercept::{CallLogger, DebugLogLayer};
use crate::proto::debug_server::DebugServer;
use crate::proto::kiln_core_server::KilnCoreServer;
use crate::proto::monitor_server::MonitorServer;
use crate::proto::settings_server::SettingsServer;
use crate::services::{
    CoreService, DebugService, LoopbackBackend, MonitorBackend, MonitorService, SettingsService,
    SettingsStore,
};
use crate::watcher;

/// The bound address reported to the operator; the port is always the
/// resolved one, never the `0` sentinel.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonAddress {
    /// Bound IP address.
    pub ip: String,
    /// Resolved listening port.
    pub port: u16,
}

impl std::fmt::Display for DaemonAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Daemon is now listening on {}:{}", self.ip, self.port)
    }
}

/// A configured, not-yet-bound daemon.
pub struct Daemon {
    config: DaemonConfig,
    loader: Option<Arc<dyn WorkingSetLoader>>,
    toolchains: Arc<dyn ToolchainProvider>,
    monitor_backend: Arc<dyn MonitorBackend>,
    settings: SettingsStore,
    version: String,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Daemon with default collaborators: directory-backed working sets,
    /// host toolchains, loopback monitor ports, empty settings.
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            loader: None,
            toolchains: Arc::new(HostToolchainProvider),
            monitor_backend: Arc::new(LoopbackBackend),
            settings: SettingsStore::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Replace the working-set loader (tests, alternative stores).
    pub fn with_loader(mut self, loader: Arc<dyn WorkingSetLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Replace the toolchain provider.
    pub fn with_toolchains(mut self, toolchains: Arc<dyn ToolchainProvider>) -> Self {
        self.toolchains = toolchains;
        self
    }

    /// Replace the monitor backend.
    pub fn with_monitor_backend(mut self, backend: Arc<dyn MonitorBackend>) -> Self {
        self.monitor_backend = backend;
        self
    }

    /// Use an already-loaded settings store.
    pub fn with_settings(mut self, settings: SettingsStore) -> Self {
        self.settings = settings;
        self
    }

    /// Validate configuration and bind the listening socket.
    ///
    /// Configuration errors are rejected before any socket operation; bind
    /// failures come back classified per [`BindError`].
    pub async fn bind(self) -> Result<BoundDaemon, DaemonError> {
        self.config.debug.validate()?;
        let logger = CallLogger::from_options(&self.config.debug)?;

        let listener = resolve_and_bind(&self.config.host, &self.config.port).await?;
        let addr = listener.local_addr().map_err(|source| {
            DaemonError::Bind(BindError::Transport {
                host: self.config.host.clone(),
                port: self.config.port.clone(),
                source,
            })
        })?;

        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DirLoader::new(self.config.data_dir.clone())));

        Ok(BoundDaemon {
            config: self.config,
            listener,
            addr,
            logger,
            instances: Arc::new(InstanceRegistry::new(loader)),
            toolchains: self.toolchains,
            monitor_backend: self.monitor_backend,
            settings: self.settings,
            version: self.version,
        })
    }
}

/// A daemon bound to a concrete address, ready to serve.
pub struct BoundDaemon {
    config: DaemonConfig,
    listener: TcpListener,
    addr: SocketAddr,
    logger: Option<Arc<CallLogger>>,
    instances: Arc<InstanceRegistry>,
    toolchains: Arc<dyn ToolchainProvider>,
    monitor_backend: Arc<dyn MonitorBackend>,
    settings: SettingsStore,
    version: String,
}

impl std::fmt::Debug for BoundDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundDaemon")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl BoundDaemon {
    /// The concrete bound socket address (port `0` already resolved).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The bound address in reporting form.
    pub fn address(&self) -> DaemonAddress {
        DaemonAddress {
            ip: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }

    /// Serve until a fatal transport error or, unless daemonized, until the
    /// parent process exits.
    pub async fn serve(self) -> Result<(), DaemonError> {
        let shutdown = if self.config.daemonize {
            None
        } else {
            Some(watcher::parent_exit_signal())
        };
        self.serve_with_shutdown(shutdown).await
    }

    /// Serve with an explicit shutdown signal (`None` = run forever).
    ///
    /// The signal triggers an abrupt stop: diagnostics are flushed, no
    /// in-flight RPC is awaited.
    pub async fn serve_with_shutdown(
        self,
        shutdown: Option<oneshot::Receiver<()>>,
    ) -> Result<(), DaemonError> {
        let core = CoreService::new(
            Arc::clone(&self.instances),
            Arc::clone(&self.toolchains),
            self.version.clone(),
        );
        let monitor = MonitorService::new(Arc::clone(&self.monitor_backend));
        let settings = SettingsService::new(self.settings.clone());
        let debug = DebugService::new(Arc::clone(&self.instances));

        let serve = Server::builder()
            .layer(DebugLogLayer::new(self.logger.clone()))
            .add_service(KilnCoreServer::new(core))
            .add_service(MonitorServer::new(monitor))
            .add_service(SettingsServer::new(settings))
            .add_service(DebugServer::new(debug))
            .serve_with_incoming(TcpListenerStream::new(self.listener));

        info!(ip = %self.addr.ip(), port = self.addr.port(), "daemon serving");

        match shutdown {
            Some(signal) => {
                tokio::select! {
                    result = serve => result.map_err(|e| {
                        error!(error = %e, "serve loop failed");
                        DaemonError::Serve(e)
                    }),
                    _ = signal => {
                        // Parent went away: flush diagnostics and stop. No
                        // in-flight RPC is awaited.
                        if let Some(logger) = &self.logger {
                            logger.flush();
                        }
                        info!("parent process exited, shutting down");
                        Ok(())
                    }
                }
            }
            None => serve.await.map_err(|e| {
                error!(error = %e, "serve loop failed");
                DaemonError::Serve(e)
            }),
        }
    }
}

/// Resolve the host, parse the port, bind — classifying each failure.
async fn resolve_and_bind(host: &str, port: &str) -> Result<TcpListener, BindError> {
    let port_number: u16 = port.parse().map_err(|_| BindError::InvalidPort {
        host: host.to_string(),
        port: port.to_string(),
    })?;

    let mut addrs = tokio::net::lookup_host((host, port_number))
        .await
        .map_err(|source| BindError::HostResolution {
            host: host.to_string(),
            port: port.to_string(),
            source,
        })?;
    let addr = addrs.next().ok_or_else(|| BindError::HostResolution {
        host: host.to_string(),
        port: port.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
    })?;

    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(BindError::AddressInUse {
            host: host.to_string(),
            port: port.to_string(),
        }),
        Err(source) => Err(BindError::Transport {
            host: host.to_string(),
            port: port.to_string(),
            source,
        }),
    }
}
