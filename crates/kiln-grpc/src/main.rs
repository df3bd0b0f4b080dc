//! kilnd — the kiln gRPC daemon.
//!
//! Runs the board-management and compile services as a long-lived process so
//! front-end tools initialize cores and libraries only once. By default the
//! daemon terminates when its parent process does; pass `--daemonize` to
//! keep it running.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kiln_grpc::error::exit_code;
use kiln_grpc::services::SettingsStore;
use kiln_grpc::{Daemon, DaemonConfig, DebugOptions};

/// Run the kiln daemon.
#[derive(Parser, Debug)]
#[command(name = "kilnd")]
#[command(about = "gRPC daemon for board management and sketch compilation")]
struct Args {
    /// IP address the daemon will listen to.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// TCP port the daemon will listen to. "0" picks any free port.
    /// Defaults to `daemon.port` from the settings file, then 50051.
    #[arg(long)]
    port: Option<String>,

    /// Do not terminate the daemon when the parent process dies.
    #[arg(long)]
    daemonize: bool,

    /// Enable debug logging of gRPC calls.
    #[arg(long)]
    debug: bool,

    /// Append debug logging to the specified file (requires --debug).
    #[arg(long)]
    debug_file: Option<PathBuf>,

    /// Display only the gRPC calls matching the provided methods.
    #[arg(long = "debug-filter")]
    debug_filter: Vec<String>,

    /// Directory the installed platform/library working set is read from.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Settings file (JSON) supplying defaults and served over RPC.
    #[arg(long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let settings = match &args.config_file {
        Some(path) => match SettingsStore::load(path).await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(exit_code::BAD_CALL as u8);
            }
        },
        None => SettingsStore::default(),
    };

    let port = match args.port {
        Some(port) => port,
        None => settings
            .daemon_port()
            .await
            .unwrap_or_else(|| "50051".to_string()),
    };

    let config = DaemonConfig {
        host: args.ip,
        port,
        daemonize: args.daemonize,
        debug: DebugOptions {
            enabled: args.debug,
            file: args.debug_file,
            filters: args.debug_filter,
        },
        data_dir: args.data_dir,
    };

    let bound = match Daemon::new(config).with_settings(settings).bind().await {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let address = bound.address();
    tracing::info!(ip = %address.ip, port = address.port, "daemon bound");
    println!("{address}");

    match bound.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
