//! Integration tests for the kiln daemon.
//!
//! These start a real server on an OS-assigned port and drive it over gRPC
//! the way a front-end tool would: create an instance, initialize it, then
//! compile, monitor and poke settings.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Channel;

use kiln::board::{Board, Library, Platform, ToolSpec};
use kiln::compile::{CompileUnit, StepOutput, Toolchain, ToolchainProvider};
use kiln::instance::{LoadError, WorkingSetLoader};
use kiln_grpc::proto::{
    self, compile_response, debug_request, debug_response, monitor_request, monitor_response,
    debug_client::DebugClient, kiln_core_client::KilnCoreClient, monitor_client::MonitorClient,
    settings_client::SettingsClient,
};
use kiln_grpc::{Daemon, DaemonConfig, DebugOptions};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("kiln_grpc=debug,kiln=debug")
            .with_test_writer()
            .init();
    });
}

/// Macro to log messages in tests (visible with --nocapture)
macro_rules! test_log {
    ($($arg:tt)*) => {
        eprintln!("[TEST] {}", format!($($arg)*));
    };
}

/// In-memory working set, standing in for parsed platform indexes.
struct MemoryLoader {
    platforms: Vec<Platform>,
    libraries: Vec<Library>,
}

impl MemoryLoader {
    fn default_set() -> Self {
        Self {
            platforms: vec![
                Platform {
                    id: "acme:avr".to_string(),
                    name: "Acme AVR Boards".to_string(),
                    version: "1.8.0".to_string(),
                    maintainer: "Acme".to_string(),
                    boards: vec![Board {
                        name: "Acme Uno".to_string(),
                        board_id: "uno".to_string(),
                        core_reference: None,
                        maximum_size: Some(32256),
                        maximum_data_size: Some(2048),
                    }],
                    tools: ToolSpec {
                        compiler_command: "avr-gcc".to_string(),
                        size_command: None,
                    },
                },
                Platform {
                    id: "clone:avr".to_string(),
                    name: "Clone Boards".to_string(),
                    version: "0.9.1".to_string(),
                    maintainer: "Clone Industries".to_string(),
                    boards: vec![Board {
                        name: "Clone Mini".to_string(),
                        board_id: "mini".to_string(),
                        core_reference: Some("acme:avr".to_string()),
                        maximum_size: None,
                        maximum_data_size: None,
                    }],
                    tools: ToolSpec {
                        compiler_command: "avr-gcc".to_string(),
                        size_command: None,
                    },
                },
            ],
            libraries: vec![Library {
                name: "Servo".to_string(),
                version: "1.1.8".to_string(),
                install_dir: "/libs/Servo".to_string(),
            }],
        }
    }
}

#[async_trait]
impl WorkingSetLoader for MemoryLoader {
    async fn load_platforms(&self) -> Result<Vec<Platform>, LoadError> {
        Ok(self.platforms.clone())
    }

    async fn load_libraries(&self) -> Result<Vec<Library>, LoadError> {
        Ok(self.libraries.clone())
    }
}

/// Scripted toolchain: writes placeholder artifacts and counts what ran, so
/// tests can observe cache reuse and cancellation.
struct ScriptedToolchain {
    delay: Option<Duration>,
    compiles_started: AtomicUsize,
    units_aborted: Arc<AtomicUsize>,
    builds_finished: AtomicUsize,
}

impl ScriptedToolchain {
    fn new(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            compiles_started: AtomicUsize::new(0),
            units_aborted: Arc::new(AtomicUsize::new(0)),
            builds_finished: AtomicUsize::new(0),
        })
    }
}

/// Flags a compile unit whose future was dropped mid-flight, the scripted
/// stand-in for "the compiler process was killed".
struct AbortGuard {
    completed: bool,
    aborted: Arc<AtomicUsize>,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Toolchain for ScriptedToolchain {
    fn compile_command_line(&self, unit: &CompileUnit, flags: &[String]) -> Vec<String> {
        let mut argv = vec!["scripted-cc".to_string()];
        argv.extend(flags.iter().cloned());
        argv.push("-c".to_string());
        argv.push(unit.source.display().to_string());
        argv.push("-o".to_string());
        argv.push(unit.object.display().to_string());
        argv
    }

    async fn preprocess(&self, source: &Path, _flags: &[String]) -> std::io::Result<StepOutput> {
        Ok(StepOutput::ok(format!("preprocessed {}\n", source.display())))
    }

    async fn compile_unit(
        &self,
        unit: &CompileUnit,
        _flags: &[String],
    ) -> std::io::Result<StepOutput> {
        self.compiles_started.fetch_add(1, Ordering::SeqCst);
        let mut guard = AbortGuard {
            completed: false,
            aborted: Arc::clone(&self.units_aborted),
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        tokio::fs::write(&unit.object, b"obj").await?;
        guard.completed = true;
        Ok(StepOutput::ok(format!("CC {}\n", unit.source.display())))
    }

    async fn link(
        &self,
        objects: &[std::path::PathBuf],
        output: &Path,
    ) -> std::io::Result<StepOutput> {
        let mut image = Vec::new();
        for object in objects {
            image.extend(tokio::fs::read(object).await?);
        }
        tokio::fs::write(output, image).await?;
        self.builds_finished.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutput::ok("LD\n"))
    }

    async fn sizes(&self, _executable: &Path) -> std::io::Result<Vec<(String, u64)>> {
        Ok(vec![("text".to_string(), 1234), ("data".to_string(), 56)])
    }
}

struct ScriptedProvider(Arc<ScriptedToolchain>);

impl ToolchainProvider for ScriptedProvider {
    fn toolchain(&self, _build_platform: &Platform) -> Arc<dyn Toolchain> {
        Arc::clone(&self.0) as Arc<dyn Toolchain>
    }
}

/// Start a daemon on an OS-assigned port and return its address.
async fn start_daemon_with(
    debug: DebugOptions,
    toolchain: Arc<ScriptedToolchain>,
) -> (SocketAddr, Arc<ScriptedToolchain>) {
    test_log!("Starting test daemon...");
    let config = DaemonConfig {
        host: "127.0.0.1".to_string(),
        port: "0".to_string(),
        daemonize: true,
        debug,
        data_dir: std::path::PathBuf::from("."),
    };
    let daemon = Daemon::new(config)
        .with_loader(Arc::new(MemoryLoader::default_set()))
        .with_toolchains(Arc::new(ScriptedProvider(Arc::clone(&toolchain))));
    let bound = daemon.bind().await.unwrap();
    let addr = bound.local_addr();
    test_log!("Daemon bound to {}", addr);

    tokio::spawn(async move {
        let result = bound.serve().await;
        test_log!("Daemon task ended: {:?}", result);
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, toolchain)
}

async fn start_daemon() -> (SocketAddr, Arc<ScriptedToolchain>) {
    start_daemon_with(DebugOptions::default(), ScriptedToolchain::new(None)).await
}

async fn core_client(addr: SocketAddr) -> KilnCoreClient<Channel> {
    KilnCoreClient::connect(format!("http://{addr}")).await.unwrap()
}

/// Create an instance and drain its Init progress stream.
async fn create_and_init(client: &mut KilnCoreClient<Channel>) -> proto::Instance {
    let created = client
        .create(proto::CreateRequest {})
        .await
        .unwrap()
        .into_inner();
    let instance = created.instance.unwrap();
    let mut stream = client
        .init(proto::InitRequest {
            instance: Some(instance.clone()),
        })
        .await
        .unwrap()
        .into_inner();
    while let Some(message) = stream.next().await {
        message.unwrap();
    }
    instance
}

async fn write_sketch(root: &Path) {
    tokio::fs::create_dir_all(root).await.unwrap();
    let name = root.file_name().unwrap().to_string_lossy();
    tokio::fs::write(
        root.join(format!("{name}.ino")),
        "#include <Servo.h>\nvoid setup() {}\nvoid loop() {}\n",
    )
    .await
    .unwrap();
    tokio::fs::write(root.join("helper.cpp"), "int helper() { return 1; }\n")
        .await
        .unwrap();
}

fn compile_request(
    instance: &proto::Instance,
    fqbn: &str,
    sketch: &Path,
    build: &Path,
) -> proto::CompileRequest {
    proto::CompileRequest {
        instance: Some(instance.clone()),
        fqbn: fqbn.to_string(),
        sketch_path: sketch.display().to_string(),
        build_path: build.display().to_string(),
        ..Default::default()
    }
}

/// Drain a compile stream, splitting it into stdout text and the terminal
/// summary (if one arrived).
async fn drain_compile(
    stream: &mut tonic::Streaming<proto::CompileResponse>,
) -> (String, Vec<proto::TaskProgress>, Option<proto::CompileSummary>) {
    let mut stdout = String::new();
    let mut progress = Vec::new();
    let mut summary = None;
    while let Some(message) = stream.next().await {
        let message = message.unwrap();
        match message.msg {
            Some(compile_response::Msg::OutStream(bytes)) => {
                stdout.push_str(&String::from_utf8_lossy(&bytes));
            }
            Some(compile_response::Msg::ErrStream(_)) => {}
            Some(compile_response::Msg::Progress(p)) => progress.push(p),
            Some(compile_response::Msg::Summary(s)) => {
                assert!(summary.is_none(), "summary must be emitted exactly once");
                summary = Some(s);
            }
            None => {}
        }
    }
    (stdout, progress, summary)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_port_zero_resolves_and_serves() {
    init_tracing();
    let (addr, _) = start_daemon().await;

    // The sentinel never leaks: the resolved port is a real ephemeral port.
    assert!(addr.port() > 1024, "expected ephemeral port, got {addr}");

    let mut client = core_client(addr).await;
    let version = client
        .version(proto::VersionRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(!version.version.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_compile() {
    init_tracing();
    let (addr, toolchain) = start_daemon().await;
    let mut client = core_client(addr).await;
    let instance = create_and_init(&mut client).await;

    let dir = tempfile::tempdir().unwrap();
    let sketch = dir.path().join("blink");
    write_sketch(&sketch).await;
    let build = dir.path().join("build");

    let request = compile_request(&instance, "acme:avr:uno", &sketch, &build);
    let mut stream = client.compile(request).await.unwrap().into_inner();

    let (stdout, progress, summary) = timeout(Duration::from_secs(10), drain_compile(&mut stream))
        .await
        .unwrap();
    let summary = summary.expect("stream must end in a summary");

    assert!(!summary.build_path.is_empty());
    assert_eq!(summary.board_platform, "acme:avr");
    assert_eq!(summary.build_platform, "acme:avr");
    assert_eq!(summary.used_libraries.len(), 1);
    assert_eq!(summary.used_libraries[0].name, "Servo");
    assert_eq!(summary.executable_sections_size.len(), 2);
    assert_eq!(summary.executable_sections_size[0].name, "text");
    assert_eq!(summary.executable_sections_size[0].max_size, 32256);

    assert!(stdout.contains("CC "), "expected compiler output, got {stdout:?}");
    assert!(progress.iter().any(|p| p.completed));
    assert_eq!(toolchain.compiles_started.load(Ordering::SeqCst), 2);
    assert_eq!(toolchain.builds_finished.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_referenced_core_reports_both_platforms() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = core_client(addr).await;
    let instance = create_and_init(&mut client).await;

    let details = client
        .board_details(proto::BoardDetailsRequest {
            instance: Some(instance),
            fqbn: "clone:avr:mini".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(details.name, "Clone Mini");
    assert_eq!(details.board_platform, "clone:avr");
    assert_eq!(details.build_platform, "acme:avr");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_tree_override_rejected_before_toolchain() {
    init_tracing();
    let (addr, toolchain) = start_daemon().await;
    let mut client = core_client(addr).await;
    let instance = create_and_init(&mut client).await;

    let dir = tempfile::tempdir().unwrap();
    let sketch = dir.path().join("blink");
    write_sketch(&sketch).await;

    let mut request =
        compile_request(&instance, "acme:avr:uno", &sketch, &dir.path().join("build"));
    request
        .source_override
        .insert("../evil.ino".to_string(), String::new());

    let status = client.compile(request).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(toolchain.compiles_started.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_unknown_instance() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = core_client(addr).await;

    let dir = tempfile::tempdir().unwrap();
    let sketch = dir.path().join("blink");
    write_sketch(&sketch).await;

    let request = compile_request(
        &proto::Instance { id: 9999 },
        "acme:avr:uno",
        &sketch,
        &dir.path().join("build"),
    );
    let status = client.compile(request).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_uninitialized_instance() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = core_client(addr).await;

    let created = client
        .create(proto::CreateRequest {})
        .await
        .unwrap()
        .into_inner();
    let instance = created.instance.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sketch = dir.path().join("blink");
    write_sketch(&sketch).await;

    let request = compile_request(&instance, "acme:avr:uno", &sketch, &dir.path().join("build"));
    let mut stream = client.compile(request).await.unwrap().into_inner();
    let first = stream.next().await.unwrap();
    let status = first.unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cache_reuse_and_clean() {
    init_tracing();
    let (addr, toolchain) = start_daemon().await;
    let mut client = core_client(addr).await;
    let instance = create_and_init(&mut client).await;

    let dir = tempfile::tempdir().unwrap();
    let sketch = dir.path().join("blink");
    write_sketch(&sketch).await;
    let build = dir.path().join("build");

    let mut request = compile_request(&instance, "acme:avr:uno", &sketch, &build);
    request.build_cache_path = dir.path().join("cache").display().to_string();

    let mut stream = client.compile(request.clone()).await.unwrap().into_inner();
    let (_, _, summary) = drain_compile(&mut stream).await;
    assert!(summary.is_some());
    assert_eq!(toolchain.compiles_started.load(Ordering::SeqCst), 2);

    // Same configuration, same cache path: intermediates are reused.
    let mut stream = client.compile(request.clone()).await.unwrap().into_inner();
    let (_, progress, summary) = drain_compile(&mut stream).await;
    assert!(summary.is_some());
    assert_eq!(toolchain.compiles_started.load(Ordering::SeqCst), 2);
    assert!(
        progress.iter().any(|p| p.message.contains("cached")),
        "expected an explicit cache-hit signal"
    );

    // clean=true forces a full rebuild despite the unchanged cache path.
    request.clean = true;
    let mut stream = client.compile(request).await.unwrap().into_inner();
    let (_, _, summary) = drain_compile(&mut stream).await;
    assert!(summary.is_some());
    assert_eq!(toolchain.compiles_started.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_cancellation_stops_the_build() {
    init_tracing();
    let slow = ScriptedToolchain::new(Some(Duration::from_secs(30)));
    let (addr, toolchain) = start_daemon_with(DebugOptions::default(), slow).await;
    let mut client = core_client(addr).await;
    let instance = create_and_init(&mut client).await;

    let dir = tempfile::tempdir().unwrap();
    let sketch = dir.path().join("blink");
    write_sketch(&sketch).await;

    let request = compile_request(&instance, "acme:avr:uno", &sketch, &dir.path().join("build"));
    let mut stream = client.compile(request).await.unwrap().into_inner();

    // Wait for the build to actually start...
    let first = timeout(Duration::from_secs(5), stream.next()).await.unwrap();
    assert!(first.unwrap().is_ok());
    // ...then walk away mid-stream.
    drop(stream);

    // The in-flight unit futures must be torn down shortly after, which is
    // what kills their compiler processes in the host toolchain.
    let mut aborted = 0;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        aborted = toolchain.units_aborted.load(Ordering::SeqCst);
        if aborted > 0 {
            break;
        }
    }
    assert!(aborted > 0, "cancelled build kept its compile units running");
    assert_eq!(toolchain.builds_finished.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interceptor_filters_by_method() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("debug.log");
    let debug = DebugOptions {
        enabled: true,
        file: Some(log_path.clone()),
        filters: vec!["Version".to_string()],
    };
    let (addr, _) = start_daemon_with(debug, ScriptedToolchain::new(None)).await;
    let mut client = core_client(addr).await;

    let instance = create_and_init(&mut client).await;
    client.version(proto::VersionRequest {}).await.unwrap();
    client
        .platform_list(proto::PlatformListRequest {
            instance: Some(instance),
        })
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(
        contents.contains("/kiln.v1.KilnCore/Version"),
        "expected Version call in debug log, got: {contents}"
    );
    assert!(!contents.contains("PlatformList"), "filtered call was logged");
    assert!(!contents.contains("/kiln.v1.KilnCore/Create"), "filtered call was logged");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interceptor_logs_streamed_messages() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("debug.log");
    let debug = DebugOptions {
        enabled: true,
        file: Some(log_path.clone()),
        filters: Vec::new(),
    };
    let (addr, _) = start_daemon_with(debug, ScriptedToolchain::new(None)).await;
    let mut client = core_client(addr).await;
    create_and_init(&mut client).await;

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("/kiln.v1.KilnCore/Init call started"));
    // Init streams several progress messages; each is its own event.
    let sent_messages = contents
        .lines()
        .filter(|line| line.contains("/kiln.v1.KilnCore/Init sent message"))
        .count();
    assert!(
        sent_messages >= 2,
        "expected per-message events for the Init stream, got: {contents}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_settings_round_trip() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = SettingsClient::connect(format!("http://{addr}")).await.unwrap();

    client
        .set_value(proto::SettingsSetValueRequest {
            key: "sketch.always_export_binaries".to_string(),
            json_data: "true".to_string(),
        })
        .await
        .unwrap();

    let value = client
        .get_value(proto::SettingsGetValueRequest {
            key: "sketch.always_export_binaries".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(value.json_data, "true");

    client
        .merge(proto::SettingsMergeRequest {
            json_data: r#"{"daemon": {"port": "50052"}}"#.to_string(),
        })
        .await
        .unwrap();

    let all = client
        .get_all(proto::SettingsGetAllRequest {})
        .await
        .unwrap()
        .into_inner();
    let doc: serde_json::Value = serde_json::from_str(&all.json_data).unwrap();
    assert_eq!(doc["daemon"]["port"], "50052");
    assert_eq!(doc["sketch"]["always_export_binaries"], true);

    let missing = client
        .get_value(proto::SettingsGetValueRequest {
            key: "no.such.key".to_string(),
        })
        .await;
    assert_eq!(missing.unwrap_err().code(), tonic::Code::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_loopback_session() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = MonitorClient::connect(format!("http://{addr}")).await.unwrap();

    let (tx, rx) = mpsc::channel(8);
    // Send the open request before calling communicate() since tonic
    // streams are lazy.
    tx.send(proto::MonitorRequest {
        msg: Some(monitor_request::Msg::Open(proto::MonitorPortConfig {
            port: "/dev/ttyACM0".to_string(),
            baudrate: 9600,
        })),
    })
    .await
    .unwrap();

    let mut stream = client
        .communicate(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    let first = stream.next().await.unwrap().unwrap();
    match first.msg {
        Some(monitor_response::Msg::AppliedSettings(applied)) => {
            assert_eq!(applied.port, "/dev/ttyACM0");
            assert_eq!(applied.baudrate, 9600);
        }
        other => panic!("expected applied settings first, got {other:?}"),
    }

    tx.send(proto::MonitorRequest {
        msg: Some(monitor_request::Msg::TxData(b"hello board".to_vec())),
    })
    .await
    .unwrap();

    let echoed = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match echoed.msg {
        Some(monitor_response::Msg::RxData(data)) => assert_eq!(data, b"hello board"),
        other => panic!("expected RX data, got {other:?}"),
    }

    tx.send(proto::MonitorRequest {
        msg: Some(monitor_request::Msg::Close(true)),
    })
    .await
    .unwrap();

    let result = timeout(Duration::from_secs(5), async {
        while let Some(message) = stream.next().await {
            if let Some(monitor_response::Msg::Success(ok)) = message.unwrap().msg {
                return ok;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(result, "expected success after close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debug_session_round_trip() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut core = core_client(addr).await;
    let instance = create_and_init(&mut core).await;

    let mut client = DebugClient::connect(format!("http://{addr}")).await.unwrap();
    let (tx, rx) = mpsc::channel(8);
    // `cat` echoes its stdin, which is all a session bridge needs to prove.
    tx.send(proto::DebugRequest {
        msg: Some(debug_request::Msg::Init(proto::DebugConfig {
            instance: Some(instance),
            interpreter: "cat".to_string(),
            ..Default::default()
        })),
    })
    .await
    .unwrap();

    let mut stream = client
        .session(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    tx.send(proto::DebugRequest {
        msg: Some(debug_request::Msg::Data(b"break loop\n".to_vec())),
    })
    .await
    .unwrap();

    let first = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match first.msg {
        Some(debug_response::Msg::Data(data)) => {
            assert_eq!(data, b"break loop\n");
        }
        other => panic!("expected echoed debugger output, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debug_session_requires_known_instance() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = DebugClient::connect(format!("http://{addr}")).await.unwrap();

    let (tx, rx) = mpsc::channel(8);
    tx.send(proto::DebugRequest {
        msg: Some(debug_request::Msg::Init(proto::DebugConfig {
            instance: Some(proto::Instance { id: 777 }),
            interpreter: "cat".to_string(),
            ..Default::default()
        })),
    })
    .await
    .unwrap();

    let status = client.session(ReceiverStream::new(rx)).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_destroyed_instance_rejected() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = core_client(addr).await;
    let instance = create_and_init(&mut client).await;

    client
        .destroy(proto::DestroyRequest {
            instance: Some(instance.clone()),
        })
        .await
        .unwrap();

    let status = client
        .platform_list(proto::PlatformListRequest {
            instance: Some(instance),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_instances_are_isolated() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = core_client(addr).await;

    // Initialized and uninitialized instances coexist independently.
    let first = create_and_init(&mut client).await;
    let second = client
        .create(proto::CreateRequest {})
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    assert_ne!(first.id, second.id);

    let platforms = client
        .platform_list(proto::PlatformListRequest {
            instance: Some(first),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(platforms.platforms.len(), 2);

    let status = client
        .platform_list(proto::PlatformListRequest {
            instance: Some(second),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_library_list() {
    init_tracing();
    let (addr, _) = start_daemon().await;
    let mut client = core_client(addr).await;
    let instance = create_and_init(&mut client).await;

    let libraries = client
        .library_list(proto::LibraryListRequest {
            instance: Some(instance),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(libraries.libraries.len(), 1);
    assert_eq!(libraries.libraries[0].name, "Servo");
    assert_eq!(libraries.libraries[0].version, "1.1.8");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debug_file_without_debug_fails_before_bind() {
    let config = DaemonConfig {
        port: "0".to_string(),
        debug: DebugOptions {
            enabled: false,
            file: Some(std::env::temp_dir().join("kiln-debug.log")),
            filters: Vec::new(),
        },
        ..Default::default()
    };
    let err = Daemon::new(config).bind().await.unwrap_err();
    assert_eq!(err.exit_code(), kiln_grpc::error::exit_code::BAD_ARGUMENT);
}
