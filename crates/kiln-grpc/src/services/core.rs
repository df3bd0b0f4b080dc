//! The core service: instance lifecycle, board/library queries and compile.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use kiln::board::resolve_platforms;
use kiln::compile::{CompileError, CompileEvent, SigningKeys, ToolchainProvider, Warnings};
use kiln::fqbn::Fqbn;
use kiln::instance::{InstanceRegistry, InstanceState};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::proto::{self, compile_response, kiln_core_server};

type InitStream = Pin<Box<dyn Stream<Item = Result<proto::InitResponse, Status>> + Send>>;
type CompileStream = Pin<Box<dyn Stream<Item = Result<proto::CompileResponse, Status>> + Send>>;

/// The KilnCore gRPC service.
pub struct CoreService {
    instances: Arc<InstanceRegistry>,
    toolchains: Arc<dyn ToolchainProvider>,
    version: String,
}

impl std::fmt::Debug for CoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreService")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CoreService {
    /// Service over the shared registry and toolchain provider.
    pub fn new(
        instances: Arc<InstanceRegistry>,
        toolchains: Arc<dyn ToolchainProvider>,
        version: String,
    ) -> Self {
        Self {
            instances,
            toolchains,
            version,
        }
    }
}

fn instance_id(instance: Option<proto::Instance>) -> Result<i32, Status> {
    instance
        .map(|i| i.id)
        .ok_or_else(|| Status::invalid_argument("missing instance"))
}

fn ensure_initialized(state: &InstanceState, id: i32) -> Result<(), Status> {
    if state.initialized {
        Ok(())
    } else {
        Err(Status::failed_precondition(format!(
            "instance {id} is not initialized"
        )))
    }
}

fn init_progress(message: &str, percent: f32, completed: bool) -> proto::InitResponse {
    proto::InitResponse {
        progress: Some(proto::TaskProgress {
            name: "init".to_string(),
            message: message.to_string(),
            percent,
            completed,
        }),
    }
}

/// Map a pipeline error to a status the caller can act on: user errors keep
/// their distinct codes, internal failures collapse to `Internal`.
fn compile_status(error: CompileError) -> Status {
    match &error {
        CompileError::Resolve(_) => Status::not_found(error.to_string()),
        CompileError::Cancelled => Status::cancelled(error.to_string()),
        CompileError::ToolchainFailed { .. } => Status::aborted(error.to_string()),
        _ if error.is_user_error() => Status::invalid_argument(error.to_string()),
        _ => Status::internal(error.to_string()),
    }
}

fn compile_request_from_proto(
    request: proto::CompileRequest,
) -> Result<kiln::CompileRequest, Status> {
    let warnings: Warnings = request
        .warnings
        .parse()
        .map_err(|e: kiln::compile::InvalidWarningLevel| Status::invalid_argument(e.to_string()))?;

    let mut compile = kiln::CompileRequest::new(request.fqbn, PathBuf::from(request.sketch_path));
    compile.warnings = warnings;
    compile.jobs = request.jobs;
    compile.clean = request.clean;
    compile.show_properties = request.show_properties;
    compile.preprocess_only = request.preprocess;
    compile.compilation_db_only = request.create_compilation_database_only;
    compile.export_binaries = request.export_binaries;
    if !request.build_path.is_empty() {
        compile.build_path = Some(PathBuf::from(request.build_path));
    }
    if !request.build_cache_path.is_empty() {
        compile.build_cache_path = Some(PathBuf::from(request.build_cache_path));
    }
    compile.libraries = request.libraries.into_iter().map(PathBuf::from).collect();
    compile.build_properties = request.build_properties.into_iter().collect();
    compile.source_override = request.source_override.into_iter().collect();
    if !request.keys_keychain.is_empty() || !request.sign_key.is_empty() {
        compile.keys = Some(SigningKeys {
            keychain: request.keys_keychain,
            sign_key: request.sign_key,
            encrypt_key: (!request.encrypt_key.is_empty()).then_some(request.encrypt_key),
        });
    }
    Ok(compile)
}

fn event_to_proto(event: CompileEvent) -> proto::CompileResponse {
    let msg = match event {
        CompileEvent::Stdout(bytes) => compile_response::Msg::OutStream(bytes),
        CompileEvent::Stderr(bytes) => compile_response::Msg::ErrStream(bytes),
        CompileEvent::Progress(progress) => compile_response::Msg::Progress(proto::TaskProgress {
            name: progress.name,
            message: progress.message,
            percent: progress.percent,
            completed: progress.completed,
        }),
        CompileEvent::Finished(summary) => compile_response::Msg::Summary(proto::CompileSummary {
            build_path: summary.build_path.display().to_string(),
            used_libraries: summary
                .used_libraries
                .into_iter()
                .map(|lib| proto::LibrarySummary {
                    name: lib.name,
                    version: lib.version,
                    install_dir: lib.install_dir,
                })
                .collect(),
            executable_sections_size: summary
                .executable_sections
                .into_iter()
                .map(|section| proto::ExecutableSectionSize {
                    name: section.name,
                    size: section.size,
                    max_size: section.max_size,
                })
                .collect(),
            board_platform: summary.board_platform,
            build_platform: summary.build_platform,
        }),
    };
    proto::CompileResponse { msg: Some(msg) }
}

#[tonic::async_trait]
impl kiln_core_server::KilnCore for CoreService {
    async fn create(
        &self,
        _request: Request<proto::CreateRequest>,
    ) -> Result<Response<proto::CreateResponse>, Status> {
        let id = self.instances.create();
        Ok(Response::new(proto::CreateResponse {
            instance: Some(proto::Instance { id }),
        }))
    }

    type InitStream = InitStream;

    async fn init(
        &self,
        request: Request<proto::InitRequest>,
    ) -> Result<Response<Self::InitStream>, Status> {
        let id = instance_id(request.into_inner().instance)?;
        let state = self
            .instances
            .get(id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        let loader = self.instances.loader();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Write lock for the whole load: Init is a mutation and must be
            // serialized against every other call on this instance.
            let mut guard = state.write().await;
            let _ = tx
                .send(Ok(init_progress("Loading platforms", 0.0, false)))
                .await;
            let platforms = match loader.load_platforms().await {
                Ok(platforms) => platforms,
                Err(e) => {
                    warn!(instance = id, error = %e, "platform load failed");
                    let _ = tx
                        .send(Err(Status::internal(format!("loading platforms: {e}"))))
                        .await;
                    return;
                }
            };
            let _ = tx
                .send(Ok(init_progress(
                    &format!("{} platforms loaded", platforms.len()),
                    50.0,
                    false,
                )))
                .await;
            let libraries = match loader.load_libraries().await {
                Ok(libraries) => libraries,
                Err(e) => {
                    warn!(instance = id, error = %e, "library load failed");
                    let _ = tx
                        .send(Err(Status::internal(format!("loading libraries: {e}"))))
                        .await;
                    return;
                }
            };
            guard.platforms = platforms;
            guard.libraries = libraries;
            guard.initialized = true;
            debug!(
                instance = id,
                platforms = guard.platforms.len(),
                libraries = guard.libraries.len(),
                "instance initialized"
            );
            let _ = tx
                .send(Ok(init_progress("Instance initialized", 100.0, true)))
                .await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn destroy(
        &self,
        request: Request<proto::DestroyRequest>,
    ) -> Result<Response<proto::DestroyResponse>, Status> {
        let id = instance_id(request.into_inner().instance)?;
        self.instances
            .destroy(id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        Ok(Response::new(proto::DestroyResponse {}))
    }

    async fn version(
        &self,
        _request: Request<proto::VersionRequest>,
    ) -> Result<Response<proto::VersionResponse>, Status> {
        Ok(Response::new(proto::VersionResponse {
            version: self.version.clone(),
        }))
    }

    async fn board_details(
        &self,
        request: Request<proto::BoardDetailsRequest>,
    ) -> Result<Response<proto::BoardDetailsResponse>, Status> {
        let req = request.into_inner();
        let id = instance_id(req.instance)?;
        let state = self
            .instances
            .get(id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        let guard = state.read().await;
        ensure_initialized(&guard, id)?;

        let fqbn: Fqbn = req
            .fqbn
            .parse()
            .map_err(|e: kiln::FqbnError| Status::invalid_argument(e.to_string()))?;
        let resolution = resolve_platforms(&guard.platforms, &fqbn)
            .map_err(|e| Status::not_found(e.to_string()))?;
        Ok(Response::new(proto::BoardDetailsResponse {
            name: resolution.board.name.clone(),
            fqbn: req.fqbn,
            board_platform: resolution.board_platform.id.clone(),
            build_platform: resolution.build_platform.id.clone(),
        }))
    }

    async fn platform_list(
        &self,
        request: Request<proto::PlatformListRequest>,
    ) -> Result<Response<proto::PlatformListResponse>, Status> {
        let id = instance_id(request.into_inner().instance)?;
        let state = self
            .instances
            .get(id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        let guard = state.read().await;
        ensure_initialized(&guard, id)?;

        let platforms = guard
            .platforms
            .iter()
            .map(|platform| proto::PlatformSummary {
                id: platform.id.clone(),
                name: platform.name.clone(),
                version: platform.version.clone(),
                maintainer: platform.maintainer.clone(),
                boards: platform
                    .boards
                    .iter()
                    .map(|board| board.name.clone())
                    .collect(),
            })
            .collect();
        Ok(Response::new(proto::PlatformListResponse { platforms }))
    }

    async fn library_list(
        &self,
        request: Request<proto::LibraryListRequest>,
    ) -> Result<Response<proto::LibraryListResponse>, Status> {
        let id = instance_id(request.into_inner().instance)?;
        let state = self
            .instances
            .get(id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        let guard = state.read().await;
        ensure_initialized(&guard, id)?;

        let libraries = guard
            .libraries
            .iter()
            .map(|library| proto::LibrarySummary {
                name: library.name.clone(),
                version: library.version.clone(),
                install_dir: library.install_dir.clone(),
            })
            .collect();
        Ok(Response::new(proto::LibraryListResponse { libraries }))
    }

    type CompileStream = CompileStream;

    async fn compile(
        &self,
        request: Request<proto::CompileRequest>,
    ) -> Result<Response<Self::CompileStream>, Status> {
        let req = request.into_inner();
        let id = instance_id(req.instance.clone())?;
        let state = self
            .instances
            .get(id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        let compile = compile_request_from_proto(req)?;
        // Reject bad FQBNs, conflicting modes and out-of-tree overrides
        // before the stream opens and before any toolchain work.
        compile.validate().map_err(compile_status)?;

        let provider = Arc::clone(&self.toolchains);
        let (tx, rx) = mpsc::channel::<Result<proto::CompileResponse, Status>>(32);
        tokio::spawn(async move {
            // Read lock: compiles share the instance concurrently but are
            // serialized against Init.
            let guard = state.read().await;
            if let Err(status) = ensure_initialized(&guard, id) {
                let _ = tx.send(Err(status)).await;
                return;
            }

            let (events_tx, mut events_rx) = mpsc::channel::<CompileEvent>(32);
            let pipeline = kiln::compile::run(&guard, provider.as_ref(), compile, events_tx);
            let outbound = tx.clone();
            let forward = async move {
                loop {
                    tokio::select! {
                        event = events_rx.recv() => match event {
                            Some(event) => {
                                if outbound.send(Ok(event_to_proto(event))).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        // Client gone: stop forwarding now, even while the
                        // pipeline is quiet. Dropping the event receiver
                        // (when this block ends) cancels the pipeline.
                        _ = outbound.closed() => break,
                    }
                }
            };
            let (result, ()) = tokio::join!(pipeline, forward);
            if let Err(e) = result {
                debug!(instance = id, error = %e, "compile failed");
                let _ = tx.send(Err(compile_status(e))).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
