//! Debug session service.
//!
//! A bidirectional stream bridging the client to a spawned debugger
//! process: the first message selects the program and interpreter, later
//! messages feed the debugger's stdin, and its stdout streams back. The
//! debugger itself is an external collaborator; this service only owns the
//! session plumbing.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use kiln::instance::InstanceRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::proto::{self, debug_request, debug_response, debug_server};

type SessionStream = Pin<Box<dyn Stream<Item = Result<proto::DebugResponse, Status>> + Send>>;

/// The Debug gRPC service.
pub struct DebugService {
    instances: Arc<InstanceRegistry>,
}

impl std::fmt::Debug for DebugService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugService").finish_non_exhaustive()
    }
}

impl DebugService {
    /// Service validating instances against `instances`.
    pub fn new(instances: Arc<InstanceRegistry>) -> Self {
        Self { instances }
    }
}

fn data_response(data: Vec<u8>) -> proto::DebugResponse {
    proto::DebugResponse {
        msg: Some(debug_response::Msg::Data(data)),
    }
}

#[tonic::async_trait]
impl debug_server::Debug for DebugService {
    type SessionStream = SessionStream;

    async fn session(
        &self,
        request: Request<Streaming<proto::DebugRequest>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let mut inbound = request.into_inner();

        let config = match inbound.next().await {
            Some(Ok(message)) => match message.msg {
                Some(debug_request::Msg::Init(config)) => config,
                _ => {
                    return Err(Status::invalid_argument(
                        "first message must configure the session",
                    ));
                }
            },
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Status::invalid_argument(
                    "stream closed before session configuration",
                ));
            }
        };

        let instance = config
            .instance
            .ok_or_else(|| Status::invalid_argument("missing instance"))?;
        self.instances
            .get(instance.id)
            .map_err(|e| Status::not_found(e.to_string()))?;

        let interpreter = if config.interpreter.is_empty() {
            "gdb"
        } else {
            config.interpreter.as_str()
        };
        let mut command = Command::new(interpreter);
        if !config.executable.is_empty() {
            command.arg(&config.executable);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Status::failed_precondition(format!("cannot start debugger {interpreter}: {e}"))
            })?;
        debug!(interpreter, executable = %config.executable, "debug session started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Status::internal("debugger stdin unavailable"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Status::internal("debugger stdout unavailable"))?;

        let (tx, rx) = mpsc::channel::<Result<proto::DebugResponse, Status>>(32);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    message = inbound.next() => match message {
                        Some(Ok(m)) => match m.msg {
                            Some(debug_request::Msg::Data(data)) => {
                                if stdin.write_all(&data).await.is_err() {
                                    break;
                                }
                            }
                            Some(debug_request::Msg::SendInterrupt(_)) => {
                                // ETX, what a terminal Ctrl-C would deliver.
                                if stdin.write_all(&[0x03]).await.is_err() {
                                    break;
                                }
                            }
                            Some(debug_request::Msg::Init(_)) => {
                                let _ = tx
                                    .send(Err(Status::invalid_argument(
                                        "session already configured",
                                    )))
                                    .await;
                                break;
                            }
                            None => break,
                        },
                        Some(Err(_)) | None => break,
                    },
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(Ok(data_response(buf[..n].to_vec()))).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
            // Session over, one way or another: take the debugger down.
            let _ = child.start_kill();
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
