//! Port monitor service.
//!
//! A bidirectional stream: the first message opens a port session, later
//! messages carry TX bytes, and responses carry RX bytes. Actual port I/O
//! sits behind [`MonitorBackend`]; the default [`LoopbackBackend`] echoes TX
//! back as RX, which keeps the service a pure registration target until a
//! real port layer is wired in.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::proto::{self, monitor_request, monitor_response, monitor_server};

/// Opens port sessions for the monitor service.
#[async_trait]
pub trait MonitorBackend: Send + Sync {
    /// Open a session on the configured port, returning its TX/RX halves.
    async fn open(
        &self,
        config: &proto::MonitorPortConfig,
    ) -> io::Result<(Box<dyn MonitorWriter>, Box<dyn MonitorReader>)>;
}

/// TX half of a port session.
#[async_trait]
pub trait MonitorWriter: Send {
    /// Send bytes to the port.
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

/// RX half of a port session.
#[async_trait]
pub trait MonitorReader: Send {
    /// Next chunk from the port; `None` when the port closed.
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Backend that echoes TX data back as RX data.
#[derive(Debug, Default)]
pub struct LoopbackBackend;

#[async_trait]
impl MonitorBackend for LoopbackBackend {
    async fn open(
        &self,
        config: &proto::MonitorPortConfig,
    ) -> io::Result<(Box<dyn MonitorWriter>, Box<dyn MonitorReader>)> {
        debug!(port = %config.port, baudrate = config.baudrate, "opening loopback port");
        let (tx, rx) = mpsc::channel(32);
        Ok((
            Box::new(LoopbackWriter { tx }),
            Box::new(LoopbackReader { rx }),
        ))
    }
}

struct LoopbackWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl MonitorWriter for LoopbackWriter {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

struct LoopbackReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl MonitorReader for LoopbackReader {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

type CommunicateStream =
    Pin<Box<dyn Stream<Item = Result<proto::MonitorResponse, Status>> + Send>>;

/// The Monitor gRPC service.
pub struct MonitorService {
    backend: Arc<dyn MonitorBackend>,
}

impl std::fmt::Debug for MonitorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorService").finish_non_exhaustive()
    }
}

impl MonitorService {
    /// Service opening sessions through `backend`.
    pub fn new(backend: Arc<dyn MonitorBackend>) -> Self {
        Self { backend }
    }
}

fn response(msg: monitor_response::Msg) -> proto::MonitorResponse {
    proto::MonitorResponse { msg: Some(msg) }
}

#[tonic::async_trait]
impl monitor_server::Monitor for MonitorService {
    type CommunicateStream = CommunicateStream;

    async fn communicate(
        &self,
        request: Request<Streaming<proto::MonitorRequest>>,
    ) -> Result<Response<Self::CommunicateStream>, Status> {
        let mut inbound = request.into_inner();

        let config = match inbound.next().await {
            Some(Ok(message)) => match message.msg {
                Some(monitor_request::Msg::Open(config)) => config,
                _ => {
                    return Err(Status::invalid_argument(
                        "first message must open the port",
                    ));
                }
            },
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Status::invalid_argument(
                    "stream closed before port configuration",
                ));
            }
        };

        let (mut writer, mut reader) =
            self.backend.open(&config).await.map_err(|e| {
                Status::unavailable(format!("cannot open port {}: {e}", config.port))
            })?;

        let (tx, rx) = mpsc::channel::<Result<proto::MonitorResponse, Status>>(32);
        tokio::spawn(async move {
            let _ = tx
                .send(Ok(response(monitor_response::Msg::AppliedSettings(config))))
                .await;
            loop {
                tokio::select! {
                    message = inbound.next() => match message {
                        Some(Ok(m)) => match m.msg {
                            Some(monitor_request::Msg::TxData(data)) => {
                                if let Err(e) = writer.send(&data).await {
                                    let _ = tx
                                        .send(Ok(response(monitor_response::Msg::Error(
                                            format!("port write failed: {e}"),
                                        ))))
                                        .await;
                                    break;
                                }
                            }
                            Some(monitor_request::Msg::Close(_)) | None => break,
                            Some(monitor_request::Msg::Open(_)) => {
                                let _ = tx
                                    .send(Err(Status::invalid_argument(
                                        "port already configured",
                                    )))
                                    .await;
                                break;
                            }
                        },
                        Some(Err(_)) | None => break,
                    },
                    chunk = reader.recv() => match chunk {
                        Ok(Some(data)) => {
                            if tx
                                .send(Ok(response(monitor_response::Msg::RxData(data))))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx
                                .send(Ok(response(monitor_response::Msg::Error(
                                    format!("port read failed: {e}"),
                                ))))
                                .await;
                            break;
                        }
                    },
                }
            }
            let _ = tx
                .send(Ok(response(monitor_response::Msg::Success(true))))
                .await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
