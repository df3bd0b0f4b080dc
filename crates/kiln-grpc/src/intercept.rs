//! Diagnostic logging of gRPC calls.
//!
//! [`DebugLogLayer`] is a tower layer applied once at server construction,
//! wrapping every registered service uniformly; the services themselves are
//! unaware of it. It observes unary and streaming calls identically by
//! decoding the gRPC wire framing (one 5-byte header per message) as request
//! and response bodies flow through, so each streamed message is a separate
//! logged event. Payloads pass through untouched and errors propagate
//! unchanged.
//!
//! Lines go to stderr or, when configured, an appended file. With a
//! non-empty method allow-list, calls whose `/package.Service/Method` path
//! matches no entry pass through unobserved.

use std::fmt::Write as _;
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use crate::config::DebugOptions;
use crate::error::ConfigError;

/// Where diagnostic lines are written.
enum Sink {
    Stderr,
    File(std::fs::File),
}

/// Shared call logger: the sink plus the method allow-list.
pub struct CallLogger {
    sink: Mutex<Sink>,
    filters: Vec<String>,
}

impl std::fmt::Debug for CallLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLogger")
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

impl CallLogger {
    /// Build a logger from the daemon's debug options.
    ///
    /// Returns `Ok(None)` when call logging is disabled. The sink file is
    /// opened here, before any socket is bound, so a bad path fails startup.
    pub fn from_options(options: &DebugOptions) -> Result<Option<Arc<CallLogger>>, ConfigError> {
        options.validate()?;
        if !options.enabled {
            return Ok(None);
        }
        let sink = match &options.file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| ConfigError::DebugSink {
                        path: path.clone(),
                        source,
                    })?;
                Sink::File(file)
            }
            None => Sink::Stderr,
        };
        Ok(Some(Arc::new(CallLogger {
            sink: Mutex::new(sink),
            filters: options.filters.clone(),
        })))
    }

    /// Whether calls to `method` (a full `/pkg.Service/Method` path) are
    /// observed.
    fn observes(&self, method: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| method.contains(f.as_str()))
    }

    fn write_line(&self, line: &str) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Diagnostics must never fail the call they observe.
        let _ = match &mut *sink {
            Sink::Stderr => writeln!(std::io::stderr(), "{line}"),
            Sink::File(file) => writeln!(file, "{line}"),
        };
    }

    /// Flush buffered diagnostics; called before abrupt shutdown.
    pub fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            if let Sink::File(file) = &mut *sink {
                let _ = file.flush();
            }
        }
    }
}

/// Logger handle for one observed call.
struct CallSpan {
    logger: Arc<CallLogger>,
    method: String,
}

impl CallSpan {
    fn event(&self, what: &str) {
        let mut line = String::with_capacity(self.method.len() + what.len() + 1);
        let _ = write!(line, "{} {}", self.method, what);
        self.logger.write_line(&line);
    }
}

/// Incremental scanner over the gRPC wire framing: each message is a 1-byte
/// compression flag plus a 4-byte big-endian length plus the payload, and
/// HTTP/2 data frames may split or batch messages arbitrarily.
#[derive(Default)]
struct MessageScanner {
    header: [u8; 5],
    filled: usize,
    remaining: usize,
    message_len: usize,
}

impl MessageScanner {
    /// Feed one data chunk, invoking `on_message` once per completed
    /// message with its payload length.
    fn feed(&mut self, mut chunk: &[u8], on_message: &mut dyn FnMut(usize)) {
        loop {
            if self.filled < 5 {
                let take = (5 - self.filled).min(chunk.len());
                self.header[self.filled..self.filled + take].copy_from_slice(&chunk[..take]);
                self.filled += take;
                chunk = &chunk[take..];
                if self.filled < 5 {
                    return;
                }
                self.message_len = u32::from_be_bytes([
                    self.header[1],
                    self.header[2],
                    self.header[3],
                    self.header[4],
                ]) as usize;
                self.remaining = self.message_len;
            }
            let take = self.remaining.min(chunk.len());
            self.remaining -= take;
            chunk = &chunk[take..];
            if self.remaining > 0 {
                // Chunk exhausted mid-message.
                return;
            }
            on_message(self.message_len);
            self.filled = 0;
            if chunk.is_empty() {
                return;
            }
        }
    }
}

pin_project! {
    /// Body wrapper reporting each gRPC message that passes through it.
    ///
    /// With no span attached it is a pure pass-through.
    pub struct LoggedBody<B> {
        #[pin]
        inner: B,
        span: Option<Arc<CallSpan>>,
        direction: &'static str,
        scanner: MessageScanner,
        done: bool,
    }
}

impl<B> LoggedBody<B> {
    fn new(inner: B, span: Option<Arc<CallSpan>>, direction: &'static str) -> Self {
        Self {
            inner,
            span,
            direction,
            scanner: MessageScanner::default(),
            done: false,
        }
    }
}

impl<B> Body for LoggedBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let result = this.inner.poll_frame(cx);
        if let Some(span) = this.span.as_ref() {
            match &result {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Some(data) = frame.data_ref() {
                        let direction = *this.direction;
                        this.scanner.feed(data.as_ref(), &mut |len| {
                            span.event(&format!("{direction} message ({len} bytes)"));
                        });
                    } else if let Some(trailers) = frame.trailers_ref() {
                        if let Some(status) = trailers.get("grpc-status") {
                            span.event(&format!(
                                "call ended (grpc-status {})",
                                status.to_str().unwrap_or("?")
                            ));
                        }
                    }
                }
                Poll::Ready(None) if !*this.done => {
                    *this.done = true;
                    span.event(&format!("{} stream closed", this.direction));
                }
                _ => {}
            }
        }
        result
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Tower layer installing [`DebugLogService`] around the gRPC router.
#[derive(Debug, Clone, Default)]
pub struct DebugLogLayer {
    logger: Option<Arc<CallLogger>>,
}

impl DebugLogLayer {
    /// Layer logging through `logger`; with `None` every call passes
    /// through unobserved.
    pub fn new(logger: Option<Arc<CallLogger>>) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for DebugLogLayer {
    type Service = DebugLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DebugLogService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

/// Service wrapper that observes calls without altering them.
#[derive(Debug)]
pub struct DebugLogService<S> {
    inner: S,
    logger: Option<Arc<CallLogger>>,
}

impl<S: Clone> Clone for DebugLogService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            logger: self.logger.clone(),
        }
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for DebugLogService<S>
where
    S: Service<http::Request<tonic::body::BoxBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<tonic::codegen::StdError>,
{
    type Response = http::Response<LoggedBody<ResBody>>;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        let span = self.logger.as_ref().and_then(|logger| {
            let method = request.uri().path().to_string();
            logger.observes(&method).then(|| {
                Arc::new(CallSpan {
                    logger: Arc::clone(logger),
                    method,
                })
            })
        });
        if let Some(span) = &span {
            span.event("call started");
        }
        let (parts, body) = request.into_parts();
        let request = http::Request::from_parts(
            parts,
            tonic::body::boxed(LoggedBody::new(body, span.clone(), "received")),
        );
        let future = self.inner.call(request);
        Box::pin(async move {
            let response = future.await?;
            let (parts, body) = response.into_parts();
            Ok(http::Response::from_parts(
                parts,
                LoggedBody::new(body, span, "sent"),
            ))
        })
    }
}
