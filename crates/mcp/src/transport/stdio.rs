//! Newline-delimited JSON over a reader/writer pair (stdin/stdout by default).

use super::{
    ErrorHandler, HealthStatus, NotificationHandler, RequestContext, RequestHandler, Transport,
    TransportCore,
};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use switchboard_core::ConnectionId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type BoxReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<BoxWriter>>;

struct ReadLoop {
    shutdown: CancellationToken,
    task: JoinHandle<BoxReader>,
}

/// Standard-stream transport. One peer, one connection, strictly ordered.
pub struct StdioTransport {
    core: Arc<TransportCore>,
    connection_id: ConnectionId,
    reader: Mutex<Option<BoxReader>>,
    writer: SharedWriter,
    eof: Arc<AtomicBool>,
    read_loop: Mutex<Option<ReadLoop>>,
}

impl StdioTransport {
    /// Transport over the process's stdin and stdout
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Transport over arbitrary streams, e.g. pipes or `tokio::io::duplex`
    pub fn with_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            core: Arc::new(TransportCore::new("stdio")),
            connection_id: ConnectionId::new(),
            reader: Mutex::new(Some(Box::new(BufReader::new(reader)))),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            eof: Arc::new(AtomicBool::new(false)),
            read_loop: Mutex::new(None),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&self) -> TransportResult<()> {
        self.core.begin_start()?;

        let Some(reader) = self.reader.lock().take() else {
            self.core.mark_stopped();
            return Err(TransportError::Config(
                "stdio input stream is unavailable".to_string(),
            ));
        };

        self.eof.store(false, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(read_loop(
            reader,
            self.core.clone(),
            self.writer.clone(),
            self.connection_id,
            self.eof.clone(),
            shutdown.clone(),
        ));
        *self.read_loop.lock() = Some(ReadLoop { shutdown, task });

        self.core.mark_running();
        tracing::info!(connection_id = %self.connection_id, "Stdio transport started");
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        if !self.core.begin_stop() {
            return Ok(());
        }

        let read_loop = self.read_loop.lock().take();
        if let Some(read_loop) = read_loop {
            read_loop.shutdown.cancel();
            match read_loop.task.await {
                Ok(reader) => *self.reader.lock() = Some(reader),
                Err(e) => tracing::warn!(error = %e, "Stdio read loop ended abnormally"),
            }
        }

        self.core.mark_stopped();
        tracing::info!("Stdio transport stopped");
        Ok(())
    }

    fn on_request(&self, handler: RequestHandler) {
        self.core.set_request_handler(handler);
    }

    fn on_notification(&self, handler: NotificationHandler) {
        self.core.set_notification_handler(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.core.set_error_handler(handler);
    }

    async fn send_request(&self, _request: JsonRpcRequest) -> TransportResult<JsonRpcResponse> {
        Err(TransportError::CorrelationUnsupported {
            transport: self.core.name().to_string(),
        })
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> TransportResult<()> {
        self.core.ensure_running()?;
        write_line(&self.writer, &notification).await?;
        self.core.record_sent();
        Ok(())
    }

    fn health_status(&self) -> HealthStatus {
        let eof = self.eof.load(Ordering::SeqCst);
        self.core.health(
            !eof,
            serde_json::json!({
                "connectionId": self.connection_id.to_string(),
                "eof": eof,
            }),
        )
    }
}

async fn write_line<T: Serialize>(writer: &SharedWriter, message: &T) -> TransportResult<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');

    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop(
    mut reader: BoxReader,
    core: Arc<TransportCore>,
    writer: SharedWriter,
    connection_id: ConnectionId,
    eof: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> BoxReader {
    let context = RequestContext::new(core.name()).with_connection(connection_id);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => {
                tracing::info!("Stdio input closed");
                eof.store(true, Ordering::SeqCst);
                break;
            }
            Ok(_) => {
                let bytes = line.trim_ascii();
                if bytes.is_empty() {
                    continue;
                }
                handle_line(bytes, &core, &writer, &context).await;
            }
            Err(e) => {
                core.report_error(&TransportError::Io(e));
                eof.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    reader
}

async fn handle_line(
    bytes: &[u8],
    core: &TransportCore,
    writer: &SharedWriter,
    context: &RequestContext,
) {
    let parsed = match std::str::from_utf8(bytes) {
        Ok(text) => JsonRpcMessage::parse(text),
        Err(e) => Err(MessageError {
            id: None,
            error: JsonRpcError::parse_error(e.to_string()),
        }),
    };
    let reply = match parsed {
        Ok(JsonRpcMessage::Request(request)) => {
            Some(core.dispatch_request(request, context.clone()).await)
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            core.dispatch_notification(notification, context.clone()).await;
            None
        }
        Ok(JsonRpcMessage::Response(response)) => {
            core.record_received();
            tracing::debug!(id = ?response.id, "Ignoring response on stdio, nothing is awaiting it");
            None
        }
        Err(err) => {
            core.record_received();
            core.record_error();
            tracing::warn!(error = %err.error, "Malformed message on stdio");
            Some(err.into_response())
        }
    };

    if let Some(reply) = reply {
        match write_line(writer, &reply).await {
            Ok(()) => core.record_sent(),
            Err(e) => core.report_error(&e),
        }
    }
}
