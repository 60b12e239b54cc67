//! WebSocket transport: an axum `ws` listener for inbound peers and a
//! tokio-tungstenite duplex client for outbound calls.
//!
//! Outbound requests are correlated by id through a pending map. Requests the
//! remote peer sends back over the client connection are handled one at a
//! time, in arrival order, by a per-connection worker.

use super::{
    ErrorHandler, HealthStatus, NotificationHandler, RequestContext, RequestHandler, Transport,
    TransportCore,
};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::config::{RetryConfig, WebSocketSettings};
use switchboard_core::ConnectionId;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sent to every peer right after the upgrade completes
const CONNECTED_NOTIFICATION: &str = r#"{"jsonrpc":"2.0","method":"connected"}"#;

/// State of the outbound client connection, shared with its tasks
#[derive(Default)]
struct ClientState {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    exhausted: AtomicBool,
}

impl ClientState {
    /// Drop every pending sender so waiting callers see the connection close
    fn fail_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        pending.len()
    }

    fn resolve(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            tracing::warn!(error = ?response.error, "Received response without id");
            return;
        };
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => tracing::debug!(id = %id, "Dropping response for unknown or expired request"),
        }
    }
}

struct ListenerState {
    core: Arc<TransportCore>,
    auth_token: Option<String>,
    shutdown: CancellationToken,
    connections: AtomicUsize,
}

struct Runtime {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    listener: Option<Arc<ListenerState>>,
}

/// WebSocket transport
pub struct WebSocketTransport {
    core: Arc<TransportCore>,
    settings: WebSocketSettings,
    reconnect: RetryConfig,
    auth_token: Option<String>,
    client: Arc<ClientState>,
    runtime: Mutex<Option<Runtime>>,
}

impl WebSocketTransport {
    pub fn new(settings: WebSocketSettings, reconnect: RetryConfig) -> TransportResult<Self> {
        if let Some(remote) = &settings.remote_url {
            let url = url::Url::parse(remote)
                .map_err(|e| TransportError::Config(format!("invalid remote_url {}: {}", remote, e)))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(TransportError::Config(format!(
                    "remote_url must use ws:// or wss://, got {}",
                    remote
                )));
            }
        }

        Ok(Self {
            core: Arc::new(TransportCore::new("websocket")),
            settings,
            reconnect,
            auth_token: None,
            client: Arc::new(ClientState::default()),
            runtime: Mutex::new(None),
        })
    }

    /// Require `Authorization: Bearer <token>` on inbound upgrades
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().and_then(|r| r.local_addr)
    }

    fn pending_count(&self) -> usize {
        self.client.pending.lock().len()
    }

    async fn bind_listener(
        &self,
        bind: &str,
        shutdown: &CancellationToken,
    ) -> TransportResult<(SocketAddr, Arc<ListenerState>, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .map_err(|source| TransportError::Bind {
                addr: bind.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(ListenerState {
            core: self.core.clone(),
            auth_token: self.auth_token.clone(),
            shutdown: shutdown.clone(),
            connections: AtomicUsize::new(0),
        });
        let router = Router::new()
            .route(&self.settings.path, get(ws_handler))
            .with_state(state.clone());

        let token = shutdown.clone();
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                core.report_error(&TransportError::Io(e));
            }
        });

        tracing::info!(addr = %local_addr, path = %self.settings.path, "WebSocket transport listening");
        Ok((local_addr, state, task))
    }

    async fn connect_client(&self, url: &str) -> TransportResult<ClientStream> {
        tracing::debug!(url = %url, "Connecting to WebSocket peer");
        let timeout = self.settings.request_timeout();
        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        tracing::info!(url = %url, "WebSocket connected");
        Ok(stream)
    }

    fn client_sender(&self) -> TransportResult<mpsc::UnboundedSender<Message>> {
        if self.settings.remote_url.is_none() {
            return Err(TransportError::Config(
                "websocket transport has no remote_url configured".to_string(),
            ));
        }
        self.client
            .outgoing
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)
    }
}

// A transport dropped while running (e.g. a pooled connection abandoned by
// an aborted task) must not leave its listener or client tasks behind.
impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown.cancel();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&self) -> TransportResult<()> {
        self.core.begin_start()?;

        let shutdown = CancellationToken::new();
        let mut runtime = Runtime {
            shutdown: shutdown.clone(),
            tasks: Vec::new(),
            local_addr: None,
            listener: None,
        };

        if let Some(bind) = &self.settings.bind {
            match self.bind_listener(bind, &shutdown).await {
                Ok((addr, state, task)) => {
                    runtime.local_addr = Some(addr);
                    runtime.listener = Some(state);
                    runtime.tasks.push(task);
                }
                Err(e) => {
                    self.core.mark_stopped();
                    return Err(e);
                }
            }
        }

        if let Some(url) = &self.settings.remote_url {
            self.client.exhausted.store(false, Ordering::SeqCst);
            self.client.reconnecting.store(false, Ordering::SeqCst);
            match self.connect_client(url).await {
                Ok(stream) => {
                    runtime.tasks.push(tokio::spawn(run_client(
                        stream,
                        url.clone(),
                        self.core.clone(),
                        self.client.clone(),
                        self.reconnect.clone(),
                        shutdown.clone(),
                    )));
                }
                Err(e) => {
                    shutdown.cancel();
                    for task in runtime.tasks {
                        let _ = task.await;
                    }
                    self.core.mark_stopped();
                    return Err(e);
                }
            }
        }

        *self.runtime.lock() = Some(runtime);
        self.core.mark_running();
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        if !self.core.begin_stop() {
            return Ok(());
        }

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown.cancel();
            for task in runtime.tasks {
                if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                    tracing::warn!("WebSocket task did not stop in time");
                }
            }
        }
        self.client.fail_pending();

        self.core.mark_stopped();
        tracing::info!("WebSocket transport stopped");
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

    async fn send_request(&self, request: JsonRpcRequest) -> TransportResult<JsonRpcResponse> {
        self.core.ensure_running()?;
        let sender = self.client_sender()?;
        let id = request.id.clone();
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.client.pending.lock();
            if pending.contains_key(&id) {
                return Err(TransportError::DuplicateRequestId(id));
            }
            pending.insert(id.clone(), tx);
        }

        if sender.send(Message::Text(text)).is_err() {
            self.client.pending.lock().remove(&id);
            return Err(TransportError::ConnectionClosed);
        }
        self.core.record_sent();

        let timeout = self.settings.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.client.pending.lock().remove(&id);
                tracing::warn!(id = %id, method = %request.method, "WebSocket request timed out");
                Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> TransportResult<()> {
        self.core.ensure_running()?;
        let sender = self.client_sender()?;
        let text = serde_json::to_string(&notification)?;
        sender
            .send(Message::Text(text))
            .map_err(|_| TransportError::ConnectionClosed)?;
        self.core.record_sent();
        Ok(())
    }

    fn health_status(&self) -> HealthStatus {
        let runtime = self.runtime.lock();
        let connections = runtime
            .as_ref()
            .and_then(|r| r.listener.as_ref())
            .map(|l| l.connections.load(Ordering::SeqCst))
            .unwrap_or(0);
        let local_addr = runtime.as_ref().and_then(|r| r.local_addr);
        drop(runtime);

        let connected = self.client.connected.load(Ordering::SeqCst);
        let reconnecting = self.client.reconnecting.load(Ordering::SeqCst);
        let exhausted = self.client.exhausted.load(Ordering::SeqCst);
        let client_healthy = self.settings.remote_url.is_none() || connected || reconnecting;

        self.core.health(
            client_healthy && !exhausted,
            json!({
                "listening": local_addr.map(|a| a.to_string()),
                "connections": connections,
                "remoteUrl": self.settings.remote_url,
                "connected": connected,
                "reconnecting": reconnecting,
                "pending": self.pending_count(),
            }),
        )
    }
}

/// Own the client connection for the life of the transport, reconnecting
/// with backoff when it drops.
async fn run_client(
    mut stream: ClientStream,
    url: String,
    core: Arc<TransportCore>,
    client: Arc<ClientState>,
    reconnect: RetryConfig,
    shutdown: CancellationToken,
) {
    loop {
        serve_client_connection(stream, &core, &client, &shutdown).await;

        let failed = client.fail_pending();
        if shutdown.is_cancelled() {
            return;
        }

        tracing::warn!(url = %url, failed_requests = failed, "WebSocket connection lost");
        core.report_error(&TransportError::ConnectionClosed);
        client.reconnecting.store(true, Ordering::SeqCst);

        let mut attempt = 0;
        stream = loop {
            if attempt >= reconnect.max_retries {
                tracing::error!(url = %url, attempts = attempt, "Giving up on WebSocket reconnect");
                client.reconnecting.store(false, Ordering::SeqCst);
                client.exhausted.store(true, Ordering::SeqCst);
                return;
            }

            let backoff = reconnect.backoff_for_attempt(attempt);
            attempt += 1;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            let connected = tokio::select! {
                _ = shutdown.cancelled() => return,
                connected = connect_async(url.as_str()) => connected,
            };
            match connected {
                Ok((stream, _)) => break stream,
                Err(e) => tracing::warn!(url = %url, attempt, error = %e, "WebSocket reconnect failed"),
            }
        };

        client.reconnecting.store(false, Ordering::SeqCst);
        tracing::info!(url = %url, "WebSocket reconnected");
    }
}

enum PeerMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

async fn serve_client_connection(
    stream: ClientStream,
    core: &Arc<TransportCore>,
    client: &Arc<ClientState>,
    shutdown: &CancellationToken,
) {
    let (mut write, mut read) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *client.outgoing.lock() = Some(out_tx.clone());
    client.connected.store(true, Ordering::SeqCst);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                tracing::debug!(error = %e, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<PeerMessage>();
    let worker = {
        let core = core.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let context = RequestContext::new(core.name()).with_connection(ConnectionId::new());
            while let Some(message) = work_rx.recv().await {
                match message {
                    PeerMessage::Request(request) => {
                        let response = core.dispatch_request(request, context.clone()).await;
                        let text = match serde_json::to_string(&response) {
                            Ok(text) => text,
                            Err(e) => {
                                core.report_error(&e.into());
                                continue;
                            }
                        };
                        if out_tx.send(Message::Text(text)).is_err() {
                            break;
                        }
                        core.record_sent();
                    }
                    PeerMessage::Notification(notification) => {
                        core.dispatch_notification(notification, context.clone()).await
                    }
                }
            }
        })
    };

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = out_tx.send(Message::Close(None));
                break;
            }
            message = read.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match JsonRpcMessage::parse(&text) {
                Ok(JsonRpcMessage::Response(response)) => {
                    core.record_received();
                    client.resolve(response);
                }
                Ok(JsonRpcMessage::Request(request)) => {
                    let _ = work_tx.send(PeerMessage::Request(request));
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    if notification.method == "connected" {
                        core.record_received();
                        tracing::debug!("WebSocket peer acknowledged connection");
                    } else {
                        let _ = work_tx.send(PeerMessage::Notification(notification));
                    }
                }
                Err(err) => {
                    core.record_received();
                    core.record_error();
                    tracing::warn!(error = %err.error, "Malformed WebSocket message from peer");
                    if let Ok(text) = serde_json::to_string(&err.into_response()) {
                        let _ = out_tx.send(Message::Text(text));
                    }
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    client.connected.store(false, Ordering::SeqCst);
    client.outgoing.lock().take();
    worker.abort();
    drop(work_tx);
    drop(out_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map_or(false, |presented| presented == token)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<ListenerState>>,
) -> Response {
    if let Some(token) = &state.auth_token {
        if !authorized(&headers, token) {
            state.core.record_error();
            return (
                StatusCode::UNAUTHORIZED,
                Json(JsonRpcResponse::error(None, JsonRpcError::unauthorized())),
            )
                .into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one inbound peer. Messages are handled in arrival order.
async fn handle_socket(mut socket: WebSocket, state: Arc<ListenerState>) {
    let connection_id = ConnectionId::new();
    let context = RequestContext::new(state.core.name()).with_connection(connection_id);
    state.connections.fetch_add(1, Ordering::SeqCst);
    tracing::info!(connection_id = %connection_id, "WebSocket peer connected");

    if socket
        .send(AxumMessage::Text(CONNECTED_NOTIFICATION.into()))
        .await
        .is_ok()
    {
        state.core.record_sent();
    }

    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(AxumMessage::Close(None)).await;
                break;
            }
            message = socket.recv() => message,
        };

        let reply = match message {
            Some(Ok(AxumMessage::Text(text))) => match JsonRpcMessage::parse(text.as_str()) {
                Ok(JsonRpcMessage::Request(request)) => {
                    Some(state.core.dispatch_request(request, context.clone()).await)
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    state
                        .core
                        .dispatch_notification(notification, context.clone())
                        .await;
                    None
                }
                Ok(JsonRpcMessage::Response(response)) => {
                    state.core.record_received();
                    tracing::debug!(id = ?response.id, "Ignoring response from WebSocket peer");
                    None
                }
                Err(err) => {
                    state.core.record_received();
                    state.core.record_error();
                    tracing::warn!(error = %err.error, "Malformed WebSocket message");
                    Some(err.into_response())
                }
            },
            Some(Ok(AxumMessage::Ping(data))) => {
                let _ = socket.send(AxumMessage::Pong(data)).await;
                None
            }
            Some(Ok(AxumMessage::Close(_))) | None => break,
            Some(Ok(_)) => None,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "WebSocket receive failed");
                break;
            }
        };

        if let Some(reply) = reply {
            let text = match serde_json::to_string(&reply) {
                Ok(text) => text,
                Err(e) => {
                    state.core.report_error(&e.into());
                    continue;
                }
            };
            if socket.send(AxumMessage::Text(text.into())).await.is_err() {
                break;
            }
            state.core.record_sent();
        }
    }

    state.connections.fetch_sub(1, Ordering::SeqCst);
    tracing::info!(connection_id = %connection_id, "WebSocket peer disconnected");
}
