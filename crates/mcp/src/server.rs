//! MCP server: wires transports, sessions and the tool registry together and
//! routes protocol requests.

use crate::error::{McpError, McpResult, TransportError};
use crate::outbound::OutboundClient;
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, ServerCapabilities, ServerInfo,
    ToolsCapability, JSONRPC_VERSION, PROTOCOL_VERSION,
};
use crate::tools::{ToolContext, ToolRegistry};
use crate::transport::{
    notification_handler, request_handler, HealthStatus, RequestContext, Transport,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use switchboard_core::config::SessionConfig;
use switchboard_core::events::{CloseReason, EventBus, EventType};
use switchboard_core::metrics::ServerMetrics;
use switchboard_core::session::SessionManager;
use switchboard_core::{ConnectionId, SessionId};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SLOW_STARTUP: Duration = Duration::from_millis(400);

/// Builder for [`McpServer`]
pub struct McpServerBuilder {
    name: String,
    version: String,
    transports: Vec<Arc<dyn Transport>>,
    registry: Option<Arc<ToolRegistry>>,
    session_config: SessionConfig,
    events: Option<EventBus>,
    metrics: Option<Arc<ServerMetrics>>,
    outbound: Option<OutboundClient>,
}

impl McpServerBuilder {
    fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            transports: Vec::new(),
            registry: None,
            session_config: SessionConfig::default(),
            events: None,
            metrics: None,
            outbound: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a transport. Transports start in the order they are added.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn transports(mut self, transports: impl IntoIterator<Item = Arc<dyn Transport>>) -> Self {
        self.transports.extend(transports);
        self
    }

    pub fn tool_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn outbound(mut self, outbound: OutboundClient) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn build(self) -> McpServer {
        let events = self.events.unwrap_or_default();
        let metrics = self.metrics.unwrap_or_default();
        let sessions =
            SessionManager::new(&self.session_config, events.clone()).with_metrics(metrics.clone());

        McpServer {
            inner: Arc::new(ServerInner {
                info: ServerInfo {
                    name: self.name,
                    version: self.version,
                },
                transports: self.transports,
                registry: self.registry.unwrap_or_default(),
                sessions,
                bindings: RwLock::new(HashMap::new()),
                events,
                metrics,
                outbound: self.outbound,
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        }
    }
}

/// Session a stateful connection was bound to by its last `initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Live(SessionId),
    /// The session closed or expired. Requests on the connection are
    /// rejected until it initializes again.
    Ended(SessionId),
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    session_watcher: Option<JoinHandle<()>>,
}

struct ServerInner {
    info: ServerInfo,
    transports: Vec<Arc<dyn Transport>>,
    registry: Arc<ToolRegistry>,
    sessions: SessionManager,
    bindings: RwLock<HashMap<ConnectionId, Binding>>,
    events: EventBus,
    metrics: Arc<ServerMetrics>,
    outbound: Option<OutboundClient>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// MCP server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl McpServer {
    pub fn builder() -> McpServerBuilder {
        McpServerBuilder::new()
    }

    pub fn info(&self) -> &ServerInfo {
        &self.inner.info
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.inner.metrics
    }

    pub fn outbound(&self) -> Option<&OutboundClient> {
        self.inner.outbound.as_ref()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.running
    }

    /// Health of every transport, in start order
    pub fn health(&self) -> Vec<HealthStatus> {
        self.inner
            .transports
            .iter()
            .map(|t| t.health_status())
            .collect()
    }

    /// Register dispatch callbacks and start every transport in order.
    ///
    /// If a transport fails to start, the ones already started are stopped
    /// again and the error is returned; the server stays stopped.
    pub async fn start(&self) -> McpResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.running {
            return Err(McpError::AlreadyRunning);
        }

        let started = Instant::now();
        self.register_handlers();

        for (index, transport) in self.inner.transports.iter().enumerate() {
            if let Err(source) = transport.start().await {
                let name = transport.name().to_string();
                tracing::error!(transport = %name, error = %source, "Failed to start transport");
                self.inner.events.emit(EventType::TransportError {
                    transport: name.clone(),
                    message: source.to_string(),
                });
                for running in self.inner.transports[..index].iter().rev() {
                    self.inner.stop_transport(running.as_ref()).await;
                }
                return Err(McpError::StartFailed {
                    transport: name,
                    source,
                });
            }
            tracing::info!(transport = %transport.name(), "Transport started");
            self.inner.events.emit(EventType::TransportStarted {
                transport: transport.name().to_string(),
            });
        }

        lifecycle.session_watcher = Some(tokio::spawn(watch_sessions(
            Arc::downgrade(&self.inner),
            self.inner.events.subscribe(),
        )));
        lifecycle.running = true;

        let elapsed = started.elapsed();
        if elapsed >= SLOW_STARTUP {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "Slow server startup");
        }
        let transports: Vec<String> = self
            .inner
            .transports
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        tracing::info!(
            server = %self.inner.info.name,
            transports = ?transports,
            startup_ms = elapsed.as_millis() as u64,
            "MCP server started"
        );
        self.inner.events.emit(EventType::ServerStarted {
            transports,
            startup_ms: elapsed.as_millis() as u64,
        });
        Ok(())
    }

    /// Stop transports, close all sessions and the outbound pool. Stopping a
    /// stopped server is a no-op.
    pub async fn stop(&self) -> McpResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }
        lifecycle.running = false;

        if let Some(watcher) = lifecycle.session_watcher.take() {
            watcher.abort();
        }
        for transport in self.inner.transports.iter().rev() {
            self.inner.stop_transport(transport.as_ref()).await;
        }

        let closed = self.inner.sessions.close_all(CloseReason::Shutdown);
        self.inner.bindings.write().clear();
        if let Some(outbound) = &self.inner.outbound {
            outbound.close().await;
        }

        tracing::info!(sessions_closed = closed, "MCP server stopped");
        self.inner.events.emit(EventType::ServerStopped);
        Ok(())
    }

    /// Route one request. Always produces exactly one response.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> JsonRpcResponse {
        self.inner.handle_request(request, context).await
    }

    pub fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        context: RequestContext,
    ) {
        self.inner.handle_notification(notification, context)
    }

    /// Handlers hold a weak reference so transports do not keep the server
    /// alive.
    fn register_handlers(&self) {
        for transport in &self.inner.transports {
            let weak = Arc::downgrade(&self.inner);
            transport.on_request(request_handler(move |request, context| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.handle_request(request, context).await,
                        None => JsonRpcResponse::error(
                            Some(request.id),
                            JsonRpcError::internal_error("Server is shut down"),
                        ),
                    }
                }
            }));

            let weak = Arc::downgrade(&self.inner);
            transport.on_notification(notification_handler(move |notification, context| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_notification(notification, context);
                    }
                }
            }));

            let events = self.inner.events.clone();
            let name = transport.name().to_string();
            transport.on_error(Arc::new(move |error: &TransportError| {
                events.emit(EventType::TransportError {
                    transport: name.clone(),
                    message: error.to_string(),
                });
            }));
        }
    }
}

impl ServerInner {
    async fn stop_transport(&self, transport: &dyn Transport) {
        match transport.stop().await {
            Ok(()) => {
                tracing::info!(transport = %transport.name(), "Transport stopped");
                self.events.emit(EventType::TransportStopped {
                    transport: transport.name().to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(transport = %transport.name(), error = %e, "Failed to stop transport");
                self.events.emit(EventType::TransportError {
                    transport: transport.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Mark every connection bound to this session as ended
    fn end_session(&self, session_id: &SessionId) {
        for binding in self.bindings.write().values_mut() {
            if *binding == Binding::Live(*session_id) {
                *binding = Binding::Ended(*session_id);
            }
        }
    }

    /// Session for this message: the explicit id, else the one bound to the
    /// connection. A closed or expired session is returned as the error, and
    /// stays an error for a bound connection until it re-initializes.
    fn resolve_session(&self, context: &RequestContext) -> Result<Option<SessionId>, SessionId> {
        let bound = context
            .connection_id
            .and_then(|connection| self.bindings.read().get(&connection).copied());
        let session_id = match (context.session_id, bound) {
            (Some(explicit), _) => explicit,
            (None, Some(Binding::Live(session_id))) => session_id,
            (None, Some(Binding::Ended(session_id))) => return Err(session_id),
            (None, None) => return Ok(None),
        };

        match self.sessions.touch(&session_id) {
            Ok(()) => Ok(Some(session_id)),
            Err(_) => {
                self.end_session(&session_id);
                Err(session_id)
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest, context: RequestContext) -> JsonRpcResponse {
        if let Err(error) = validate_envelope(&request) {
            tracing::debug!(method = %request.method, error = %error, "Invalid request envelope");
            return JsonRpcResponse::error(Some(request.id), error);
        }

        if request.method == "initialize" {
            self.metrics.record_request(&request.method, None);
            return self.initialize(request, &context);
        }

        let session_id = match self.resolve_session(&context) {
            Ok(session_id) => session_id,
            Err(stale) => {
                tracing::debug!(session_id = %stale, method = %request.method, "Request for unknown session");
                return JsonRpcResponse::error(
                    Some(request.id),
                    JsonRpcError::session_not_found(&stale),
                );
            }
        };
        self.metrics
            .record_request(&request.method, session_id.as_ref());
        tracing::debug!(
            method = %request.method,
            transport = %context.transport,
            session_id = ?session_id,
            "Handling request"
        );

        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        match method.as_str() {
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let result = ListToolsResult {
                    tools: self.registry.list(),
                };
                match serde_json::to_value(result) {
                    Ok(value) => JsonRpcResponse::success(id, value),
                    Err(e) => JsonRpcResponse::error(Some(id), JsonRpcError::internal_error(e.to_string())),
                }
            }
            "tools/call" => {
                let params: CallToolParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(error) => return JsonRpcResponse::error(Some(id), error),
                };
                self.call_tool(id, params, session_id, &context).await
            }
            "session/close" => {
                let closed = session_id
                    .and_then(|session_id| self.sessions.close(&session_id, CloseReason::Explicit))
                    .is_some();
                if let Some(session_id) = session_id {
                    self.end_session(&session_id);
                }
                JsonRpcResponse::success(id, json!({ "closed": closed }))
            }
            _ => JsonRpcResponse::error(Some(id), JsonRpcError::method_not_found(&method)),
        }
    }

    fn initialize(&self, request: JsonRpcRequest, context: &RequestContext) -> JsonRpcResponse {
        let params: InitializeParams = match request.params {
            None | Some(Value::Null) => InitializeParams::default(),
            Some(params) => match parse_params(Some(params)) {
                Ok(params) => params,
                Err(error) => return JsonRpcResponse::error(Some(request.id), error),
            },
        };

        let session = self.sessions.create_session(
            params.client_info,
            params.capabilities,
            params.protocol_version,
        );

        if let Some(connection_id) = context.connection_id {
            let previous = self
                .bindings
                .write()
                .insert(connection_id, Binding::Live(session.id));
            if let Some(Binding::Live(previous)) = previous {
                self.sessions.close(&previous, CloseReason::Replaced);
            }
        }

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: self.info.clone(),
            session_id: session.id,
        };
        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => JsonRpcResponse::error(Some(request.id), JsonRpcError::internal_error(e.to_string())),
        }
    }

    async fn call_tool(
        &self,
        id: crate::protocol::RequestId,
        params: CallToolParams,
        session_id: Option<SessionId>,
        context: &RequestContext,
    ) -> JsonRpcResponse {
        self.events.emit(EventType::ToolCallStarted {
            tool: params.name.clone(),
            session_id,
        });

        let tool_context = ToolContext {
            session_id,
            request_id: Some(id.clone()),
            transport: Some(context.transport.clone()),
            cancellation: CancellationToken::new(),
            outbound: self.outbound.clone(),
        };
        let started = Instant::now();
        let result = self
            .registry
            .call(&params.name, params.arguments, tool_context)
            .await;
        let duration = started.elapsed();

        self.metrics
            .record_tool_call(&params.name, session_id.as_ref(), duration, result.success);
        self.events.emit(EventType::ToolCallCompleted {
            tool: params.name.clone(),
            session_id,
            success: result.success,
            duration_ms: duration.as_millis() as u64,
        });

        match (result.data, result.error) {
            (_, Some(error)) => JsonRpcResponse::error(Some(id), error.into()),
            (data, None) => JsonRpcResponse::success(id, data.unwrap_or(Value::Null)),
        }
    }

    fn handle_notification(&self, notification: JsonRpcNotification, context: RequestContext) {
        let session_id = self.resolve_session(&context).ok().flatten();
        match notification.method.as_str() {
            "notifications/initialized" => {
                tracing::debug!(session_id = ?session_id, "Client finished initialization")
            }
            "notifications/cancelled" => tracing::debug!(
                session_id = ?session_id,
                params = ?notification.params,
                "Client cancelled a request"
            ),
            method => tracing::debug!(method = %method, session_id = ?session_id, "Notification"),
        }
    }
}

fn validate_envelope(request: &JsonRpcRequest) -> Result<(), JsonRpcError> {
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(JsonRpcError::invalid_request(format!(
            "jsonrpc must be \"{}\"",
            JSONRPC_VERSION
        )));
    }
    if request.method.is_empty() {
        return Err(JsonRpcError::invalid_request("method must not be empty"));
    }
    match &request.params {
        None | Some(Value::Object(_)) | Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(JsonRpcError::invalid_request(
            "params must be an object or an array",
        )),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("missing params"))?;
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

/// End connection bindings for sessions that expire or close
async fn watch_sessions(
    server: Weak<ServerInner>,
    mut events: tokio::sync::broadcast::Receiver<switchboard_core::events::Event>,
) {
    loop {
        let session_id = match events.recv().await {
            Ok(event) => match event.event_type {
                EventType::SessionExpired { session_id }
                | EventType::SessionClosed { session_id, .. } => session_id,
                _ => continue,
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session watcher lagged behind lifecycle events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let Some(server) = server.upgrade() else { return };
        server.end_session(&session_id);
    }
}
