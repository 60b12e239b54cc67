//! Transport abstraction and its stdio, HTTP, WebSocket and in-process
//! variants.
//!
//! A transport moves protocol messages between the server and its peers. It
//! hands inbound requests and notifications to the callbacks registered with
//! [`Transport::on_request`] and [`Transport::on_notification`], and sends
//! outbound messages with [`Transport::send_request`] and
//! [`Transport::send_notification`].

mod http;
mod in_process;
mod stdio;
mod websocket;

pub use http::{HttpTransport, SESSION_HEADER};
pub use in_process::InProcessTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

use crate::error::{TransportError, TransportResult};
use crate::protocol::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_core::{ConnectionId, SessionId};

/// Where an inbound message came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Name of the transport that received the message
    pub transport: String,
    /// Stable id of the peer connection, when the transport has one
    pub connection_id: Option<ConnectionId>,
    /// Session id supplied out of band (e.g. the `Mcp-Session-Id` header)
    pub session_id: Option<SessionId>,
}

impl RequestContext {
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            connection_id: None,
            session_id: None,
        }
    }

    pub fn with_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }
}

pub type RequestHandler =
    Arc<dyn Fn(JsonRpcRequest, RequestContext) -> BoxFuture<'static, JsonRpcResponse> + Send + Sync>;

pub type NotificationHandler =
    Arc<dyn Fn(JsonRpcNotification, RequestContext) -> BoxFuture<'static, ()> + Send + Sync>;

pub type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Wrap an async closure as a [`RequestHandler`]
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(JsonRpcRequest, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JsonRpcResponse> + Send + 'static,
{
    Arc::new(
        move |request: JsonRpcRequest, context: RequestContext| -> BoxFuture<'static, JsonRpcResponse> {
            Box::pin(f(request, context))
        },
    )
}

/// Wrap an async closure as a [`NotificationHandler`]
pub fn notification_handler<F, Fut>(f: F) -> NotificationHandler
where
    F: Fn(JsonRpcNotification, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(
        move |notification: JsonRpcNotification, context: RequestContext| -> BoxFuture<'static, ()> {
            Box::pin(f(notification, context))
        },
    )
}

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time health report for one transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub transport: String,
    pub healthy: bool,
    pub state: TransportState,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub details: serde_json::Value,
}

/// A bidirectional message channel between the server and its peers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind, used in logs, events and request contexts
    fn name(&self) -> &str;

    /// Start accepting and sending messages. Fails with `AlreadyRunning`
    /// unless the transport is stopped.
    async fn start(&self) -> TransportResult<()>;

    /// Stop the transport. Stopping a stopped transport is a no-op.
    async fn stop(&self) -> TransportResult<()>;

    fn on_request(&self, handler: RequestHandler);

    fn on_notification(&self, handler: NotificationHandler);

    /// Observe errors the transport recovers from on its own
    fn on_error(&self, handler: ErrorHandler);

    /// Send a request and wait for the correlated response
    async fn send_request(&self, request: JsonRpcRequest) -> TransportResult<JsonRpcResponse>;

    async fn send_notification(&self, notification: JsonRpcNotification) -> TransportResult<()>;

    fn health_status(&self) -> HealthStatus;
}

/// State and dispatch plumbing shared by every transport implementation
pub(crate) struct TransportCore {
    name: String,
    state: Mutex<TransportState>,
    request_handler: RwLock<Option<RequestHandler>>,
    notification_handler: RwLock<Option<NotificationHandler>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    received: AtomicU64,
    sent: AtomicU64,
    errors: AtomicU64,
}

impl TransportCore {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(TransportState::Stopped),
            request_handler: RwLock::new(None),
            notification_handler: RwLock::new(None),
            error_handler: RwLock::new(None),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == TransportState::Running
    }

    /// `stopped -> starting`; any other state is `AlreadyRunning`
    pub(crate) fn begin_start(&self) -> TransportResult<()> {
        let mut state = self.state.lock();
        if *state != TransportState::Stopped {
            return Err(TransportError::AlreadyRunning {
                transport: self.name.clone(),
            });
        }
        *state = TransportState::Starting;
        Ok(())
    }

    pub(crate) fn mark_running(&self) {
        *self.state.lock() = TransportState::Running;
    }

    pub(crate) fn mark_stopped(&self) {
        *self.state.lock() = TransportState::Stopped;
    }

    /// `running -> stopping`. Returns false when there is nothing to stop.
    pub(crate) fn begin_stop(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TransportState::Running {
            return false;
        }
        *state = TransportState::Stopping;
        true
    }

    pub(crate) fn ensure_running(&self) -> TransportResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransportError::NotRunning {
                transport: self.name.clone(),
            })
        }
    }

    pub(crate) fn set_request_handler(&self, handler: RequestHandler) {
        *self.request_handler.write() = Some(handler);
    }

    pub(crate) fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.notification_handler.write() = Some(handler);
    }

    pub(crate) fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write() = Some(handler);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count, log and forward an error the transport recovered from
    pub(crate) fn report_error(&self, error: &TransportError) {
        self.record_error();
        tracing::warn!(transport = %self.name, error = %error, "Transport error");
        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Run the request handler; a request with no handler gets -32603
    pub(crate) async fn dispatch_request(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> JsonRpcResponse {
        self.record_received();
        let handler = self.request_handler.read().clone();
        match handler {
            Some(handler) => handler(request, context).await,
            None => {
                tracing::warn!(
                    transport = %self.name,
                    method = %request.method,
                    "No request handler registered"
                );
                JsonRpcResponse::error(
                    Some(request.id),
                    JsonRpcError::internal_error("No request handler registered"),
                )
            }
        }
    }

    pub(crate) async fn dispatch_notification(
        &self,
        notification: JsonRpcNotification,
        context: RequestContext,
    ) {
        self.record_received();
        let handler = self.notification_handler.read().clone();
        match handler {
            Some(handler) => handler(notification, context).await,
            None => tracing::debug!(
                transport = %self.name,
                method = %notification.method,
                "Dropping notification, no handler registered"
            ),
        }
    }

    /// Health report; `healthy` is false whenever the transport is not running
    pub(crate) fn health(&self, healthy: bool, details: serde_json::Value) -> HealthStatus {
        let state = self.state();
        HealthStatus {
            transport: self.name.clone(),
            healthy: healthy && state == TransportState::Running,
            state,
            messages_received: self.received.load(Ordering::Relaxed),
            messages_sent: self.sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_transitions() {
        let core = TransportCore::new("test");
        assert!(!core.begin_stop());

        core.begin_start().unwrap();
        assert!(matches!(
            core.begin_start(),
            Err(TransportError::AlreadyRunning { .. })
        ));
        core.mark_running();
        assert!(core.ensure_running().is_ok());

        assert!(core.begin_stop());
        assert!(!core.begin_stop());
        core.mark_stopped();
        assert!(matches!(
            core.ensure_running(),
            Err(TransportError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_without_handler_returns_internal_error() {
        let core = TransportCore::new("test");
        let response = core
            .dispatch_request(
                JsonRpcRequest::new(1, "ping", None),
                RequestContext::new("test"),
            )
            .await;

        assert_eq!(response.id, Some(1.into()));
        assert_eq!(response.error.unwrap().code, -32603);
    }

    #[tokio::test]
    async fn test_dispatch_uses_registered_handler() {
        let core = TransportCore::new("test");
        core.set_request_handler(request_handler(|req, ctx| async move {
            JsonRpcResponse::success(req.id, json!({ "transport": ctx.transport }))
        }));

        let response = core
            .dispatch_request(
                JsonRpcRequest::new("x", "ping", None),
                RequestContext::new("test"),
            )
            .await;
        assert_eq!(response.result, Some(json!({ "transport": "test" })));
        assert_eq!(core.health(true, json!({})).messages_received, 1);
    }

    #[test]
    fn test_health_false_when_stopped() {
        let core = TransportCore::new("test");
        let health = core.health(true, json!({}));
        assert!(!health.healthy);
        assert_eq!(health.state, TransportState::Stopped);
    }
}
