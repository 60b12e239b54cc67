//! Paired in-memory transports for embedding and tests.

use super::{
    ErrorHandler, HealthStatus, NotificationHandler, RequestContext, RequestHandler, Transport,
    TransportCore,
};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::ConnectionId;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One end of an in-process transport pair. Requests sent on one end are
/// handled by the handlers registered on the other.
pub struct InProcessTransport {
    core: Arc<TransportCore>,
    peer: Arc<TransportCore>,
    connection_id: ConnectionId,
    request_timeout: Duration,
}

impl InProcessTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let left = Arc::new(TransportCore::new("in_process"));
        let right = Arc::new(TransportCore::new("in_process"));
        (
            Self {
                core: left.clone(),
                peer: right.clone(),
                connection_id: ConnectionId::new(),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            },
            Self {
                core: right,
                peer: left,
                connection_id: ConnectionId::new(),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            },
        )
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Connection id the peer sees for messages from this end
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        self.core.ensure_running()?;
        self.peer.ensure_running()
    }

    fn context(&self) -> RequestContext {
        RequestContext::new(self.peer.name()).with_connection(self.connection_id)
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&self) -> TransportResult<()> {
        self.core.begin_start()?;
        self.core.mark_running();
        tracing::debug!(connection_id = %self.connection_id, "In-process transport started");
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        if self.core.begin_stop() {
            self.core.mark_stopped();
        }
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
        self.ensure_connected()?;
        self.core.record_sent();

        let response = tokio::time::timeout(
            self.request_timeout,
            self.peer.dispatch_request(request, self.context()),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_ms: self.request_timeout.as_millis() as u64,
        })?;

        self.core.record_received();
        Ok(response)
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> TransportResult<()> {
        self.ensure_connected()?;
        self.core.record_sent();
        self.peer
            .dispatch_notification(notification, self.context())
            .await;
        Ok(())
    }

    fn health_status(&self) -> HealthStatus {
        let peer_running = self.peer.is_running();
        self.core.health(
            peer_running,
            json!({
                "connectionId": self.connection_id.to_string(),
                "peerRunning": peer_running,
            }),
        )
    }
}
