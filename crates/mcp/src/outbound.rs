//! Pooled client for calls from the server (or its tools) to an upstream peer.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{HttpTransport, Transport, WebSocketTransport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use switchboard_core::config::{
    HttpSettings, OutboundKind, OutboundSettings, PoolConfig, RetryConfig, WebSocketSettings,
};
use switchboard_core::pool::{ConnectionPool, Connector, PoolStats, PooledConnection};
use switchboard_core::{CoreError, CoreResult};

/// Opens client transports to one configured peer
pub struct TransportConnector {
    settings: OutboundSettings,
}

impl TransportConnector {
    pub fn new(settings: OutboundSettings) -> McpResult<Self> {
        let url = url::Url::parse(&settings.url)
            .map_err(|e| McpError::Config(format!("invalid outbound url {}: {}", settings.url, e)))?;
        let scheme_ok = match settings.kind {
            OutboundKind::Http => matches!(url.scheme(), "http" | "https"),
            OutboundKind::Websocket => matches!(url.scheme(), "ws" | "wss"),
        };
        if !scheme_ok {
            return Err(McpError::Config(format!(
                "outbound url {} does not match transport type {:?}",
                settings.url, settings.kind
            )));
        }
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &OutboundSettings {
        &self.settings
    }

    fn build(&self) -> CoreResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match self.settings.kind {
            OutboundKind::Http => Arc::new(
                HttpTransport::new(HttpSettings {
                    remote_url: Some(self.settings.url.clone()),
                    request_timeout_ms: self.settings.request_timeout_ms,
                    ..Default::default()
                })
                .map_err(|e| CoreError::Connect(e.to_string()))?,
            ),
            // Reconnects are the pool's job: a dropped connection fails its
            // health probe and is replaced.
            OutboundKind::Websocket => Arc::new(
                WebSocketTransport::new(
                    WebSocketSettings {
                        remote_url: Some(self.settings.url.clone()),
                        request_timeout_ms: self.settings.request_timeout_ms,
                        ..Default::default()
                    },
                    RetryConfig::no_retry(),
                )
                .map_err(|e| CoreError::Connect(e.to_string()))?,
            ),
        };
        Ok(transport)
    }
}

#[async_trait]
impl Connector for TransportConnector {
    type Connection = Arc<dyn Transport>;

    async fn connect(&self) -> CoreResult<Self::Connection> {
        let transport = self.build()?;
        transport
            .start()
            .await
            .map_err(|e| CoreError::Connect(format!("{}: {}", self.settings.url, e)))?;
        tracing::debug!(url = %self.settings.url, transport = %transport.name(), "Opened outbound connection");
        Ok(transport)
    }

    async fn is_healthy(&self, connection: &Self::Connection) -> bool {
        connection.health_status().healthy
    }

    async fn close(&self, connection: Self::Connection) {
        if let Err(e) = connection.stop().await {
            tracing::warn!(url = %self.settings.url, error = %e, "Failed to close outbound connection");
        }
    }
}

/// Request/notify API over a [`ConnectionPool`] of client transports.
/// Cloning shares the pool.
#[derive(Clone)]
pub struct OutboundClient {
    pool: Arc<ConnectionPool<TransportConnector>>,
    next_id: Arc<AtomicI64>,
}

impl OutboundClient {
    pub fn new(settings: &OutboundSettings, pool: PoolConfig) -> McpResult<Self> {
        let connector = TransportConnector::new(settings.clone())?;
        Ok(Self {
            pool: Arc::new(ConnectionPool::new(connector, pool)),
            next_id: Arc::new(AtomicI64::new(1)),
        })
    }

    /// Send a request on a pooled connection and return the peer's response
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse> {
        let connection = self.pool.acquire().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = connection
            .send_request(JsonRpcRequest::new(id, method, params))
            .await;
        self.settle(connection, result).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let connection = self.pool.acquire().await?;
        let result = connection
            .send_notification(JsonRpcNotification::new(method, params))
            .await;
        self.settle(connection, result).await
    }

    /// Return the connection to the pool, or drop it if the send showed it
    /// to be broken
    async fn settle<T>(
        &self,
        connection: PooledConnection<Arc<dyn Transport>>,
        result: Result<T, crate::error::TransportError>,
    ) -> McpResult<T> {
        match result {
            Err(e) if e.is_connection_failure() => {
                tracing::warn!(
                    connection_id = %connection.id(),
                    error = %e,
                    "Discarding failed outbound connection"
                );
                self.pool.discard(connection).await;
                Err(e.into())
            }
            result => {
                self.pool.release(connection).await;
                Ok(result?)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
