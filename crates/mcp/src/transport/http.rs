//! HTTP transport: an axum listener for inbound JSON-RPC posts and a reqwest
//! client for outbound calls.

use super::{
    ErrorHandler, HealthStatus, NotificationHandler, RequestContext, RequestHandler, Transport,
    TransportCore,
};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{
    error_codes, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, MessageError,
};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use switchboard_core::config::HttpSettings;
use switchboard_core::SessionId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Header carrying the session id in both directions
pub const SESSION_HEADER: &str = "mcp-session-id";

struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct ListenerState {
    core: Arc<TransportCore>,
    auth_token: Option<String>,
}

/// HTTP transport. Each POST is an independent exchange; sessions ride on
/// the `Mcp-Session-Id` header.
pub struct HttpTransport {
    core: Arc<TransportCore>,
    settings: HttpSettings,
    auth_token: Option<String>,
    client: reqwest::Client,
    remote_session: RwLock<Option<String>>,
    listener: Mutex<Option<Listener>>,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings) -> TransportResult<Self> {
        if let Some(remote) = &settings.remote_url {
            url::Url::parse(remote)
                .map_err(|e| TransportError::Config(format!("invalid remote_url {}: {}", remote, e)))?;
        }

        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            core: Arc::new(TransportCore::new("http")),
            settings,
            auth_token: None,
            client,
            remote_session: RwLock::new(None),
            listener: Mutex::new(None),
        })
    }

    /// Require `Authorization: Bearer <token>` on inbound requests
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.local_addr)
    }

    /// Session id the remote assigned on `initialize`, if any
    pub fn remote_session(&self) -> Option<String> {
        self.remote_session.read().clone()
    }

    fn remote_url(&self) -> TransportResult<&str> {
        self.settings.remote_url.as_deref().ok_or_else(|| {
            TransportError::Config("http transport has no remote_url configured".to_string())
        })
    }

    fn router(&self) -> Router {
        let path = if self.settings.path.starts_with('/') {
            self.settings.path.clone()
        } else {
            format!("/{}", self.settings.path)
        };
        let health_path = format!("{}/health", path.trim_end_matches('/'));

        let state = Arc::new(ListenerState {
            core: self.core.clone(),
            auth_token: self.auth_token.clone(),
        });

        Router::new()
            .route(&path, post(handle_post))
            .route(&health_path, get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    async fn post(&self, body: String) -> TransportResult<(StatusCode, Option<String>, String)> {
        let url = self.remote_url()?;
        let mut builder = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(session) = self.remote_session() {
            builder = builder.header(SESSION_HEADER, session);
        }

        let timeout = self.settings.request_timeout();
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let session = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await?;
            Ok::<_, TransportError>((status, session, body))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&self) -> TransportResult<()> {
        self.core.begin_start()?;

        if let Some(bind) = &self.settings.bind {
            let listener = match tokio::net::TcpListener::bind(bind).await {
                Ok(listener) => listener,
                Err(source) => {
                    self.core.mark_stopped();
                    return Err(TransportError::Bind {
                        addr: bind.clone(),
                        source,
                    });
                }
            };
            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    self.core.mark_stopped();
                    return Err(e.into());
                }
            };

            let shutdown = CancellationToken::new();
            let router = self.router();
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

            tracing::info!(addr = %local_addr, path = %self.settings.path, "HTTP transport listening");
            *self.listener.lock() = Some(Listener {
                local_addr,
                shutdown,
                task,
            });
        }

        self.core.mark_running();
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        if !self.core.begin_stop() {
            return Ok(());
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.shutdown.cancel();
            if let Err(e) = listener.task.await {
                tracing::warn!(error = %e, "HTTP listener task ended abnormally");
            }
        }

        self.core.mark_stopped();
        tracing::info!("HTTP transport stopped");
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
        let is_initialize = request.method == "initialize";
        let id = request.id.clone();

        tracing::debug!(method = %request.method, id = %id, "Sending HTTP request");
        let (status, session, body) = self.post(serde_json::to_string(&request)?).await?;
        self.core.record_sent();
        self.core.record_received();

        let response = match serde_json::from_str::<JsonRpcResponse>(&body) {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(status = status.as_u16(), "Remote returned a non JSON-RPC body");
                return Ok(JsonRpcResponse::error(
                    Some(id),
                    JsonRpcError::internal_error(format!("HTTP {}", status))
                        .with_data(json!({ "status": status.as_u16(), "body": body })),
                ));
            }
        };

        if is_initialize {
            let session = session.or_else(|| {
                response
                    .result
                    .as_ref()
                    .and_then(|r| r.get("sessionId"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });
            if let Some(session) = session {
                tracing::debug!(session_id = %session, "Remote assigned session");
                *self.remote_session.write() = Some(session);
            }
        }

        Ok(response)
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> TransportResult<()> {
        self.core.ensure_running()?;
        let (status, _, _) = self.post(serde_json::to_string(&notification)?).await?;
        if !status.is_success() {
            return Err(TransportError::Send(format!(
                "remote rejected notification with HTTP {}",
                status
            )));
        }
        self.core.record_sent();
        Ok(())
    }

    fn health_status(&self) -> HealthStatus {
        self.core.health(
            true,
            json!({
                "listening": self.local_addr().map(|a| a.to_string()),
                "path": self.settings.path,
                "remoteUrl": self.settings.remote_url,
                "remoteSession": self.remote_session(),
            }),
        )
    }
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map_or(false, |presented| presented == token)
}

async fn handle_post(
    State(state): State<Arc<ListenerState>>,
    headers: HeaderMap,
    body: Bytes,
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

    let parsed = match std::str::from_utf8(&body) {
        Ok(text) => JsonRpcMessage::parse(text),
        Err(e) => Err(MessageError {
            id: None,
            error: JsonRpcError::parse_error(e.to_string()),
        }),
    };
    let message = match parsed {
        Ok(message) => message,
        Err(err) => {
            state.core.record_received();
            state.core.record_error();
            tracing::warn!(error = %err.error, "Malformed HTTP message");
            return Json(err.into_response()).into_response();
        }
    };

    let raw_session = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let session_id = raw_session.and_then(SessionId::parse);
    let context = RequestContext::new(state.core.name()).with_session(session_id);

    match message {
        JsonRpcMessage::Request(request) => {
            if let (Some(raw), None) = (raw_session, session_id) {
                state.core.record_received();
                return Json(JsonRpcResponse::error(
                    Some(request.id),
                    JsonRpcError::new(
                        error_codes::SESSION_NOT_FOUND,
                        format!("Session not found: {}", raw),
                    ),
                ))
                .into_response();
            }

            let is_initialize = request.method == "initialize";
            let response = state.core.dispatch_request(request, context).await;
            state.core.record_sent();

            let assigned_session = if is_initialize {
                response
                    .result
                    .as_ref()
                    .and_then(|r| r.get("sessionId"))
                    .and_then(|v| v.as_str())
                    .and_then(|v| HeaderValue::from_str(v).ok())
            } else {
                None
            };

            let mut http_response = Json(response).into_response();
            if let Some(value) = assigned_session {
                http_response
                    .headers_mut()
                    .insert(HeaderName::from_static(SESSION_HEADER), value);
            }
            http_response
        }
        JsonRpcMessage::Notification(notification) => {
            state.core.dispatch_notification(notification, context).await;
            StatusCode::NO_CONTENT.into_response()
        }
        JsonRpcMessage::Response(response) => {
            state.core.record_received();
            tracing::debug!(id = ?response.id, "Ignoring JSON-RPC response posted to listener");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn handle_health(State(state): State<Arc<ListenerState>>) -> Response {
    let health = state.core.health(true, json!({ "listening": true }));
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::request_handler;
    use serde_json::Value;
    use std::time::Duration;
    use wiremock::matchers::{header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listener_settings() -> HttpSettings {
        HttpSettings {
            bind: Some("127.0.0.1:0".to_string()),
            ..Default::default()
        }
    }

    fn client_settings(url: String, timeout_ms: u64) -> HttpSettings {
        HttpSettings {
            remote_url: Some(url),
            request_timeout_ms: timeout_ms,
            ..Default::default()
        }
    }

    async fn echo_listener(auth: Option<&str>) -> (HttpTransport, String) {
        let transport = HttpTransport::new(listener_settings())
            .unwrap()
            .with_auth_token(auth.map(str::to_string));
        transport.on_request(request_handler(|req, ctx| async move {
            if req.method == "initialize" {
                return JsonRpcResponse::success(
                    req.id,
                    json!({ "sessionId": "7f1d2a4e-1111-4c3b-9d2e-0123456789ab" }),
                );
            }
            JsonRpcResponse::success(
                req.id,
                json!({
                    "method": req.method,
                    "session": ctx.session_id.map(|s| s.to_string()),
                }),
            )
        }));
        transport.start().await.unwrap();
        let url = format!("http://{}/mcp", transport.local_addr().unwrap());
        (transport, url)
    }

    #[tokio::test]
    async fn test_listener_request_and_notification() {
        let (transport, url) = echo_listener(None).await;
        let client = reqwest::Client::new();

        let response = client
            .post(&url)
            .body(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["method"], "ping");

        let response = client
            .post(&url)
            .body(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_protocol_error_is_200_with_error_body() {
        let (transport, url) = echo_listener(None).await;

        let response = reqwest::Client::new()
            .post(&url)
            .body("{ invalid json }")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32700);
        assert_eq!(body["id"], Value::Null);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_session_header_round_trip() {
        let (transport, url) = echo_listener(None).await;
        let client = reqwest::Client::new();

        let response = client
            .post(&url)
            .body(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .send()
            .await
            .unwrap();
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(session, "7f1d2a4e-1111-4c3b-9d2e-0123456789ab");

        let body: Value = client
            .post(&url)
            .header(SESSION_HEADER, &session)
            .body(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["result"]["session"], session);

        let body: Value = client
            .post(&url)
            .header(SESSION_HEADER, "not-a-session")
            .body(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["error"]["code"], -32001);
        assert_eq!(body["id"], 3);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_bearer_auth() {
        let (transport, url) = echo_listener(Some("s3cret")).await;
        let client = reqwest::Client::new();
        let request = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;

        let response = client.post(&url).body(request).send().await.unwrap();
        assert_eq!(response.status(), 401);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32002);

        let response = client
            .post(&url)
            .bearer_auth("s3cret")
            .body(request)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (transport, url) = echo_listener(None).await;

        let health: Value = reqwest::get(format!("{}/health", url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["healthy"], true);
        assert_eq!(health["transport"], "http");

        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        assert!(!transport.health_status().healthy);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_transport_stopped() {
        let (first, _) = echo_listener(None).await;
        let taken = first.local_addr().unwrap().to_string();

        let second = HttpTransport::new(HttpSettings {
            bind: Some(taken),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            second.start().await,
            Err(TransportError::Bind { .. })
        ));
        assert_eq!(second.health_status().state, crate::transport::TransportState::Stopped);

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_outbound_request_remembers_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header_matcher(SESSION_HEADER, "abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 2, "result": {"ok": true}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "abc")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new(client_settings(format!("{}/mcp", server.uri()), 1000)).unwrap();
        transport.start().await.unwrap();

        transport
            .send_request(JsonRpcRequest::new(1, "initialize", Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(transport.remote_session().as_deref(), Some("abc"));

        let response = transport
            .send_request(JsonRpcRequest::new(2, "ping", None))
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_outbound_non_jsonrpc_error_is_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(client_settings(server.uri(), 1000)).unwrap();
        transport.start().await.unwrap();

        let response = transport
            .send_request(JsonRpcRequest::new("r1", "ping", None))
            .await
            .unwrap();
        assert_eq!(response.id, Some("r1".into()));
        let error = response.error.unwrap();
        assert_eq!(error.code, -32603);
        assert_eq!(error.data.unwrap(), json!({"status": 502, "body": "bad gateway"}));
    }

    #[tokio::test]
    async fn test_outbound_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(client_settings(server.uri(), 50)).unwrap();
        transport.start().await.unwrap();

        let err = transport
            .send_request(JsonRpcRequest::new(1, "ping", None))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_outbound_requires_running_transport() {
        let transport =
            HttpTransport::new(client_settings("http://127.0.0.1:9/mcp".to_string(), 50)).unwrap();
        let err = transport
            .send_request(JsonRpcRequest::new(1, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotRunning { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_outbound_calls_are_correlated() {
        let server = HttpTransport::new(listener_settings()).unwrap();
        server.on_request(request_handler(|req, _ctx| async move {
            let delay = match &req.id {
                crate::protocol::RequestId::Number(n) => (20 - n) as u64,
                _ => 0,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            JsonRpcResponse::success(req.id.clone(), json!({ "echo": req.id }))
        }));
        server.start().await.unwrap();
        let url = format!("http://{}/mcp", server.local_addr().unwrap());

        let client = Arc::new(HttpTransport::new(client_settings(url, 5000)).unwrap());
        client.start().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20i64 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let response = client
                    .send_request(JsonRpcRequest::new(i, "echo", None))
                    .await
                    .unwrap();
                (i, response)
            }));
        }
        for handle in handles {
            let (i, response) = handle.await.unwrap();
            assert_eq!(response.id, Some(i.into()));
            assert_eq!(response.result.unwrap()["echo"], i);
        }

        server.stop().await.unwrap();
    }
}
