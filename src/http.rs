/// HTTP and websocket API for a sync server.
///
/// # Example
///
/// ```ignore
/// use koru_sync::http::HttpServer;
///
/// let server = Server::start().await?;
/// HttpServer::new(server).bind("0.0.0.0:8800").await?;
/// ```
///
/// # API Endpoints
///
/// - `GET /` - List stored keys; with a websocket upgrade, join the clock
/// - `GET /*key` - Read a key or glob; with a websocket upgrade, subscribe
///   (`?v=<hex version>` skips the initial snapshot when current)
/// - `POST /*key` - Publish `{"data": ...}`, answers `{"index": ...}`
/// - `DELETE /*key` - Delete a key or glob, answers 204 or 404
///
/// Websocket clients may offer the `bearer` subprotocol.
use crate::error::{SyncError, SyncResult};
use crate::key::KeyMatcher;
use crate::server::Server;
use crate::storage::Stats;
use crate::stream::Transport;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Request audit run on every HTTP request; false answers 401.
pub type AuditFn = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Websocket subprotocols accepted on upgrade.
const PROTOCOLS: [&str; 1] = ["bearer"];

/// HTTP server wrapping a sync server.
pub struct HttpServer {
    server: Server,
    audit: AuditFn,
}

#[derive(Clone)]
struct AppState {
    server: Server,
    audit: AuditFn,
}

impl HttpServer {
    /// Create an HTTP server that lets every request through.
    pub fn new(server: Server) -> Self {
        Self {
            server,
            audit: Arc::new(|_| true),
        }
    }

    /// Audit requests by their headers.
    pub fn with_audit<F>(mut self, audit: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.audit = Arc::new(audit);
        self
    }

    /// The axum router serving the API.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(handle_root))
            .route(
                "/*key",
                get(handle_read).post(handle_publish).delete(handle_unpublish),
            )
            .with_state(AppState {
                server: self.server.clone(),
                audit: self.audit.clone(),
            })
    }

    /// Serve on an already bound listener until the sync server closes.
    pub async fn serve(self, listener: TcpListener) -> SyncResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "glad to serve");
        }
        let app = self.router();
        let server = self.server.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server.closed().await })
            .await
            .map_err(|e| SyncError::TransportError(format!("Server error: {}", e)))
    }

    /// Bind `addr` and serve until the sync server closes.
    ///
    /// # Example
    ///
    /// ```ignore
    /// server.bind("0.0.0.0:8800").await?;
    /// ```
    pub async fn bind(self, addr: &str) -> SyncResult<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| SyncError::TransportError(format!("Invalid address: {}", e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::TransportError(format!("Failed to bind: {}", e)))?;
        self.serve(listener).await
    }
}

/// Query string of a read or subscription.
#[derive(Debug, Default, Deserialize)]
struct ReadParams {
    /// Version the subscriber already holds, in hex.
    v: Option<String>,
}

/// Request body for POST /*key
#[derive(Debug, Deserialize)]
struct PublishRequest {
    data: JsonValue,
}

/// Response for POST /*key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub index: String,
}

/// Outbound half of a server-side websocket.
struct WsTransport {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> SyncResult<()> {
        self.sink
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| SyncError::TransportError(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "websocket close failed");
        }
    }
}

fn status_of(error: &SyncError) -> StatusCode {
    match error {
        SyncError::InvalidKey { .. }
        | SyncError::Filter { .. }
        | SyncError::SerializationError(_)
        | SyncError::InvalidData { .. } => StatusCode::BAD_REQUEST,
        SyncError::Denied { .. } => StatusCode::UNAUTHORIZED,
        SyncError::KeyNotFound { .. } => StatusCode::NOT_FOUND,
        SyncError::TransportError(_) | SyncError::StorageError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(error: SyncError) -> Response {
    (status_of(&error), error.to_string()).into_response()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "this request is not authorized").into_response()
}

fn invalid_key(key: &str) -> Response {
    error_response(SyncError::InvalidKey {
        key: key.to_string(),
    })
}

fn deadline_reached() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "deadline reached").into_response()
}

async fn handle_root(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !(state.audit)(&headers) {
        return unauthorized();
    }
    if let Some(ws) = ws {
        let server = state.server.clone();
        return ws
            .protocols(PROTOCOLS)
            .on_upgrade(move |socket| clock_session(server, socket));
    }
    match state.server.keys().await {
        Ok(keys) => Json(Stats { keys }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_read(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<ReadParams>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !KeyMatcher::is_valid(&key) {
        return invalid_key(&key);
    }
    if !(state.audit)(&headers) {
        return unauthorized();
    }

    if let Some(ws) = ws {
        if let Err(e) = state.server.authorize(&key) {
            warn!(key = %key, error = %e, "subscription rejected");
            return error_response(e);
        }
        let server = state.server.clone();
        return ws
            .protocols(PROTOCOLS)
            .on_upgrade(move |socket| subscribe_session(server, key, params.v, socket));
    }

    match state.server.read(&key).await {
        Ok(data) => ([(header::CONTENT_TYPE, "application/json")], data).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_publish(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !KeyMatcher::is_valid(&key) {
        return invalid_key(&key);
    }
    if !(state.audit)(&headers) {
        return unauthorized();
    }
    let request: PublishRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e.into()),
    };

    let deadline = state.server.config().deadline;
    match tokio::time::timeout(deadline, state.server.publish(&key, request.data)).await {
        Ok(Ok(index)) => Json(PublishResponse { index }).into_response(),
        Ok(Err(e)) => {
            warn!(key = %key, error = %e, "publish failed");
            error_response(e)
        }
        Err(_) => deadline_reached(),
    }
}

async fn handle_unpublish(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !KeyMatcher::is_valid(&key) {
        return invalid_key(&key);
    }
    if !(state.audit)(&headers) {
        return unauthorized();
    }

    let deadline = state.server.config().deadline;
    match tokio::time::timeout(deadline, state.server.unpublish(&key)).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => {
            warn!(key = %key, error = %e, "unpublish failed");
            error_response(e)
        }
        Err(_) => deadline_reached(),
    }
}

async fn subscribe_session(server: Server, key: String, version: Option<String>, socket: WebSocket) {
    let (sink, incoming) = socket.split();
    let conn = match server
        .open(&key, Box::new(WsTransport { sink }), version.as_deref())
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            warn!(key = %key, error = %e, "subscription failed");
            return;
        }
    };
    server.read_loop(conn, incoming).await;
}

async fn clock_session(server: Server, socket: WebSocket) {
    let (sink, incoming) = socket.split();
    let conn = server.subscribe_clock(Box::new(WsTransport { sink })).await;
    server.read_loop(conn, incoming).await;
}
