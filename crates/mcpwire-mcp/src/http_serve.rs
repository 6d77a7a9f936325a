//! Streamable HTTP server for MCP.
//!
//! One endpoint serves every session:
//!
//! ```text
//! Client                                   Server
//!   │── POST initialize ────────────────────►│ (new session)
//!   │◄── 200 JSON + Mcp-Session-Id ──────────│
//!   │── POST notifications/initialized ─────►│
//!   │◄── 202 ────────────────────────────────│
//!   │── GET (standalone stream) ────────────►│
//!   │◄── SSE: server-initiated messages ─────│
//!   │── POST request ───────────────────────►│
//!   │◄── 200 JSON, or SSE ending in reply ───│
//!   │── GET Last-Event-ID: n ───────────────►│ (resume a dropped stream)
//!   │── DELETE ─────────────────────────────►│ (end session)
//!   │◄── 204 ────────────────────────────────│
//! ```
//!
//! A request is answered with plain JSON when its handler finishes without
//! emitting anything else. As soon as the handler sends a notification or
//! closes its stream, the reply switches to SSE.

use crate::config::ServerOptions;
use crate::handler::MethodRegistry;
use crate::jsonrpc::{
    codes, JsonRpcError, Message, Notification, Request as RpcRequest, Response as RpcResponse,
};
use crate::protocol::{
    methods, negotiate_version, progress_token, CancelledParams, EmptyResult, Implementation,
    InitializeParams, InitializeResult, SetLevelParams, LAST_EVENT_ID_HEADER,
    PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER,
};
use crate::server_session::{
    FirstReply, Frame, RequestContext, ServerSession, SessionRegistry, StreamError,
};
use crate::session::{SessionStatus, VersionCheck};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use mcpwire_util::id::{new_session_id, session_created_at};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

/// Path the router serves by default.
pub const DEFAULT_MCP_PATH: &str = "/mcp";

/// Decides whether a bearer token may use the endpoint.
#[async_trait]
pub trait BearerVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> bool;
}

/// Accepts exactly one token.
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl BearerVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> bool {
        constant_time_eq(token.as_bytes(), self.token.as_bytes())
    }
}

/// State for the MCP HTTP server.
#[derive(Clone)]
pub struct McpHttpState {
    /// Reported in `initialize`.
    pub server_info: Implementation,
    options: Arc<ServerOptions>,
    sessions: SessionRegistry,
    methods: Arc<MethodRegistry<RequestContext>>,
    verifier: Option<Arc<dyn BearerVerifier>>,
}

impl McpHttpState {
    /// Create server state. `ping` and `logging/setLevel` are answered
    /// unless `registry` already handles them.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        options: ServerOptions,
        mut registry: MethodRegistry<RequestContext>,
    ) -> Self {
        if !registry.contains(methods::PING) {
            registry.register(methods::PING, |_ctx: RequestContext, _: Value| async move {
                Ok::<_, JsonRpcError>(EmptyResult {})
            });
        }
        if !registry.contains(methods::SET_LOGGING_LEVEL) {
            registry.register(
                methods::SET_LOGGING_LEVEL,
                |ctx: RequestContext, params: SetLevelParams| async move {
                    ctx.session().set_log_level(params.level).await;
                    Ok::<_, JsonRpcError>(EmptyResult {})
                },
            );
        }

        Self {
            server_info: Implementation::new(name, version),
            options: Arc::new(options),
            sessions: SessionRegistry::new(),
            methods: Arc::new(registry),
            verifier: None,
        }
    }

    /// Require `Authorization: Bearer <key>` (or `X-API-Key: <key>`).
    pub fn with_api_key(self, key: impl Into<String>) -> Self {
        self.with_verifier(Arc::new(StaticTokenVerifier::new(key)))
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn BearerVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Check if authentication is enabled.
    pub fn has_auth(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Close every session, ending their streams.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
    }

    async fn create_session(&self, request: RpcRequest) -> Response {
        let params: InitializeParams =
            match serde_json::from_value(request.params.unwrap_or(Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    let error = JsonRpcError::invalid_params(format!("invalid initialize params: {e}"));
                    return json_reply(RpcResponse::error(request.id, error), None);
                }
            };

        let version = negotiate_version(&params.protocol_version);
        if version != params.protocol_version {
            debug!(
                requested = %params.protocol_version,
                offered = version,
                "Client asked for an unsupported protocol version"
            );
        }

        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: self.options.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.options.instructions.clone(),
        };
        let result = match serde_json::to_value(result) {
            Ok(result) => result,
            Err(e) => {
                let error = JsonRpcError::internal(format!("failed to encode result: {e}"));
                return json_reply(RpcResponse::error(request.id, error), None);
            }
        };

        let session_id = new_session_id();
        info!(
            session_id = %session_id,
            protocol_version = version,
            client = %params.client_info.name,
            "MCP session created"
        );
        let session = Arc::new(ServerSession::new(
            session_id.clone(),
            version,
            params,
            self.options.clone(),
        ));
        self.sessions.insert(session).await;

        json_reply(RpcResponse::success(request.id, result), Some(&session_id))
    }

    async fn on_notification(&self, session: &ServerSession, notification: Notification) {
        match notification.method.as_str() {
            methods::INITIALIZED => session.mark_active().await,
            methods::CANCELLED => {
                let params = notification
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
                match params {
                    Some(params) => {
                        if !session.cancel_request(&params.request_id).await {
                            debug!(id = %params.request_id, "Cancellation for a request that already finished");
                        }
                    }
                    None => warn!(session_id = %session.id(), "Malformed cancellation notice"),
                }
            }
            other => debug!(session_id = %session.id(), method = other, "Client notification"),
        }
    }

    async fn on_request(&self, session: Arc<ServerSession>, request: RpcRequest) -> Response {
        let RpcRequest { id, method, params } = request;

        if method == methods::INITIALIZE {
            let error = JsonRpcError::invalid_request("session already initialized");
            return json_reply(RpcResponse::error(id, error), None);
        }
        if session.status().await == SessionStatus::Initializing && method != methods::PING {
            let error = JsonRpcError::invalid_request(format!(
                "{method} received before notifications/initialized"
            ));
            return json_reply(RpcResponse::error(id, error), None);
        }

        debug!(session_id = %session.id(), method = %method, id = %id, "Handling request");
        let stream = session.open_request_stream().await;
        let cancel = session.track_request(id.clone()).await;
        let (first_tx, first_rx) = oneshot::channel();
        let ctx = RequestContext::new(
            session.clone(),
            id.clone(),
            stream,
            first_tx,
            cancel,
            progress_token(params.as_ref()),
        );
        tokio::spawn(run_handler(self.methods.clone(), ctx, method, params));

        match first_rx.await {
            Ok(FirstReply::Immediate(response)) => json_reply(response, None),
            Ok(FirstReply::Streaming) => {
                let frames = session.attach_request_stream(stream).await;
                sse_response(frames, self.options.keep_alive())
            }
            Err(_) => {
                let error = JsonRpcError::internal("handler stopped without replying");
                json_reply(RpcResponse::error(id, error), None)
            }
        }
    }

    /// Look up the session named by the request headers and check the
    /// protocol version header against it.
    async fn session_for(&self, headers: &HeaderMap) -> Result<Arc<ServerSession>, Response> {
        let Some(session_id) = header_str(headers, SESSION_ID_HEADER) else {
            return Err(rpc_error(
                StatusCode::BAD_REQUEST,
                JsonRpcError::invalid_request("missing Mcp-Session-Id header"),
            ));
        };
        let Some(session) = self.sessions.get(session_id).await else {
            debug!(session_id, "Unknown session");
            return Err(rpc_error(
                StatusCode::NOT_FOUND,
                JsonRpcError::invalid_request("session not found"),
            ));
        };

        let header = header_str(headers, PROTOCOL_VERSION_HEADER);
        match self.options.version_policy.check(session.protocol_version(), header) {
            VersionCheck::Accepted => Ok(session),
            VersionCheck::Tolerated(problem) => {
                warn!(session_id, problem = %problem, "Tolerating protocol version header");
                Ok(session)
            }
            VersionCheck::Rejected(problem) => {
                debug!(session_id, problem = %problem, "Rejecting protocol version header");
                Err(rpc_error(
                    StatusCode::BAD_REQUEST,
                    JsonRpcError::invalid_request(problem),
                ))
            }
        }
    }
}

async fn run_handler(
    methods: Arc<MethodRegistry<RequestContext>>,
    ctx: RequestContext,
    method: String,
    params: Option<Value>,
) {
    let cancel = ctx.cancellation();
    let id = ctx.request_id().clone();
    let session = ctx.session().clone();

    let result = tokio::select! {
        result = methods.call(ctx.clone(), &method, params) => result,
        _ = cancel.cancelled() => {
            debug!(session_id = %session.id(), method = %method, id = %id, "Request cancelled");
            Err(JsonRpcError::new(codes::REQUEST_CANCELLED, "request cancelled"))
        }
    };
    session.untrack_request(&id).await;

    let response = RpcResponse { id, result };
    match ctx.take_first() {
        Some(first) => {
            if first.send(FirstReply::Immediate(response)).is_err() {
                debug!(session_id = %session.id(), method = %method, "Client left before the reply");
            }
        }
        None => {
            session.record(ctx.stream(), &Message::Response(response)).await;
            session.finish(ctx.stream()).await;
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn json_body(status: StatusCode, body: Vec<u8>, session_id: Option<&str>) -> Response {
    let mut response = (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response();
    if let Some(id) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), id);
    }
    response
}

fn json_reply(response: RpcResponse, session_id: Option<&str>) -> Response {
    json_body(
        StatusCode::OK,
        Message::Response(response).encode(),
        session_id,
    )
}

/// A JSON-RPC error with a null id, for failures outside any request.
fn rpc_error(status: StatusCode, error: JsonRpcError) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": error,
    });
    (status, Json(body)).into_response()
}

fn to_event(event: &crate::sse::SseEvent) -> Event {
    let mut out = Event::default();
    if let Some(id) = &event.id {
        out = out.id(id);
    }
    if let Some(name) = &event.event {
        out = out.event(name);
    }
    if event.has_data() {
        out = out.data(&event.data);
    }
    if let Some(retry) = event.retry_delay() {
        out = out.retry(retry);
    }
    out
}

fn sse_response(mut frames: mpsc::UnboundedReceiver<Frame>, keep_alive: Option<Duration>) -> Response {
    let stream = async_stream::stream! {
        while let Some(frame) = frames.recv().await {
            match frame {
                Frame::Event(event) => yield Ok::<_, Infallible>(to_event(&event)),
                Frame::Close { retry } => {
                    if let Some(retry) = retry {
                        yield Ok(Event::default().retry(retry));
                    }
                    break;
                }
            }
        }
    };

    let sse = Sse::new(stream);
    match keep_alive {
        Some(interval) => sse
            .keep_alive(KeepAlive::new().interval(interval))
            .into_response(),
        None => sse.into_response(),
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Extract API key from request headers.
///
/// Supports both `X-API-Key` header and `Authorization: Bearer <key>` format.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(key) = auth.strip_prefix("Bearer ") {
            return Some(key.trim());
        }
    }

    None
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Middleware to validate bearer tokens.
async fn bearer_auth(State(state): State<McpHttpState>, request: Request, next: Next) -> Response {
    let Some(verifier) = state.verifier.clone() else {
        return next.run(request).await;
    };

    let provided = extract_api_key(request.headers()).map(str::to_string);
    match provided {
        Some(key) if verifier.verify(&key).await => next.run(request).await,
        Some(_) => {
            warn!("Invalid API key provided for MCP endpoint");
            unauthorized("Invalid API key")
        }
        None => {
            warn!("Missing API key for MCP endpoint");
            unauthorized("Authentication required")
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the MCP HTTP router, serving [`DEFAULT_MCP_PATH`].
pub fn create_mcp_router(state: McpHttpState) -> Router {
    create_mcp_router_at(state, DEFAULT_MCP_PATH)
}

/// Create the MCP HTTP router at `path`.
///
/// If the state has a verifier, every request must carry a valid token.
pub fn create_mcp_router_at(state: McpHttpState, path: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_ID_HEADER)]);

    let router = Router::new().route(path, get(mcp_get).post(mcp_post).delete(mcp_delete));

    let router = if state.has_auth() {
        info!("MCP bearer authentication enabled");
        router.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            bearer_auth,
        ))
    } else {
        router
    };

    router.layer(cors).with_state(state)
}

async fn mcp_post(State(state): State<McpHttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let message = match Message::decode(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Rejecting undecodable message");
            return rpc_error(
                StatusCode::BAD_REQUEST,
                JsonRpcError::parse_error(e.to_string()),
            );
        }
    };

    if header_str(&headers, SESSION_ID_HEADER).is_none() {
        return match message {
            Message::Request(request) if request.method == methods::INITIALIZE => {
                state.create_session(request).await
            }
            _ => rpc_error(
                StatusCode::BAD_REQUEST,
                JsonRpcError::invalid_request("missing Mcp-Session-Id header"),
            ),
        };
    }

    let session = match state.session_for(&headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match message {
        Message::Notification(notification) => {
            state.on_notification(&session, notification).await;
            StatusCode::ACCEPTED.into_response()
        }
        Message::Response(response) => {
            session.resolve(response).await;
            StatusCode::ACCEPTED.into_response()
        }
        Message::Request(request) => state.on_request(session, request).await,
    }
}

async fn mcp_get(State(state): State<McpHttpState>, headers: HeaderMap) -> Response {
    let session = match state.session_for(&headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let frames = match header_str(&headers, LAST_EVENT_ID_HEADER) {
        Some(last_event_id) => session.resume(last_event_id).await,
        None if !state.options.standalone_stream => {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "POST, DELETE")],
            )
                .into_response();
        }
        None => session.attach_standalone().await,
    };

    match frames {
        Ok(frames) => sse_response(frames, state.options.keep_alive()),
        Err(e @ StreamError::Conflict) => {
            rpc_error(StatusCode::CONFLICT, JsonRpcError::invalid_request(e.to_string()))
        }
        Err(e @ StreamError::UnknownEvent(_)) => {
            rpc_error(StatusCode::BAD_REQUEST, JsonRpcError::invalid_request(e.to_string()))
        }
        Err(StreamError::Closed) => rpc_error(
            StatusCode::NOT_FOUND,
            JsonRpcError::invalid_request("session not found"),
        ),
    }
}

async fn mcp_delete(State(state): State<McpHttpState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            JsonRpcError::invalid_request("missing Mcp-Session-Id header"),
        );
    };
    match state.sessions.remove(session_id).await {
        Some(session) => {
            let age_ms = session_created_at(session_id)
                .and_then(|created| created.elapsed().ok())
                .map(|age| age.as_millis() as u64);
            session.close().await;
            info!(session_id, age_ms = ?age_ms, "Session deleted by client");
            StatusCode::NO_CONTENT.into_response()
        }
        None => rpc_error(
            StatusCode::NOT_FOUND,
            JsonRpcError::invalid_request("session not found"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LATEST_PROTOCOL_VERSION;
    use crate::session::VersionPolicy;
    use axum::body::Body;
    use axum::http::Method;
    use serde_json::json;
    use tower::ServiceExt;

    fn create_test_state(options: ServerOptions) -> McpHttpState {
        let methods = MethodRegistry::new().with("echo", |_ctx: RequestContext, params: Value| async move {
            Ok::<_, JsonRpcError>(params)
        });
        McpHttpState::new("test-server", "1.0.0", options, methods)
    }

    fn post(session_id: Option<&str>, body: Value) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method(Method::POST)
            .uri(DEFAULT_MCP_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream");
        if let Some(id) = session_id {
            builder = builder
                .header(SESSION_ID_HEADER, id)
                .header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn initialize_body() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "1"}
            }
        })
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn initialize(app: &Router) -> String {
        let response = app.clone().oneshot(post(None, initialize_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["result"]["protocolVersion"], json!(LATEST_PROTOCOL_VERSION));
        assert_eq!(body["result"]["serverInfo"]["name"], json!("test-server"));
        session_id
    }

    async fn activate(app: &Router, session_id: &str) {
        let response = app
            .clone()
            .oneshot(post(
                Some(session_id),
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_initialize_creates_session() {
        let state = create_test_state(ServerOptions::default());
        let app = create_mcp_router(state.clone());
        let session_id = initialize(&app).await;
        assert!(mcpwire_util::id::is_session_id(&session_id));
        assert!(state.sessions().get(&session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_initialize_negotiates_older_version() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let mut body = initialize_body();
        body["params"]["protocolVersion"] = json!("2099-01-01");
        let response = app.oneshot(post(None, body)).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["result"]["protocolVersion"], json!(LATEST_PROTOCOL_VERSION));
    }

    #[tokio::test]
    async fn test_post_without_session() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let response = app
            .oneshot(post(None, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let response = app
            .oneshot(post(
                Some("ses_missing"),
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri(DEFAULT_MCP_PATH)
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], json!(codes::PARSE_ERROR));
    }

    #[tokio::test]
    async fn test_requests_wait_for_initialized() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let session_id = initialize(&app).await;

        let response = app
            .clone()
            .oneshot(post(
                Some(&session_id),
                json!({"jsonrpc": "2.0", "id": 2, "method": "echo", "params": {"a": 1}}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], json!(codes::INVALID_REQUEST));

        // ping is allowed early.
        let response = app
            .clone()
            .oneshot(post(
                Some(&session_id),
                json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["result"], json!({}));

        activate(&app, &session_id).await;
        let response = app
            .oneshot(post(
                Some(&session_id),
                json!({"jsonrpc": "2.0", "id": 4, "method": "echo", "params": {"a": 1}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = body_json(response).await;
        assert_eq!(body["id"], json!(4));
        assert_eq!(body["result"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let session_id = initialize(&app).await;
        activate(&app, &session_id).await;
        let response = app
            .oneshot(post(
                Some(&session_id),
                json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], json!(codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_set_logging_level_builtin() {
        let state = create_test_state(ServerOptions::default());
        let app = create_mcp_router(state.clone());
        let session_id = initialize(&app).await;
        activate(&app, &session_id).await;
        let response = app
            .oneshot(post(
                Some(&session_id),
                json!({"jsonrpc": "2.0", "id": 6, "method": "logging/setLevel", "params": {"level": "warning"}}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["result"], json!({}));
        let session = state.sessions().get(&session_id).await.unwrap();
        assert_eq!(
            session.log_level().await,
            Some(crate::protocol::LoggingLevel::Warning)
        );
    }

    #[tokio::test]
    async fn test_strict_version_policy() {
        let app = create_mcp_router(create_test_state(ServerOptions {
            version_policy: VersionPolicy::Strict,
            ..Default::default()
        }));
        let session_id = initialize(&app).await;

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri(DEFAULT_MCP_PATH)
            .header(SESSION_ID_HEADER, session_id.as_str())
            .body(Body::from(
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        activate(&app, &session_id).await;
    }

    #[tokio::test]
    async fn test_lenient_version_policy() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let session_id = initialize(&app).await;
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri(DEFAULT_MCP_PATH)
            .header(SESSION_ID_HEADER, session_id.as_str())
            .header(PROTOCOL_VERSION_HEADER, "2024-01-01")
            .body(Body::from(
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    fn get_request(session_id: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(Method::GET)
            .uri(DEFAULT_MCP_PATH)
            .header(header::ACCEPT, "text/event-stream")
            .header(SESSION_ID_HEADER, session_id)
            .header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_standalone_stream_and_conflict() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let session_id = initialize(&app).await;
        activate(&app, &session_id).await;

        let first = app.clone().oneshot(get_request(&session_id)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(first
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let second = app.clone().oneshot(get_request(&session_id)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        drop(first);
    }

    #[tokio::test]
    async fn test_standalone_disabled() {
        let app = create_mcp_router(create_test_state(ServerOptions {
            standalone_stream: false,
            ..Default::default()
        }));
        let session_id = initialize(&app).await;
        let response = app.oneshot(get_request(&session_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_resume_unknown_event_id() {
        let app = create_mcp_router(create_test_state(ServerOptions::default()));
        let session_id = initialize(&app).await;
        let mut request = get_request(&session_id);
        request
            .headers_mut()
            .insert(LAST_EVENT_ID_HEADER, HeaderValue::from_static("999"));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let state = create_test_state(ServerOptions::default());
        let app = create_mcp_router(state.clone());
        let session_id = initialize(&app).await;

        let delete = |id: &str| {
            axum::http::Request::builder()
                .method(Method::DELETE)
                .uri(DEFAULT_MCP_PATH)
                .header(SESSION_ID_HEADER, id)
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete(&session_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.sessions().is_empty().await);

        let response = app.oneshot(delete(&session_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_auth_required() {
        let state = create_test_state(ServerOptions::default()).with_api_key("secret");
        assert!(state.has_auth());
        let app = create_mcp_router(state);

        let response = app.clone().oneshot(post(None, initialize_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let mut request = post(None, initialize_body());
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = post(None, initialize_body());
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_extract_api_key() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);

        headers.insert("authorization", "Bearer  tok-1 ".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("tok-1"));

        headers.insert("x-api-key", "tok-2".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("tok-2"));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_api_key(&basic), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
    }
}
