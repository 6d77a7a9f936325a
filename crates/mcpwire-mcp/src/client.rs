//! MCP client session.
//!
//! A [`ClientSession`] owns one transport, runs the initialize handshake and
//! multiplexes concurrent calls over it. A dispatcher task drains the
//! transport's inbound channel: responses resolve pending calls by id,
//! notifications are broadcast to subscribers and server-initiated requests
//! are answered from a [`MethodRegistry`].

use crate::config::ClientConfig;
use crate::error::{McpError, McpResult};
use crate::handler::MethodRegistry;
use crate::jsonrpc::{JsonRpcError, Message, Notification, Request, RequestId, Response};
use crate::protocol::{
    is_supported_version, methods, CallToolParams, CallToolResult, CancelledParams,
    ClientCapabilities, EmptyResult, Implementation, InitializeParams, InitializeResult,
    ListKind, ListRootsResult, ListToolsResult, LoggingLevel, Root, SetLevelParams,
    LATEST_PROTOCOL_VERSION,
};
use crate::session::{PendingCalls, SessionStatus};
use crate::streamable::StreamableClientTransport;
use crate::transport::{Inbound, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const NOTIFICATION_BUFFER: usize = 256;

/// What the client tells the server about itself.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    /// Version requested in `initialize`.
    pub protocol_version: String,
    /// Answer to `roots/list`.
    pub roots: Vec<Root>,
    /// Extra handlers for server-initiated requests.
    pub methods: MethodRegistry<()>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("mcpwire", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            roots: Vec::new(),
            methods: MethodRegistry::new(),
        }
    }
}

impl ClientOptions {
    pub fn with_roots(mut self, roots: Vec<Root>) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A connected, initialized MCP client session. Cheap to clone.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession").finish_non_exhaustive()
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    pending: PendingCalls,
    next_id: AtomicI64,
    status: RwLock<SessionStatus>,
    server: OnceLock<InitializeResult>,
    capabilities: ClientCapabilities,
    methods: MethodRegistry<()>,
    notifications: broadcast::Sender<Notification>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ClientSession {
    /// Connect to a streamable HTTP endpoint and initialize.
    pub async fn connect(config: ClientConfig, options: ClientOptions) -> McpResult<Self> {
        info!(endpoint = %config.endpoint, "Connecting to MCP server");
        let (transport, inbound) = StreamableClientTransport::with_channel(config)?;
        Self::connect_with(Arc::new(transport), inbound, options).await
    }

    /// Initialize over an existing transport whose replies arrive on `inbound`.
    pub async fn connect_with(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
        options: ClientOptions,
    ) -> McpResult<Self> {
        let requested = options.protocol_version.clone();
        let client_info = options.client_info.clone();
        let session = Self::start(transport, inbound, options);

        if let Err(e) = session.initialize(requested, client_info).await {
            warn!(error = %e, "Initialization failed");
            if let Err(close_err) = session.close().await {
                debug!(error = %close_err, "Close after failed initialization also failed");
            }
            return Err(e);
        }
        Ok(session)
    }

    fn start(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
        options: ClientOptions,
    ) -> Self {
        let ClientOptions {
            capabilities,
            roots,
            methods: mut registry,
            ..
        } = options;

        registry.register(methods::PING, |_: (), _: Value| async move {
            Ok::<_, JsonRpcError>(EmptyResult {})
        });
        if !registry.contains(methods::ROOTS_LIST) {
            let roots = Arc::new(roots);
            registry.register(methods::ROOTS_LIST, move |_: (), _: Value| {
                let roots = roots.clone();
                async move {
                    Ok::<_, JsonRpcError>(ListRootsResult {
                        roots: roots.as_ref().clone(),
                    })
                }
            });
        }

        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let inner = Arc::new(Inner {
            transport,
            pending: PendingCalls::new(),
            next_id: AtomicI64::new(1),
            status: RwLock::new(SessionStatus::Initializing),
            server: OnceLock::new(),
            capabilities,
            methods: registry,
            notifications,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let weak = Arc::downgrade(&inner);
        let shutdown = inner.shutdown.clone();
        inner.tasks.spawn(dispatch(weak, inbound, shutdown));

        Self { inner }
    }

    async fn initialize(
        &self,
        requested: String,
        client_info: Implementation,
    ) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: requested,
            capabilities: self.inner.capabilities.clone(),
            client_info,
        };

        let value = self
            .call(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await
            .map_err(|e| match e {
                McpError::Rpc(error) => McpError::InitializationFailed(error.message),
                other => other,
            })?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("invalid initialize result: {e}")))?;

        if !is_supported_version(&result.protocol_version) {
            return Err(McpError::UnsupportedProtocolVersion(
                result.protocol_version,
            ));
        }

        let transport = &self.inner.transport;
        transport.set_protocol_version(&result.protocol_version).await;
        self.notify(methods::INITIALIZED, None).await?;
        *self.inner.status.write().await = SessionStatus::Active;

        info!(
            protocol_version = %result.protocol_version,
            server_name = %result.server_info.name,
            server_version = %result.server_info.version,
            "MCP session initialized"
        );
        let _ = self.inner.server.set(result.clone());

        transport.open_standalone().await?;
        Ok(result)
    }

    /// Send a request and wait for its response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.call_with_cancel(method, params, CancellationToken::new())
            .await
    }

    /// Send a request, giving up when `cancel` fires.
    ///
    /// Cancelling aborts this call's HTTP exchange and reply stream only; the
    /// server is told with a best-effort `notifications/cancelled`.
    pub async fn call_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> McpResult<Value> {
        let inner = &self.inner;
        if *inner.status.read().await == SessionStatus::Closed {
            return Err(McpError::Closed);
        }

        let id = RequestId::Number(inner.next_id.fetch_add(1, Ordering::SeqCst));
        let exchange = inner.shutdown.child_token();
        let reply = inner.pending.register(id.clone(), exchange.clone()).await?;
        let request = Request::new(id.clone(), method, params);
        debug!(method, id = %id, "Sending request");

        tokio::select! {
            result = async {
                inner.transport.send(Message::Request(request), exchange.clone()).await?;
                match reply.await {
                    Ok(result) => result,
                    Err(_) => Err(McpError::Closed),
                }
            } => {
                if result.is_err() {
                    inner.pending.remove(&id).await;
                }
                exchange.cancel();
                result
            }
            _ = cancel.cancelled() => {
                inner.pending.remove(&id).await;
                exchange.cancel();
                if method != methods::INITIALIZE {
                    self.spawn_cancel_notice(id);
                }
                Err(McpError::Cancelled)
            }
        }
    }

    fn spawn_cancel_notice(&self, id: RequestId) {
        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            debug!(id = %id, "Telling server the request was cancelled");
            let params = CancelledParams {
                request_id: id,
                reason: Some("cancelled by caller".to_string()),
            };
            let notification = Notification::new(methods::CANCELLED, serde_json::to_value(params).ok());
            if let Err(e) = inner
                .transport
                .send(notification.into(), inner.shutdown.child_token())
                .await
            {
                debug!(error = %e, "Cancellation notice not delivered");
            }
        });
    }

    /// Typed request.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> McpResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn ping(&self) -> McpResult<()> {
        self.call(methods::PING, None).await.map(|_| ())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> McpResult<ListToolsResult> {
        let params = cursor.map(|cursor| serde_json::json!({ "cursor": cursor }));
        let value = self.call(methods::TOOLS_LIST, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_tool(
        &self,
        name: impl Into<String>,
        arguments: Option<Value>,
    ) -> McpResult<CallToolResult> {
        let params = CallToolParams {
            name: name.into(),
            arguments,
        };
        self.request(methods::TOOLS_CALL, &params).await
    }

    /// Ask the server to send log messages at `level` and above.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> McpResult<()> {
        let _: Value = self
            .request(methods::SET_LOGGING_LEVEL, &SetLevelParams { level })
            .await?;
        Ok(())
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if *self.inner.status.read().await == SessionStatus::Closed {
            return Err(McpError::Closed);
        }
        let notification = Notification::new(method, params);
        self.inner
            .transport
            .send(notification.into(), self.inner.shutdown.child_token())
            .await
    }

    /// Send `notifications/roots/list_changed` if the client advertised it.
    ///
    /// Returns whether anything was sent.
    pub async fn notify_roots_list_changed(&self) -> McpResult<bool> {
        if !self.inner.capabilities.advertises_list_changed(ListKind::Roots) {
            debug!("Roots listChanged not advertised; notification suppressed");
            return Ok(false);
        }
        self.notify(ListKind::Roots.notification_method(), None)
            .await?;
        Ok(true)
    }

    /// Receive notifications sent by the server from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// The server's `initialize` result.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.inner.server.get()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.server_info().map(|r| r.protocol_version.as_str())
    }

    pub async fn status(&self) -> SessionStatus {
        *self.inner.status.read().await
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.transport.session_id().await
    }

    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.len().await
    }

    /// Resolve once no calls are outstanding or the session is closed.
    pub async fn wait(&self) {
        self.inner.pending.wait_idle().await
    }

    /// Close the session: stop streams, end the server-side session, fail
    /// outstanding calls, and wait for background tasks.
    pub async fn close(&self) -> McpResult<()> {
        {
            let mut status = self.inner.status.write().await;
            if *status == SessionStatus::Closed {
                return Ok(());
            }
            *status = SessionStatus::Closed;
        }

        let result = self.inner.transport.close().await;
        self.inner.pending.close(|| McpError::Closed).await;
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("MCP session closed");
        result
    }
}

async fn dispatch(
    inner: Weak<Inner>,
    mut inbound: mpsc::Receiver<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = inbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match item {
            Inbound::Message(Message::Response(response)) => {
                inner.pending.resolve(response).await;
            }
            Inbound::Message(Message::Notification(notification)) => {
                debug!(method = %notification.method, "Server notification");
                let _ = inner.notifications.send(notification);
            }
            Inbound::Message(Message::Request(request)) => answer(inner, request),
            Inbound::CallFailed { id, error } => {
                debug!(id = %id, error = %error, "Call failed in transport");
                inner.pending.fail(&id, error).await;
            }
        }
    }
    debug!("Client dispatcher stopped");
}

fn answer(inner: Arc<Inner>, request: Request) {
    let tasks = inner.tasks.clone();
    tasks.spawn(async move {
        let Request { id, method, params } = request;
        debug!(method = %method, id = %id, "Answering server request");
        let result = inner.methods.call((), &method, params).await;
        let response = Response { id, result };
        if let Err(e) = inner
            .transport
            .send(response.into(), inner.shutdown.child_token())
            .await
        {
            warn!(method = %method, error = %e, "Failed to answer server request");
        }
    });
}
