//! Streamable HTTP client transport.
//!
//! Every message is POSTed to one endpoint. The server answers a request
//! with a single JSON body or with an SSE stream that ends with the response;
//! `202 Accepted` means the reply comes on another stream. A GET opens the
//! standalone stream for server-initiated traffic.
//!
//! Each open stream runs on its own task, tracked so that [`close`] only
//! returns after all of them have stopped. A stream that drops after
//! delivering at least one event id is resumed with a GET carrying
//! `Last-Event-ID`, after a backoff delay, until the reconnect deadline.
//!
//! [`close`]: Transport::close

use crate::backoff::{classify_status, sleep_with_cancel, Backoff, FailureClass};
use crate::config::ClientConfig;
use crate::error::{McpError, McpResult};
use crate::jsonrpc::{Message, RequestId};
use crate::protocol::{LAST_EVENT_ID_HEADER, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};
use crate::sse::{EventStream, SseError};
use crate::transport::{Inbound, Transport};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Capacity of the channel from stream tasks to the session.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

const ACCEPT_POST: &str = "application/json, text/event-stream";
const ACCEPT_SSE: &str = "text/event-stream";
const MAX_ERROR_BODY: usize = 200;

/// Streamable HTTP transport for remote MCP servers.
pub struct StreamableClientTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,
    http: Client,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    /// Why the session became unusable, if it did.
    broken: RwLock<Option<String>>,
    /// The server answered 404 for the session; DELETE would be redundant.
    session_gone: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    inbound: mpsc::Sender<Inbound>,
}

/// Progress through one logical stream across reconnects.
#[derive(Debug, Default)]
struct StreamCursor {
    last_event_id: Option<String>,
    retry: Option<Duration>,
    /// An id-bearing event arrived since the last (re)connect.
    progressed: bool,
}

#[derive(Debug)]
enum StreamOutcome {
    Answered,
    Cancelled,
    Ended,
    Failed(SseError),
}

impl StreamableClientTransport {
    /// Create a transport delivering replies into `inbound`.
    pub fn new(config: ClientConfig, inbound: mpsc::Sender<Inbound>) -> McpResult<Self> {
        config.validate()?;
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| {
                McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                http,
                session_id: RwLock::new(None),
                protocol_version: RwLock::new(None),
                broken: RwLock::new(None),
                session_gone: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                inbound,
            }),
        })
    }

    /// Create a transport together with the receiving end of its channel.
    pub fn with_channel(config: ClientConfig) -> McpResult<(Self, mpsc::Receiver<Inbound>)> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Ok((Self::new(config, tx)?, rx))
    }

    /// Why the session is unusable, if an earlier failure broke it.
    pub async fn broken_reason(&self) -> Option<String> {
        self.shared.broken.read().await.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl Drop for StreamableClientTransport {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The media type of a `Content-Type` value, without parameters.
fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

impl Shared {
    /// Build request with common headers.
    async fn request(&self, method: Method, accept: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, &self.config.endpoint)
            .header(ACCEPT, accept);

        for (key, value) in &self.config.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(ref token) = self.config.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_ID_HEADER, id);
        }
        if let Some(version) = self.protocol_version.read().await.as_deref() {
            req = req.header(PROTOCOL_VERSION_HEADER, version);
        }
        req
    }

    async fn ensure_usable(&self) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        if let Some(reason) = self.broken.read().await.clone() {
            return Err(McpError::SessionBroken(reason));
        }
        Ok(())
    }

    async fn mark_broken(&self, reason: &str) {
        let mut broken = self.broken.write().await;
        if broken.is_none() {
            warn!(reason, "Session is no longer usable");
            *broken = Some(reason.to_string());
        }
    }

    /// Turn a non-success response into an error, breaking the session when
    /// the status says so.
    async fn status_error(&self, context: &str, response: reqwest::Response) -> McpError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let mut text = format!("{context}: {status}");
        let body = body.trim();
        if !body.is_empty() {
            let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
            text.push_str(&format!(" ({snippet})"));
        }

        match classify_status(status.as_u16()) {
            FailureClass::Transient => McpError::Transient(text),
            FailureClass::ServerError => McpError::Server(text),
            FailureClass::SessionNotFound if self.session_id.read().await.is_some() => {
                self.session_gone.store(true, Ordering::SeqCst);
                self.mark_broken("session not found").await;
                McpError::Fatal(format!("session not found: {text}"))
            }
            FailureClass::SessionNotFound | FailureClass::Fatal => {
                self.mark_broken(&text).await;
                McpError::Fatal(text)
            }
        }
    }

    async fn deliver(&self, item: Inbound) {
        tokio::select! {
            result = self.inbound.send(item) => {
                if result.is_err() {
                    debug!("Session dropped its inbound channel");
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Route the body of an accepted POST for request `id`.
    async fn accept_reply(
        self: Arc<Self>,
        id: RequestId,
        response: reqwest::Response,
        cancel: CancellationToken,
    ) -> McpResult<()> {
        if response.status() == StatusCode::ACCEPTED {
            debug!(id = %id, "Reply will arrive on another stream");
            return Ok(());
        }

        let content_type = header_str(response.headers(), CONTENT_TYPE.as_str())
            .map(media_type)
            .unwrap_or_default();

        match content_type.as_str() {
            "application/json" => {
                let bytes = tokio::select! {
                    bytes = response.bytes() => bytes.map_err(McpError::from_send)?,
                    _ = cancel.cancelled() => return Err(McpError::Cancelled),
                };
                let message = Message::decode(&bytes)?;
                let answered = matches!(&message, Message::Response(resp) if resp.id == id);
                self.deliver(Inbound::Message(message)).await;
                if !answered {
                    warn!(id = %id, "JSON reply does not answer the request");
                    let error = McpError::protocol_error(format!(
                        "JSON reply carried no response for request {id}"
                    ));
                    self.deliver(Inbound::CallFailed { id, error }).await;
                }
                Ok(())
            }
            "text/event-stream" => {
                debug!(id = %id, "Reply is streamed");
                let shared = self.clone();
                self.tasks
                    .spawn(async move { shared.run_call_stream(id, response, cancel).await });
                Ok(())
            }
            other => Err(McpError::protocol_error(format!(
                "unexpected content type {other:?} for request {id}"
            ))),
        }
    }

    /// Read one HTTP body until the call is answered, the body ends, or the
    /// connection drops.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        cursor: &mut StreamCursor,
        call_id: Option<&RequestId>,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        cursor.progressed = false;
        let mut events = EventStream::new(response.bytes_stream());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                _ = self.cancel.cancelled() => return StreamOutcome::Cancelled,
                next = events.next_event() => next,
            };
            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => return StreamOutcome::Ended,
                Err(e) => return StreamOutcome::Failed(e),
            };

            if let Some(delay) = event.retry_delay() {
                cursor.retry = Some(delay);
            }

            // The cursor only advances past events that decoded, so a resume
            // replays a corrupt record.
            let message = match event.decode() {
                None => None,
                Some(Ok(message)) => Some(message),
                Some(Err(e)) => {
                    warn!(error = %e, event_id = ?event.id, "Dropping stream after undecodable event");
                    return StreamOutcome::Failed(SseError::Undecodable(e.to_string()));
                }
            };
            if let Some(id) = event.id {
                cursor.last_event_id = Some(id);
                cursor.progressed = true;
            }

            let Some(message) = message else {
                continue;
            };
            let answered = matches!(
                (&message, call_id),
                (Message::Response(resp), Some(id)) if &resp.id == id
            );
            self.deliver(Inbound::Message(message)).await;
            if answered {
                return StreamOutcome::Answered;
            }
        }
    }

    /// Reconnect with `Last-Event-ID` until a stream opens, the deadline
    /// passes, or a non-transient failure occurs.
    async fn resume(
        &self,
        last_event_id: &str,
        backoff: &mut Backoff,
        hint: Option<Duration>,
        cancel: &CancellationToken,
    ) -> McpResult<reqwest::Response> {
        loop {
            let Some(delay) = backoff.next_delay(hint) else {
                return Err(McpError::ReconnectExhausted(format!(
                    "stream not resumed after {} attempts",
                    backoff.attempt()
                )));
            };
            let woke = tokio::select! {
                woke = sleep_with_cancel(delay, cancel) => woke,
                _ = self.cancel.cancelled() => return Err(McpError::Closed),
            };
            if !woke {
                return Err(McpError::Cancelled);
            }
            self.ensure_usable().await?;

            debug!(last_event_id, attempt = backoff.attempt(), "Resuming stream");
            let request = self
                .request(Method::GET, ACCEPT_SSE)
                .await
                .header(LAST_EVENT_ID_HEADER, last_event_id);
            let response = tokio::select! {
                response = request.send() => response,
                _ = cancel.cancelled() => return Err(McpError::Cancelled),
                _ = self.cancel.cancelled() => return Err(McpError::Closed),
            };

            match response {
                Ok(response) if response.status().is_success() => return Ok(response),
                // The server has not yet noticed the old connection is gone.
                Ok(response) if response.status() == StatusCode::CONFLICT => {
                    debug!(last_event_id, "Previous stream still attached, retrying");
                }
                Ok(response) => {
                    let error = self.status_error("GET (resume)", response).await;
                    if !error.is_transient() {
                        return Err(error);
                    }
                    debug!(error = %error, "Resume attempt failed");
                }
                Err(e) => debug!(error = %e, "Resume attempt failed"),
            }
        }
    }

    async fn run_call_stream(
        self: Arc<Self>,
        id: RequestId,
        mut response: reqwest::Response,
        cancel: CancellationToken,
    ) {
        let mut cursor = StreamCursor::default();
        let mut retry_state: Option<Backoff> = None;

        loop {
            let reason = match self.read_stream(response, &mut cursor, Some(&id), &cancel).await {
                StreamOutcome::Answered | StreamOutcome::Cancelled => return,
                StreamOutcome::Ended => "stream ended before the response".to_string(),
                StreamOutcome::Failed(e) => e.to_string(),
            };

            let Some(last_event_id) = cursor.last_event_id.clone() else {
                debug!(id = %id, reason = %reason, "Reply stream lost before any resumable event");
                self.deliver(Inbound::CallFailed {
                    id,
                    error: McpError::TerminatedWithoutResponse,
                })
                .await;
                return;
            };

            let backoff =
                retry_state.get_or_insert_with(|| Backoff::new(self.config.reconnect.clone()));
            if cursor.progressed {
                backoff.reset();
            }
            debug!(id = %id, last_event_id = %last_event_id, reason = %reason, "Reply stream lost, resuming");

            match self.resume(&last_event_id, backoff, cursor.retry, &cancel).await {
                Ok(next) => response = next,
                Err(McpError::Cancelled | McpError::Closed) => return,
                Err(error) => {
                    self.deliver(Inbound::CallFailed { id, error }).await;
                    return;
                }
            }
        }
    }

    async fn run_standalone(self: Arc<Self>, mut response: reqwest::Response) {
        let mut cursor = StreamCursor::default();
        let mut retry_state: Option<Backoff> = None;
        let cancel = self.cancel.clone();

        loop {
            match self.read_stream(response, &mut cursor, None, &cancel).await {
                StreamOutcome::Cancelled => return,
                StreamOutcome::Failed(e) => debug!(error = %e, "Standalone stream dropped"),
                StreamOutcome::Ended | StreamOutcome::Answered => {
                    debug!("Standalone stream ended")
                }
            }

            let Some(last_event_id) = cursor.last_event_id.clone() else {
                debug!("Standalone stream carried no events; not reopening");
                return;
            };

            let backoff =
                retry_state.get_or_insert_with(|| Backoff::new(self.config.reconnect.clone()));
            if cursor.progressed {
                backoff.reset();
            }

            match self.resume(&last_event_id, backoff, cursor.retry, &cancel).await {
                Ok(next) => response = next,
                Err(McpError::Cancelled | McpError::Closed) => return,
                Err(error) => {
                    warn!(error = %error, "Standalone stream could not be resumed");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableClientTransport {
    async fn send(&self, message: Message, cancel: CancellationToken) -> McpResult<()> {
        let shared = &self.shared;
        shared.ensure_usable().await?;

        debug!(
            method = message.method().unwrap_or("<response>"),
            id = ?message.id(),
            "Posting message"
        );

        let request = shared
            .request(Method::POST, ACCEPT_POST)
            .await
            .header(CONTENT_TYPE, "application/json")
            .body(message.encode());

        let response = tokio::select! {
            response = request.send() => response.map_err(McpError::from_send)?,
            _ = cancel.cancelled() => return Err(McpError::Cancelled),
            _ = shared.cancel.cancelled() => return Err(McpError::Closed),
        };

        if let Some(id) = header_str(response.headers(), SESSION_ID_HEADER) {
            let id = id.to_string();
            let mut session_id = shared.session_id.write().await;
            if session_id.is_none() {
                info!(session_id = %id, "Session established");
                *session_id = Some(id);
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(shared.status_error("POST", response).await);
        }
        shared.connected.store(true, Ordering::SeqCst);

        match message {
            Message::Request(request) => shared.clone().accept_reply(request.id, response, cancel).await,
            other => {
                if shared.config.strict && status != StatusCode::ACCEPTED {
                    return Err(McpError::protocol_error(format!(
                        "expected 202 Accepted for {}, got {status}",
                        other.method().unwrap_or("response")
                    )));
                }
                Ok(())
            }
        }
    }

    async fn set_protocol_version(&self, version: &str) {
        *self.shared.protocol_version.write().await = Some(version.to_string());
    }

    async fn open_standalone(&self) -> McpResult<()> {
        let shared = &self.shared;
        if !shared.config.open_standalone_stream {
            return Ok(());
        }
        shared.ensure_usable().await?;

        let request = shared.request(Method::GET, ACCEPT_SSE).await;
        let response = tokio::select! {
            response = request.send() => response.map_err(McpError::from_send)?,
            _ = shared.cancel.cancelled() => return Err(McpError::Closed),
        };

        let status = response.status();
        if status.is_success() {
            debug!("Standalone stream open");
            let stream_shared = shared.clone();
            shared
                .tasks
                .spawn(async move { stream_shared.run_standalone(response).await });
            return Ok(());
        }

        match status.as_u16() {
            400 | 404 | 405 => {
                info!(status = %status, "Server offers no standalone stream");
                Ok(())
            }
            500..=599 => {
                let reason = format!("GET: {status}");
                if shared.config.strict {
                    Err(McpError::StandaloneStream(reason))
                } else {
                    warn!(status = %status, "Standalone SSE stream unavailable, continuing without it");
                    Ok(())
                }
            }
            _ => Err(shared.status_error("GET (standalone SSE)", response).await),
        }
    }

    async fn close(&self) -> McpResult<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        shared.cancel.cancel();
        shared.tasks.close();
        shared.tasks.wait().await;
        shared.connected.store(false, Ordering::SeqCst);

        let Some(session_id) = shared.session_id.read().await.clone() else {
            return Ok(());
        };
        if shared.session_gone.load(Ordering::SeqCst) {
            debug!(session_id = %session_id, "Server already dropped the session; skipping DELETE");
            return Ok(());
        }

        let response = shared
            .request(Method::DELETE, ACCEPT_POST)
            .await
            .send()
            .await
            .map_err(McpError::from_send)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            debug!(session_id = %session_id, status = %status, "Session deleted");
            Ok(())
        } else {
            Err(McpError::connection_failed(format!("DELETE: {status}")))
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && !self.shared.closed.load(Ordering::SeqCst)
    }

    async fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{Notification, Request};

    fn transport(endpoint: &str) -> (StreamableClientTransport, mpsc::Receiver<Inbound>) {
        StreamableClientTransport::with_channel(ClientConfig::new(endpoint)).unwrap()
    }

    #[test]
    fn test_media_type() {
        assert_eq!(media_type("application/json; charset=utf-8"), "application/json");
        assert_eq!(media_type("Text/Event-Stream"), "text/event-stream");
        assert_eq!(media_type(""), "");
    }

    #[test]
    fn test_rejects_invalid_endpoint() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(StreamableClientTransport::new(ClientConfig::new("nope"), tx).is_err());
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (transport, _rx) = transport("http://127.0.0.1:1/mcp");
        assert!(!transport.is_connected());
        assert!(transport.session_id().await.is_none());
        assert!(transport.broken_reason().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let (transport, _rx) = transport("http://127.0.0.1:1/mcp");
        let result = transport
            .send(
                Request::new(RequestId::Number(1), "ping", None).into(),
                CancellationToken::new(),
            )
            .await;
        let err = result.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
        assert!(transport.broken_reason().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (transport, _rx) = transport("http://127.0.0.1:1/mcp");
        transport.close().await.unwrap();
        let result = transport
            .send(
                Notification::new("notifications/initialized", None).into(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(McpError::Closed)));
        // Second close is a no-op.
        transport.close().await.unwrap();
    }
}
