//! Server-side session state.
//!
//! Every SSE stream of a session writes into one event log. Event ids come
//! from a single per-session counter, so a `Last-Event-ID` names both the
//! stream to resume and the position in it. Stream 0 is the standalone
//! stream; request streams get ids from 1 up.

use crate::config::ServerOptions;
use crate::error::{McpError, McpResult};
use crate::jsonrpc::{Message, Notification, Request, RequestId, Response};
use crate::protocol::{
    methods, InitializeParams, ListKind, LoggingLevel, LoggingMessageParams, ProgressParams,
};
use crate::session::{PendingCalls, SessionStatus};
use crate::sse::{EventWriter, SseEvent};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Identifies one SSE stream within a session.
pub type StreamId = u64;

/// The standalone GET stream.
pub const STANDALONE_STREAM: StreamId = 0;

/// What an open SSE response writes next.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(SseEvent),
    /// End the HTTP body, optionally telling the client when to reconnect.
    Close { retry: Option<Duration> },
}

/// Why a stream could not be attached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("a standalone stream is already open")]
    Conflict,
    #[error("unknown event id {0:?}")]
    UnknownEvent(String),
    #[error("session closed")]
    Closed,
}

#[derive(Default)]
struct StreamLog {
    events: VecDeque<(u64, SseEvent)>,
    live: Option<mpsc::UnboundedSender<Frame>>,
    /// Trailing events recorded while nobody was listening.
    undelivered: usize,
    /// Closed by the handler before anyone attached.
    close_pending: Option<Option<Duration>>,
    finished: bool,
    /// An HTTP body has attached at least once.
    attached: bool,
}

impl StreamLog {
    fn is_live(&self) -> bool {
        self.live.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send(&mut self, frame: Frame) -> bool {
        let Some(tx) = &self.live else {
            return false;
        };
        if tx.send(frame).is_ok() {
            true
        } else {
            self.live = None;
            false
        }
    }
}

struct EventStore {
    writer: EventWriter,
    streams: HashMap<StreamId, StreamLog>,
    finished: VecDeque<StreamId>,
    next_stream: StreamId,
}

impl EventStore {
    fn new() -> Self {
        Self {
            writer: EventWriter::default(),
            streams: HashMap::new(),
            finished: VecDeque::new(),
            next_stream: STANDALONE_STREAM + 1,
        }
    }

    fn retain(&mut self, stream: StreamId, id: u64, event: SseEvent, max_events: usize) {
        let log = self.streams.entry(stream).or_default();
        let delivered = log.send(Frame::Event(event.clone()));
        log.events.push_back((id, event));
        if delivered {
            log.undelivered = 0;
        } else {
            log.undelivered += 1;
        }
        while log.events.len() > max_events.max(1) {
            log.events.pop_front();
        }
        log.undelivered = log.undelivered.min(log.events.len());
    }

    /// Attach a fresh listener, replaying events after `after`, or the
    /// undelivered tail when `after` is `None`.
    fn attach(&mut self, stream: StreamId, after: Option<u64>) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = self.streams.entry(stream).or_default();
        log.attached = true;

        let replay: Vec<SseEvent> = match after {
            Some(after) => log
                .events
                .iter()
                .filter(|(id, _)| *id > after)
                .map(|(_, e)| e.clone())
                .collect(),
            None => log
                .events
                .iter()
                .skip(log.events.len() - log.undelivered)
                .map(|(_, e)| e.clone())
                .collect(),
        };
        for event in replay {
            let _ = tx.send(Frame::Event(event));
        }
        log.undelivered = 0;

        if log.finished {
            let _ = tx.send(Frame::Close { retry: None });
        } else if let Some(retry) = log.close_pending.take() {
            let _ = tx.send(Frame::Close { retry });
        } else {
            log.live = Some(tx);
        }
        rx
    }

    /// Forget the oldest finished streams beyond `keep`. A stream no HTTP
    /// body has attached to yet stays until one does.
    fn evict_finished(&mut self, keep: usize) {
        let mut excess = self.finished.len().saturating_sub(keep);
        let streams = &self.streams;
        let mut evicted = Vec::new();
        self.finished.retain(|stream| {
            let attached = streams.get(stream).map_or(true, |log| log.attached);
            if excess > 0 && attached {
                excess -= 1;
                evicted.push(*stream);
                false
            } else {
                true
            }
        });
        for stream in evicted {
            self.streams.remove(&stream);
        }
    }

    fn find_stream(&self, event_id: u64) -> Option<StreamId> {
        self.streams
            .iter()
            .find(|(_, log)| log.events.iter().any(|(id, _)| *id == event_id))
            .map(|(stream, _)| *stream)
    }
}

/// One MCP session on the server.
pub struct ServerSession {
    id: String,
    protocol_version: String,
    client: InitializeParams,
    options: Arc<ServerOptions>,
    status: RwLock<SessionStatus>,
    log_level: RwLock<Option<LoggingLevel>>,
    pending: PendingCalls,
    next_request_id: AtomicI64,
    cancel: CancellationToken,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    store: Mutex<EventStore>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("protocol_version", &self.protocol_version)
            .field("client", &self.client.client_info.name)
            .finish_non_exhaustive()
    }
}

impl ServerSession {
    pub fn new(
        id: impl Into<String>,
        protocol_version: impl Into<String>,
        client: InitializeParams,
        options: Arc<ServerOptions>,
    ) -> Self {
        Self {
            id: id.into(),
            protocol_version: protocol_version.into(),
            client,
            options,
            status: RwLock::new(SessionStatus::Initializing),
            log_level: RwLock::new(None),
            pending: PendingCalls::new(),
            next_request_id: AtomicI64::new(1),
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
            store: Mutex::new(EventStore::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The version fixed by `initialize`.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// What the client sent in `initialize`.
    pub fn client(&self) -> &InitializeParams {
        &self.client
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    /// Handle `notifications/initialized`.
    pub async fn mark_active(&self) {
        let mut status = self.status.write().await;
        if *status == SessionStatus::Initializing {
            debug!(session_id = %self.id, "Session active");
            *status = SessionStatus::Active;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the session closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn set_log_level(&self, level: LoggingLevel) {
        debug!(session_id = %self.id, ?level, "Client set logging level");
        *self.log_level.write().await = Some(level);
    }

    pub async fn log_level(&self) -> Option<LoggingLevel> {
        *self.log_level.read().await
    }

    pub(crate) async fn open_request_stream(&self) -> StreamId {
        let mut store = self.store.lock().await;
        let stream = store.next_stream;
        store.next_stream += 1;
        stream
    }

    /// Append `message` to `stream`, delivering it if someone is listening.
    ///
    /// Messages for the standalone stream are dropped when nobody listens
    /// and buffering is off. Returns the event id when the message was kept.
    pub async fn record(&self, stream: StreamId, message: &Message) -> Option<u64> {
        let mut store = self.store.lock().await;
        if stream == STANDALONE_STREAM && !self.options.buffer_unsolicited {
            let listening = store
                .streams
                .get(&STANDALONE_STREAM)
                .is_some_and(StreamLog::is_live);
            if !listening {
                debug!(session_id = %self.id, method = ?message.method(), "No standalone stream; message dropped");
                return None;
            }
        }
        let (id, event) = store.writer.message(message);
        trace!(session_id = %self.id, stream, event_id = id, "Recorded event");
        store.retain(stream, id, event, self.options.max_retained_events);
        Some(id)
    }

    async fn prime(&self, stream: StreamId) {
        let mut store = self.store.lock().await;
        let (id, event) = store.writer.priming();
        store.retain(stream, id, event, self.options.max_retained_events);
    }

    /// Mark a request stream complete and end its HTTP body.
    pub(crate) async fn finish(&self, stream: StreamId) {
        let mut store = self.store.lock().await;
        let Some(log) = store.streams.get_mut(&stream) else {
            return;
        };
        log.finished = true;
        log.send(Frame::Close { retry: None });
        log.live = None;

        store.finished.push_back(stream);
        store.evict_finished(self.options.max_finished_streams);
    }

    /// End the HTTP body of `stream` before the call completes. Later events
    /// are kept for the client to fetch with `Last-Event-ID`.
    pub async fn close_stream(&self, stream: StreamId, retry: Option<Duration>) {
        let mut store = self.store.lock().await;
        let log = store.streams.entry(stream).or_default();
        if log.finished {
            return;
        }
        if log.send(Frame::Close { retry }) {
            debug!(session_id = %self.id, stream, "Closed stream mid-call");
            log.live = None;
        } else {
            log.close_pending = Some(retry);
        }
    }

    /// Attach the HTTP body of a request that switched to streaming.
    pub(crate) async fn attach_request_stream(
        &self,
        stream: StreamId,
    ) -> mpsc::UnboundedReceiver<Frame> {
        self.prime(stream).await;
        let mut store = self.store.lock().await;
        // The priming event is undelivered too, so it leads the replay.
        store.attach(stream, None)
    }

    /// Open the standalone stream, flushing anything buffered for it.
    pub async fn attach_standalone(&self) -> Result<mpsc::UnboundedReceiver<Frame>, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let rx = {
            let mut store = self.store.lock().await;
            let open = store
                .streams
                .get(&STANDALONE_STREAM)
                .is_some_and(StreamLog::is_live);
            if open {
                return Err(StreamError::Conflict);
            }
            store.attach(STANDALONE_STREAM, None)
        };
        self.prime(STANDALONE_STREAM).await;
        info!(session_id = %self.id, "Standalone stream opened");
        Ok(rx)
    }

    /// Resume whichever stream carried `last_event_id`.
    pub async fn resume(
        &self,
        last_event_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Frame>, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let unknown = || StreamError::UnknownEvent(last_event_id.to_string());
        let after: u64 = last_event_id.trim().parse().map_err(|_| unknown())?;

        let mut store = self.store.lock().await;
        let stream = store.find_stream(after).ok_or_else(unknown)?;
        // A resume means the client lost its previous connection, even if
        // the server has not noticed yet.
        if let Some(log) = store.streams.get_mut(&stream) {
            if log.is_live() {
                debug!(session_id = %self.id, stream, "Replacing stale listener");
                log.send(Frame::Close { retry: None });
                log.live = None;
            }
        }
        debug!(session_id = %self.id, stream, last_event_id = after, "Resuming stream");
        Ok(store.attach(stream, Some(after)))
    }

    /// Send a notification on the standalone stream.
    ///
    /// Returns whether it was delivered or buffered.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<bool> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        let message = Message::Notification(Notification::new(method, params));
        Ok(self.record(STANDALONE_STREAM, &message).await.is_some())
    }

    /// Send a request to the client and wait for its POSTed response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let reply = self
            .pending
            .register(id.clone(), self.cancel.child_token())
            .await?;

        let message = Message::Request(Request::new(id.clone(), method, params));
        if self.record(STANDALONE_STREAM, &message).await.is_none() {
            self.pending.remove(&id).await;
            return Err(McpError::connection_failed(
                "no standalone stream to carry the request",
            ));
        }

        tokio::select! {
            reply = reply => reply.unwrap_or(Err(McpError::Closed)),
            _ = self.cancel.cancelled() => Err(McpError::Closed),
        }
    }

    /// Route a response POSTed by the client.
    pub async fn resolve(&self, response: Response) -> bool {
        self.pending.resolve(response).await
    }

    /// Send `notifications/message` if the client asked for this level.
    pub async fn log(
        &self,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> McpResult<bool> {
        let Some(params) = self.log_params(level, logger, data).await else {
            return Ok(false);
        };
        self.notify(methods::LOGGING_MESSAGE, Some(params)).await
    }

    async fn log_params(&self, level: LoggingLevel, logger: Option<&str>, data: Value) -> Option<Value> {
        let min = (*self.log_level.read().await)?;
        if level < min {
            return None;
        }
        serde_json::to_value(LoggingMessageParams {
            level,
            logger: logger.map(str::to_string),
            data,
        })
        .ok()
    }

    /// Send a list-changed notification if this server advertised it.
    pub async fn notify_list_changed(&self, kind: ListKind) -> McpResult<bool> {
        if !self.options.capabilities.advertises_list_changed(kind) {
            debug!(session_id = %self.id, ?kind, "listChanged not advertised; notification suppressed");
            return Ok(false);
        }
        self.notify(kind.notification_method(), None).await
    }

    pub(crate) async fn track_request(&self, id: RequestId) -> CancellationToken {
        let token = self.cancel.child_token();
        self.in_flight.lock().await.insert(id, token.clone());
        token
    }

    pub(crate) async fn untrack_request(&self, id: &RequestId) {
        self.in_flight.lock().await.remove(id);
    }

    /// Handle `notifications/cancelled`.
    pub async fn cancel_request(&self, id: &RequestId) -> bool {
        match self.in_flight.lock().await.remove(id) {
            Some(token) => {
                debug!(session_id = %self.id, id = %id, "Cancelling in-flight request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Close the session: cancel handlers, fail requests to the client and
    /// end every open stream.
    pub async fn close(&self) {
        {
            let mut status = self.status.write().await;
            if *status == SessionStatus::Closed {
                return;
            }
            *status = SessionStatus::Closed;
        }
        self.cancel.cancel();
        self.pending.close(|| McpError::Closed).await;
        self.in_flight.lock().await.clear();

        let mut store = self.store.lock().await;
        for log in store.streams.values_mut() {
            log.send(Frame::Close { retry: None });
            log.live = None;
        }
        info!(session_id = %self.id, "Session closed");
    }
}

/// How a request handler's first output reaches the HTTP exchange.
#[derive(Debug)]
pub(crate) enum FirstReply {
    /// The handler finished without emitting anything else.
    Immediate(Response),
    /// The handler emitted a message; answer with SSE.
    Streaming,
}

/// Per-request handle given to method handlers.
#[derive(Clone)]
pub struct RequestContext {
    session: Arc<ServerSession>,
    request_id: RequestId,
    stream: StreamId,
    first: Arc<std::sync::Mutex<Option<oneshot::Sender<FirstReply>>>>,
    cancel: CancellationToken,
    progress_token: Option<Value>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("session", &self.session.id)
            .field("request_id", &self.request_id)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub(crate) fn new(
        session: Arc<ServerSession>,
        request_id: RequestId,
        stream: StreamId,
        first: oneshot::Sender<FirstReply>,
        cancel: CancellationToken,
        progress_token: Option<Value>,
    ) -> Self {
        Self {
            session,
            request_id,
            stream,
            first: Arc::new(std::sync::Mutex::new(Some(first))),
            cancel,
            progress_token,
        }
    }

    pub fn session(&self) -> &Arc<ServerSession> {
        &self.session
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub(crate) fn stream(&self) -> StreamId {
        self.stream
    }

    /// Cancelled when the client cancels the request or the session closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Take the one-shot fast-path sender, if the reply has not started yet.
    pub(crate) fn take_first(&self) -> Option<oneshot::Sender<FirstReply>> {
        match self.first.lock() {
            Ok(mut first) => first.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn start_streaming(&self) {
        if let Some(first) = self.take_first() {
            trace!(id = %self.request_id, "Reply switches to SSE");
            let _ = first.send(FirstReply::Streaming);
        }
    }

    /// Send a notification on this request's stream.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.session.is_closed() {
            return Err(McpError::Closed);
        }
        self.start_streaming();
        let message = Message::Notification(Notification::new(method, params));
        self.session.record(self.stream, &message).await;
        Ok(())
    }

    /// Report progress, if the caller asked for it with a progress token.
    pub async fn progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> McpResult<bool> {
        let Some(token) = self.progress_token.clone() else {
            return Ok(false);
        };
        let params = ProgressParams {
            progress_token: token,
            progress,
            total,
            message,
        };
        self.notify(methods::PROGRESS, Some(serde_json::to_value(params)?))
            .await?;
        Ok(true)
    }

    /// Log to the client on this request's stream, subject to its level.
    pub async fn log(&self, level: LoggingLevel, data: Value) -> McpResult<bool> {
        let Some(params) = self.session.log_params(level, None, data).await else {
            return Ok(false);
        };
        self.notify(methods::LOGGING_MESSAGE, Some(params)).await?;
        Ok(true)
    }

    /// End this request's HTTP body now; the client resumes with `Last-Event-ID`.
    pub async fn close_stream(&self, retry: Option<Duration>) {
        self.start_streaming();
        self.session.close_stream(self.stream, retry).await;
    }
}

/// Sessions by id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<ServerSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<ServerSession>) {
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Close and forget every session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            warn!(count = sessions.len(), "Closing remaining sessions");
        }
        for session in sessions {
            session.close().await;
        }
    }
}
