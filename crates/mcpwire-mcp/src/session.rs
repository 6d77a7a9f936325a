//! Per-session state shared by the client and the server side.
//!
//! A [`PendingCalls`] table routes incoming responses to the caller waiting
//! on them, by id and never by order. [`VersionPolicy`] decides what happens
//! when a request carries the wrong `MCP-Protocol-Version`.

use crate::error::{McpError, McpResult};
use crate::jsonrpc::{RequestId, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// `initialize` answered, `notifications/initialized` not yet seen.
    Initializing,
    /// Normal operation.
    Active,
    /// Closed by either side. Terminal.
    Closed,
}

/// How to treat a missing or mismatched `MCP-Protocol-Version` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Reject with HTTP 400.
    Strict,
    /// Log a warning and carry on.
    #[default]
    Lenient,
}

/// Outcome of checking a request's protocol version header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    Accepted,
    Tolerated(String),
    Rejected(String),
}

impl VersionPolicy {
    /// Check `header` against the version negotiated for the session.
    pub fn check(&self, negotiated: &str, header: Option<&str>) -> VersionCheck {
        let problem = match header {
            Some(v) if v == negotiated => return VersionCheck::Accepted,
            Some(v) => format!("protocol version {v:?} does not match negotiated {negotiated:?}"),
            None => format!("missing protocol version header (negotiated {negotiated:?})"),
        };
        match self {
            VersionPolicy::Strict => VersionCheck::Rejected(problem),
            VersionPolicy::Lenient => VersionCheck::Tolerated(problem),
        }
    }
}

type Reply = McpResult<Value>;

struct PendingCall {
    reply: oneshot::Sender<Reply>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PendingInner {
    calls: HashMap<RequestId, PendingCall>,
    closed: bool,
}

/// Outstanding requests keyed by id.
#[derive(Default)]
pub struct PendingCalls {
    inner: Mutex<PendingInner>,
    idle: Notify,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call before its request is sent.
    pub async fn register(
        &self,
        id: RequestId,
        cancel: CancellationToken,
    ) -> McpResult<oneshot::Receiver<Reply>> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(McpError::Closed);
        }
        if inner.calls.contains_key(&id) {
            return Err(McpError::protocol_error(format!(
                "duplicate request id {id}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(id, PendingCall { reply: tx, cancel });
        Ok(rx)
    }

    /// Route a response to its waiter. Unmatched ids are logged and dropped.
    pub async fn resolve(&self, response: Response) -> bool {
        let Response { id, result } = response;
        self.complete(&id, result.map_err(McpError::Rpc)).await
    }

    /// Fail one call.
    pub async fn fail(&self, id: &RequestId, error: McpError) -> bool {
        self.complete(id, Err(error)).await
    }

    async fn complete(&self, id: &RequestId, reply: Reply) -> bool {
        let call = {
            let mut inner = self.inner.lock().await;
            let call = inner.calls.remove(id);
            if inner.calls.is_empty() {
                self.idle.notify_waiters();
            }
            call
        };
        match call {
            Some(call) => {
                if call.reply.send(reply).is_err() {
                    debug!(id = %id, "Waiter went away before its reply arrived");
                }
                true
            }
            None => {
                warn!(id = %id, "Dropping reply for unknown request id");
                false
            }
        }
    }

    /// Forget a call without replying, e.g. after the caller cancelled it.
    pub async fn remove(&self, id: &RequestId) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.calls.remove(id).is_some();
        if inner.calls.is_empty() {
            self.idle.notify_waiters();
        }
        removed
    }

    /// Fail every outstanding call and refuse new ones.
    pub async fn close(&self, make_error: impl Fn() -> McpError) {
        let calls = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            std::mem::take(&mut inner.calls)
        };
        for (_, call) in calls {
            call.cancel.cancel();
            let _ = call.reply.send(Err(make_error()));
        }
        self.idle.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.calls.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Resolve once no calls are outstanding or the table is closed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                if inner.closed || inner.calls.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}
