//! Client transport abstraction.
//!
//! A transport moves messages between a client session and a server. Replies
//! and server-initiated messages come back asynchronously as [`Inbound`]
//! items on a channel handed to the transport at construction, so the
//! session never holds a reference back into the transport's tasks.

use crate::error::{McpError, McpResult};
use crate::jsonrpc::{Message, RequestId};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Something a transport delivers to its session.
#[derive(Debug)]
pub enum Inbound {
    /// A message from the server.
    Message(Message),
    /// A call's reply stream failed for good.
    CallFailed { id: RequestId, error: McpError },
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    ///
    /// For a request, `Ok` means the server accepted it; the response arrives
    /// later as [`Inbound::Message`] or [`Inbound::CallFailed`]. Cancelling
    /// `cancel` aborts the exchange and any stream opened for it.
    async fn send(&self, message: Message, cancel: CancellationToken) -> McpResult<()>;

    /// Record the negotiated protocol version, sent on every later request.
    async fn set_protocol_version(&self, version: &str);

    /// Open the standalone server-to-client stream, if the server offers one.
    async fn open_standalone(&self) -> McpResult<()>;

    /// Stop all streams, wait for them, and end the server-side session.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// The server-assigned session id, once known.
    async fn session_id(&self) -> Option<String>;
}
