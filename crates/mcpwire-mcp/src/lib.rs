//! Model Context Protocol (MCP) over streamable HTTP.
//!
//! Both ends of the transport live here: a client that multiplexes calls over
//! one session and resumes dropped streams, and an axum router that hosts
//! sessions and answers with JSON or SSE.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  POST/GET/DELETE  ┌───────────────┐
//! │ ClientSession │──────────────────▶│ McpHttpState  │
//! │  (pending by  │◀──────────────────│ (sessions,    │
//! │   request id) │   JSON or SSE     │  event logs)  │
//! └───────────────┘                   └───────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mcpwire_mcp::{ClientConfig, ClientOptions, ClientSession};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ClientConfig::new("http://127.0.0.1:3000/mcp");
//! let session = ClientSession::connect(config, ClientOptions::default()).await?;
//!
//! let tools = session.list_tools(None).await?;
//! let result = session
//!     .call_tool("echo", Some(serde_json::json!({ "text": "hi" })))
//!     .await?;
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
mod error;
pub mod handler;
pub mod http_serve;
pub mod jsonrpc;
pub mod protocol;
pub mod server_session;
pub mod session;
pub mod sse;
pub mod streamable;
mod transport;

pub use backoff::{classify_status, Backoff, FailureClass, ReconnectConfig};
pub use client::{ClientOptions, ClientSession};
pub use config::{ClientConfig, Config, ServerOptions};
pub use error::{McpError, McpResult};
pub use handler::MethodRegistry;
pub use http_serve::{
    create_mcp_router, create_mcp_router_at, BearerVerifier, McpHttpState, StaticTokenVerifier,
    DEFAULT_MCP_PATH,
};
pub use jsonrpc::{JsonRpcError, Message, Notification, Request, RequestId, Response};
pub use server_session::{RequestContext, ServerSession, SessionRegistry};
pub use session::{SessionStatus, VersionPolicy};
pub use streamable::StreamableClientTransport;
pub use transport::{Inbound, Transport};
