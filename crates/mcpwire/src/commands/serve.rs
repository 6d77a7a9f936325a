//! Demo server.
//!
//! Hosts a few tools that exercise each reply mode: `echo` answers with
//! plain JSON, `countdown` streams progress and log messages, and
//! `resume_demo` drops its stream halfway so the client has to reconnect
//! with `Last-Event-ID`.

use mcpwire_mcp::protocol::{
    CallToolParams, CallToolResult, ListChangedCapability, ListToolsResult, LoggingLevel, Tool,
};
use mcpwire_mcp::{
    create_mcp_router_at, JsonRpcError, McpError, McpHttpState, MethodRegistry, RequestContext,
    ServerOptions, VersionPolicy,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Command-line settings for `mcpwire serve`.
#[derive(Debug, Clone)]
pub struct ServeArgs {
    pub address: SocketAddr,
    pub path: String,
    pub strict_version: bool,
    pub api_key: Option<String>,
    pub no_standalone: bool,
}

/// Apply command-line flags on top of the config file.
pub fn server_options(args: &ServeArgs, mut options: ServerOptions) -> ServerOptions {
    if args.strict_version {
        options.version_policy = VersionPolicy::Strict;
    }
    if args.no_standalone {
        options.standalone_stream = false;
    }
    if options.capabilities.tools.is_none() {
        options.capabilities.tools = Some(ListChangedCapability::default());
    }
    options
}

fn internal(error: McpError) -> JsonRpcError {
    JsonRpcError::internal(error.to_string())
}

fn tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "echo".to_string(),
            description: Some("Return the given text".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
            }),
        },
        Tool {
            name: "countdown".to_string(),
            description: Some("Count down, reporting progress at each step".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "steps": {"type": "integer", "minimum": 1},
                    "delayMs": {"type": "integer", "minimum": 0},
                },
            }),
        },
        Tool {
            name: "resume_demo".to_string(),
            description: Some("Close the reply stream midway and finish after reconnect".to_string()),
            input_schema: json!({ "type": "object" }),
        },
    ]
}

async fn call_tool(
    ctx: RequestContext,
    params: CallToolParams,
) -> Result<CallToolResult, JsonRpcError> {
    let args = params.arguments.unwrap_or(Value::Null);
    match params.name.as_str() {
        "echo" => {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(CallToolResult::text(text))
        }
        "countdown" => {
            let steps = args.get("steps").and_then(Value::as_u64).unwrap_or(3).max(1);
            let delay = Duration::from_millis(args.get("delayMs").and_then(Value::as_u64).unwrap_or(200));
            for step in 1..=steps {
                tokio::time::sleep(delay).await;
                ctx.progress(
                    step as f64,
                    Some(steps as f64),
                    Some(format!("step {step}/{steps}")),
                )
                .await
                .map_err(internal)?;
                ctx.log(LoggingLevel::Info, json!({ "remaining": steps - step }))
                    .await
                    .map_err(internal)?;
            }
            Ok(CallToolResult::text("liftoff"))
        }
        "resume_demo" => {
            ctx.progress(0.5, Some(1.0), Some("closing stream".to_string()))
                .await
                .map_err(internal)?;
            ctx.close_stream(Some(Duration::from_millis(250))).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            ctx.progress(1.0, Some(1.0), None).await.map_err(internal)?;
            Ok(CallToolResult::text("resumed"))
        }
        other => Err(JsonRpcError::invalid_params(format!("unknown tool: {other}"))),
    }
}

/// Methods served by the demo.
pub fn demo_methods() -> MethodRegistry<RequestContext> {
    MethodRegistry::new()
        .with("tools/list", |_ctx: RequestContext, _params: Value| async move {
            Ok::<_, JsonRpcError>(ListToolsResult {
                tools: tools(),
                next_cursor: None,
            })
        })
        .with("tools/call", call_tool)
}

/// Build the server state from flags and config.
pub fn build_state(args: &ServeArgs, options: ServerOptions) -> McpHttpState {
    let options = server_options(args, options);
    let state = McpHttpState::new(
        "mcpwire",
        env!("CARGO_PKG_VERSION"),
        options,
        demo_methods(),
    );
    match &args.api_key {
        Some(key) => state.with_api_key(key.clone()),
        None => state,
    }
}

/// Run the demo server until interrupted.
pub async fn run_server(args: ServeArgs, options: ServerOptions) -> anyhow::Result<()> {
    info!("Starting mcpwire server on {}", args.address);

    let state = build_state(&args, options);
    let app = create_mcp_router_at(state.clone(), &args.path).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.address).await?;
    info!("Server listening on http://{}{}", args.address, args.path);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Shutting down");
            // Open SSE bodies keep connections alive until their sessions close.
            state.shutdown().await;
        })
        .await?;

    Ok(())
}
