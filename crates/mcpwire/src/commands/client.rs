//! Client command handlers: `call`, `ping` and `listen`.

use anyhow::Context;
use clap::Args;
use mcpwire_mcp::{ClientConfig, ClientOptions, ClientSession, Message};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where and how to connect.
#[derive(Args, Debug, Clone, Default)]
pub struct RemoteArgs {
    /// MCP endpoint URL (defaults to the config file's client endpoint)
    #[arg(short, long)]
    pub endpoint: Option<String>,
    /// Bearer token
    #[arg(long)]
    pub token: Option<String>,
    /// Fail on a standalone-stream 5xx and on notifications not answered with 202
    #[arg(long)]
    pub strict: bool,
}

/// Apply command-line flags on top of the config file.
pub fn client_config(args: &RemoteArgs, mut config: ClientConfig) -> anyhow::Result<ClientConfig> {
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if config.endpoint.is_empty() {
        anyhow::bail!("No endpoint given; pass --endpoint or set client.endpoint in the config file");
    }
    if let Some(token) = &args.token {
        config.auth_token = Some(token.clone());
    }
    if args.strict {
        config.strict = true;
    }
    Ok(config)
}

async fn connect(args: &RemoteArgs, config: ClientConfig) -> anyhow::Result<ClientSession> {
    let config = client_config(args, config)?;
    let endpoint = config.endpoint.clone();
    ClientSession::connect(config, ClientOptions::default())
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))
}

/// Parse `--params`, which must be a JSON object or array.
pub fn parse_params(params: Option<&str>) -> anyhow::Result<Option<Value>> {
    let Some(text) = params else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(text).context("Invalid --params JSON")?;
    if !value.is_object() && !value.is_array() {
        anyhow::bail!("--params must be a JSON object or array");
    }
    Ok(Some(value))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

/// Call `method` and print the result as JSON.
pub async fn run_call(
    args: &RemoteArgs,
    config: ClientConfig,
    method: &str,
    params: Option<&str>,
) -> anyhow::Result<()> {
    let params = parse_params(params)?;
    let session = connect(args, config).await?;

    let mut notifications = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            eprintln!("{}", Message::Notification(notification).to_value());
        }
    });

    let result = session
        .call_with_cancel(method, params, cancel_on_ctrl_c())
        .await;
    printer.abort();

    if let Err(e) = session.close().await {
        debug!(error = %e, "Close failed");
    }

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Ping the endpoint and report the round trip.
pub async fn run_ping(args: &RemoteArgs, config: ClientConfig) -> anyhow::Result<()> {
    let session = connect(args, config).await?;
    let started = std::time::Instant::now();
    let result = session.ping().await;
    let elapsed = started.elapsed();
    if let Err(e) = session.close().await {
        debug!(error = %e, "Close failed");
    }
    result?;

    let server = session
        .server_info()
        .map(|info| format!("{} {}", info.server_info.name, info.server_info.version))
        .unwrap_or_default();
    println!("pong from {server} in {} ms", elapsed.as_millis());
    Ok(())
}

/// Print server notifications, one JSON object per line, until Ctrl+C.
pub async fn run_listen(args: &RemoteArgs, config: ClientConfig) -> anyhow::Result<()> {
    let session = connect(args, config).await?;
    let mut notifications = session.subscribe();
    let cancel = cancel_on_ctrl_c();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = notifications.recv() => match received {
                Ok(notification) => {
                    println!("{}", Message::Notification(notification).to_value());
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Dropped notifications");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.close().await?;
    Ok(())
}
