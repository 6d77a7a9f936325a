//! mcpwire - MCP over streamable HTTP.
//!
//! This is the main entry point for the mcpwire CLI: a demo server and a
//! small client for poking at MCP endpoints.

mod commands;

use clap::{Parser, Subcommand};
use commands::*;
use mcpwire_mcp::Config;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcpwire")]
#[command(author, version, about = "MCP over streamable HTTP", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo MCP server
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1:3000")]
        address: SocketAddr,
        /// Endpoint path
        #[arg(long, default_value = mcpwire_mcp::DEFAULT_MCP_PATH)]
        path: String,
        /// Reject requests with a missing or wrong MCP-Protocol-Version header
        #[arg(long)]
        strict_version: bool,
        /// Require this bearer token
        #[arg(long)]
        api_key: Option<String>,
        /// Answer GET with 405 instead of opening a standalone stream
        #[arg(long)]
        no_standalone: bool,
    },
    /// Call a method and print its result
    Call {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Method name (e.g., tools/list)
        method: String,
        /// JSON params
        #[arg(short, long)]
        params: Option<String>,
    },
    /// Ping an endpoint
    Ping {
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Print server notifications until interrupted
    Listen {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load_optional(cli.config.as_deref()).await?;

    init_logging(cli.verbose, config.log_level);

    match cli.command {
        Commands::Serve {
            address,
            path,
            strict_version,
            api_key,
            no_standalone,
        } => {
            let args = ServeArgs {
                address,
                path,
                strict_version,
                api_key,
                no_standalone,
            };
            run_server(args, config.server).await
        }
        Commands::Call {
            remote,
            method,
            params,
        } => run_call(&remote, config.client, &method, params.as_deref()).await,
        Commands::Ping { remote } => run_ping(&remote, config.client).await,
        Commands::Listen { remote } => run_listen(&remote, config.client).await,
    }
}
