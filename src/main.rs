//! # mcp-probe
//!
//! Connects to one MCP server, lists its tools and optionally calls one.
//!
//! ```bash
//! # stdio server
//! mcp-probe --command npx --args @modelcontextprotocol/server-filesystem --args /tmp
//!
//! # SSE or HTTP server, calling a tool
//! mcp-probe --url http://127.0.0.1:8000/sse --sse --call query --arguments '{"sql": "select 1"}'
//! ```

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::Value;
use simple_mcp::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// MCP server probe
#[derive(Parser, Debug)]
#[command(name = "mcp-probe", version)]
struct Args {
    /// Server id used in logs and tool names
    #[arg(long, default_value = "server")]
    name: String,

    /// Connect via command (stdio transport)
    #[arg(long, conflicts_with = "url")]
    command: Option<String>,

    /// Arguments for the command
    #[arg(long, requires = "command")]
    args: Vec<String>,

    /// Connect via URL
    #[arg(long)]
    url: Option<String>,

    /// Treat the URL as an event-stream endpoint instead of plain HTTP
    #[arg(long, requires = "url")]
    sse: bool,

    /// Tool to call after discovery
    #[arg(long)]
    call: Option<String>,

    /// JSON arguments for the tool call
    #[arg(long, default_value = "{}", requires = "call")]
    arguments: String,

    /// Deadline for the tool call, in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Print the final server status as JSON
    #[arg(long)]
    status: bool,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        match (&self.command, &self.url) {
            (Some(command), None) => Ok(ServerConfig::stdio(&self.name, command, self.args.clone())),
            (None, Some(url)) if self.sse => Ok(ServerConfig::sse(&self.name, url)),
            (None, Some(url)) => Ok(ServerConfig::http(&self.name, url)),
            _ => bail!("pass exactly one of --command or --url"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.server_config()?;

    let client = MCPClient::builder().build();

    println!("Connecting to MCP server '{}'...", args.name);
    client.connect(config).await?;
    println!("Connected!");

    let tools = client.tools(&args.name)?;
    println!("\nAvailable tools ({}):", tools.len());
    for tool in &tools {
        println!("  - {}: {}", tool.name, tool.description);
    }

    if let Some(tool) = &args.call {
        let arguments: Value =
            serde_json::from_str(&args.arguments).context("--arguments must be valid JSON")?;
        println!("\nCalling '{tool}'...");
        match client
            .execute(&args.name, tool, arguments, Some(Duration::from_secs(args.timeout)))
            .await
        {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            Err(e) => println!("Error: {e}"),
        }
    }

    if args.status {
        let status = client.status(&args.name)?;
        println!("\n{}", serde_json::to_string_pretty(&status)?);
    }

    client.shutdown().await;
    Ok(())
}
