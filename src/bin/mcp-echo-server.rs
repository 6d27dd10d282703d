//! Minimal stdio MCP server used for manual testing and integration tests.
//!
//! Tools:
//! - `echo`: returns its `text` argument
//! - `sleep`: waits `ms` milliseconds before answering
//! - `fail`: answers with an `isError` result carrying `message`

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use simple_mcp::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, error_codes,
    methods,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut input = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut output = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());

    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = serde_json::to_string(&message)?;
            output.send(line).await?;
        }
        anyhow::Ok(())
    });

    info!("echo server started");

    while let Some(line) = input.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message = match JsonRpcMessage::parse(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame");
                continue;
            }
        };

        match message {
            JsonRpcMessage::Request(request) if request.method == methods::SHUTDOWN => break,
            JsonRpcMessage::Request(request) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = handle(request).await;
                    let _ = tx.send(JsonRpcMessage::Response(response));
                });
            }
            JsonRpcMessage::Notification(note) if note.method == methods::SHUTDOWN => break,
            JsonRpcMessage::Notification(note) => debug!(method = %note.method, "notification"),
            JsonRpcMessage::Response(_) => {}
        }
    }

    drop(tx);
    writer.await??;
    info!("echo server stopped");
    Ok(())
}

async fn handle(request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        methods::INITIALIZE => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "mcp-echo-server", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        methods::PING => JsonRpcResponse::success(id, json!({})),
        methods::TOOLS_LIST => JsonRpcResponse::success(id, json!({ "tools": tools() })),
        methods::TOOLS_CALL => match call(request.params.unwrap_or(Value::Null)).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        },
        other => JsonRpcResponse::failure(id, JsonRpcError::method_not_found(other)),
    }
}

fn tools() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Echo the given text",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        },
        {
            "name": "sleep",
            "description": "Wait before answering",
            "inputSchema": {
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
                "required": ["ms"]
            }
        },
        {
            "name": "fail",
            "description": "Always report a tool error",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } }
            }
        }
    ])
}

async fn call(params: Value) -> Result<Value, JsonRpcError> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(json!({
                "echo": text,
                "content": [{ "type": "text", "text": text }]
            }))
        }
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "content": [{ "type": "text", "text": format!("slept {ms}ms") }] }))
        }
        "fail" => {
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("failure requested");
            Ok(json!({
                "isError": true,
                "content": [{ "type": "text", "text": message }]
            }))
        }
        other => Err(JsonRpcError::new(
            error_codes::INVALID_PARAMS,
            format!("unknown tool '{other}'"),
        )),
    }
}
