//! Process-pipe transport: newline-delimited JSON-RPC over a child's stdio.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use super::{Delivery, Frame, FrameStream, InboundQueue, MAX_FRAME_BYTES, Transport};
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;

/// Grace period for the child to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Transport over a spawned MCP server process.
pub struct StdioTransport {
    server_id: String,
    writer: Mutex<Option<FramedWrite<ChildStdin, LinesCodec>>>,
    child: Arc<Mutex<Child>>,
    inbound: InboundQueue,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawns the server process and starts reading its output.
    pub async fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, TransportError> {
        debug!(server = %server_id, command, ?args, "Starting MCP server");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Fatal(format!("failed to start '{command}': {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Fatal("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Fatal("failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(child));
        let inbound = InboundQueue::new();
        let mut tasks = Vec::new();

        let reader = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        tasks.push(tokio::spawn(read_frames(
            server_id.to_string(),
            reader,
            inbound.clone(),
            child.clone(),
        )));

        if let Some(stderr) = stderr {
            let server = server_id.to_string();
            tasks.push(tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
                while let Some(Ok(line)) = lines.next().await {
                    debug!(server = %server, stderr = %line, "MCP server stderr");
                }
            }));
        }

        Ok(Self {
            server_id: server_id.to_string(),
            writer: Mutex::new(Some(FramedWrite::new(stdin, LinesCodec::new()))),
            child,
            inbound,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }
}

/// Reads stdout until EOF, pushing every JSON-RPC frame onto `inbound`.
async fn read_frames(
    server: String,
    mut reader: FramedRead<tokio::process::ChildStdout, LinesCodec>,
    inbound: InboundQueue,
    child: Arc<Mutex<Child>>,
) {
    while let Some(line) = reader.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                inbound.push(Err(TransportError::Fatal(format!(
                    "failed to read from stdout: {e}"
                ))));
                return;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Servers sometimes log to stdout; only lines that look like JSON are frames.
        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
            debug!(server = %server, line = %trimmed, "Skipping non-JSON line");
            continue;
        }

        match JsonRpcMessage::parse_batch(trimmed) {
            Ok(frames) => {
                for frame in frames {
                    if !inbound.push(Ok(frame)) {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Malformed frame from MCP server");
                inbound.push(Err(TransportError::Fatal(format!("malformed frame: {e}"))));
                return;
            }
        }
    }

    let status = match child.lock().await.try_wait() {
        Ok(Some(status)) => status.to_string(),
        _ => "stdout closed".to_string(),
    };
    debug!(server = %server, %status, "MCP server stdout closed");
    inbound.push(Err(TransportError::Fatal(format!(
        "server process exited ({status})"
    ))));
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let line = serde_json::to_string(&frame)
            .map_err(|e| TransportError::Fatal(format!("failed to serialize frame: {e}")))?;

        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| TransportError::Fatal("transport closed".to_string()))?;

        writer.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => {
                TransportError::Fatal(format!("failed to write to stdin: {e}"))
            }
            LinesCodecError::MaxLineLengthExceeded => {
                TransportError::Fatal("frame too large".to_string())
            }
        })
    }

    fn receive(&self) -> FrameStream {
        self.inbound.stream()
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping stdin tells a well-behaved server to exit.
        self.writer.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(server = %self.server_id, %status, "MCP server exited"),
            _ => {
                debug!(server = %self.server_id, "Killing MCP server");
                let _ = child.kill().await;
            }
        }
        drop(child);

        self.inbound.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
