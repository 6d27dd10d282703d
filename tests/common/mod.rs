//! In-process MCP server double shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use simple_mcp::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, methods,
};
use simple_mcp::transport::{Connector, Delivery, DynTransport, Frame, FrameStream, InboundQueue, Transport};
use simple_mcp::{
    ClientConfig, InvokeCallback, MCPClient, RegistryBridge, ServerConfig, ToolDefinition,
    TransportError, TransportKind,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Answers a `tools/call`; `None` leaves the request unanswered.
pub type CallHandler = Arc<dyn Fn(&str, &Value) -> Option<Result<Value, JsonRpcError>> + Send + Sync>;

pub struct FakeServer {
    tools: Mutex<Vec<Value>>,
    capabilities: Mutex<Value>,
    handler: Mutex<CallHandler>,
    unresponsive: AtomicBool,
    refuse_sends: AtomicU32,
    refuse_opens: AtomicBool,
    ping_delay: Mutex<Duration>,
    received: Mutex<Vec<String>>,
    opens: Mutex<Vec<Instant>>,
    current: Mutex<Option<InboundQueue>>,
    bearer: Mutex<Option<String>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(vec![echo_tool()]),
            capabilities: Mutex::new(json!({ "tools": { "listChanged": true } })),
            handler: Mutex::new(Arc::new(echo_handler) as CallHandler),
            unresponsive: AtomicBool::new(false),
            refuse_sends: AtomicU32::new(0),
            refuse_opens: AtomicBool::new(false),
            ping_delay: Mutex::new(Duration::ZERO),
            received: Mutex::new(Vec::new()),
            opens: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            bearer: Mutex::new(None),
        })
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock() = tools;
    }

    pub fn set_capabilities(&self, capabilities: Value) {
        *self.capabilities.lock() = capabilities;
    }

    pub fn on_call(&self, handler: CallHandler) {
        *self.handler.lock() = handler;
    }

    /// Stops answering requests; frames are still counted.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Fails the next `n` request sends as if the connection was refused.
    pub fn refuse_next_sends(&self, n: u32) {
        self.refuse_sends.store(n, Ordering::SeqCst);
    }

    pub fn set_refuse_opens(&self, refuse: bool) {
        self.refuse_opens.store(refuse, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock() = delay;
    }

    /// Number of requests received for `method`.
    pub fn received(&self, method: &str) -> usize {
        self.received.lock().iter().filter(|m| *m == method).count()
    }

    /// When each transport was opened, refused ones included.
    pub fn opens(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }

    /// Bearer token the client attached most recently.
    pub fn bearer(&self) -> Option<String> {
        self.bearer.lock().clone()
    }

    /// Breaks the live connection.
    pub fn crash(&self) {
        if let Some(queue) = self.current.lock().as_ref() {
            queue.push(Err(TransportError::Fatal("server process exited".to_string())));
        }
    }

    /// Pushes a notification over the live connection.
    pub fn notify(&self, method: &str) {
        if let Some(queue) = self.current.lock().as_ref() {
            queue.push(Ok(JsonRpcMessage::Notification(JsonRpcNotification::new(method, None))));
        }
    }

    fn respond(&self, request: JsonRpcRequest) -> Option<(Duration, JsonRpcResponse)> {
        let id = request.id.clone();
        let reply = |result: Value| Some((Duration::ZERO, JsonRpcResponse::success(id.clone(), result)));

        match request.method.as_str() {
            methods::INITIALIZE => reply(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": self.capabilities.lock().clone(),
                "serverInfo": { "name": "fake", "version": "1.0.0" }
            })),
            methods::PING => Some((*self.ping_delay.lock(), JsonRpcResponse::success(id.clone(), json!({})))),
            methods::TOOLS_LIST => reply(json!({ "tools": self.tools.lock().clone() })),
            methods::TOOLS_CALL => {
                let params = request.params.unwrap_or(Value::Null);
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let handler = self.handler.lock().clone();
                match handler(&name, &params["arguments"])? {
                    Ok(result) => reply(result),
                    Err(error) => Some((Duration::ZERO, JsonRpcResponse::failure(id.clone(), error))),
                }
            }
            other => Some((
                Duration::ZERO,
                JsonRpcResponse::failure(id.clone(), JsonRpcError::method_not_found(other)),
            )),
        }
    }
}

pub fn echo_tool() -> Value {
    json!({
        "name": "echo",
        "description": "Echo text",
        "inputSchema": {
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        }
    })
}

pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("The {name} tool"),
        "inputSchema": { "type": "object", "properties": {} }
    })
}

fn echo_handler(name: &str, args: &Value) -> Option<Result<Value, JsonRpcError>> {
    match name {
        "echo" => Some(Ok(json!({
            "content": [{ "type": "text", "text": args["text"].clone() }]
        }))),
        other => Some(Err(JsonRpcError::new(-32602, format!("unknown tool '{other}'")))),
    }
}

struct FakeTransport {
    server: Arc<FakeServer>,
    inbound: InboundQueue,
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let request = match frame {
            JsonRpcMessage::Request(request) => request,
            JsonRpcMessage::Notification(note) => {
                self.server.received.lock().push(note.method);
                return Ok(());
            }
            JsonRpcMessage::Response(_) => return Ok(()),
        };

        let refused = self
            .server
            .refuse_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Retriable("connection refused".to_string()));
        }

        self.server.received.lock().push(request.method.clone());
        if self.server.unresponsive.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some((delay, response)) = self.server.respond(request) {
            let inbound = self.inbound.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                inbound.push(Ok(JsonRpcMessage::Response(response)));
            });
        }
        Ok(())
    }

    fn receive(&self) -> FrameStream {
        self.inbound.stream()
    }

    fn set_bearer_token(&self, token: Option<String>) {
        *self.server.bearer.lock() = token;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inbound.close();
        Ok(())
    }
}

pub struct FakeConnector {
    server: Arc<FakeServer>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        _config: &ServerConfig,
        bearer: Option<String>,
    ) -> Result<DynTransport, TransportError> {
        self.server.opens.lock().push(Instant::now());
        *self.server.bearer.lock() = bearer;
        if self.server.refuse_opens.load(Ordering::SeqCst) {
            return Err(TransportError::Retriable("connection refused".to_string()));
        }

        let inbound = InboundQueue::new();
        *self.server.current.lock() = Some(inbound.clone());
        Ok(Arc::new(FakeTransport {
            server: self.server.clone(),
            inbound,
        }))
    }
}

/// Bridge that remembers what it was told.
#[derive(Default)]
pub struct RecordingBridge {
    pub registrations: Mutex<Vec<(String, Vec<String>)>>,
    pub unregistrations: Mutex<Vec<String>>,
    pub invoke: Mutex<Option<InvokeCallback>>,
}

impl RegistryBridge for RecordingBridge {
    fn register_tools(&self, server_id: &str, tools: Vec<ToolDefinition>, invoke: InvokeCallback) {
        let names = tools.into_iter().map(|t| t.name).collect();
        self.registrations.lock().push((server_id.to_string(), names));
        *self.invoke.lock() = Some(invoke);
    }

    fn unregister_tools(&self, server_id: &str) {
        self.unregistrations.lock().push(server_id.to_string());
    }
}

pub fn server_config(id: &str) -> ServerConfig {
    ServerConfig::stdio(id, "fake-server", vec![])
}

pub fn connector(server: &Arc<FakeServer>) -> Arc<dyn Connector> {
    Arc::new(FakeConnector {
        server: server.clone(),
    })
}

pub fn client(server: &Arc<FakeServer>, config: ClientConfig) -> (MCPClient, Arc<RecordingBridge>) {
    let bridge = Arc::new(RecordingBridge::default());
    let client = MCPClient::builder()
        .with_config(config)
        .with_connector(connector(server))
        .with_registry(bridge.clone())
        .build();
    (client, bridge)
}
