//! Transport adapters.
//!
//! Every adapter exposes the same contract (`send`, `receive`, `close`) and
//! declares its delivery semantics through [`Delivery`]:
//!
//! - **stdio**: newline-delimited JSON-RPC over a child process's pipes
//! - **sse**: a long-lived event stream inbound, one POST per outbound frame
//! - **http**: one POST per frame, the response body is the reply
//!
//! Inbound frames of every adapter flow through an [`InboundQueue`], so the
//! session reads them the same way regardless of where they came from.

pub mod http;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use crate::config::{ServerConfig, TransportConfig, TransportKind};
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// A single JSON-RPC frame.
pub type Frame = JsonRpcMessage;

/// Inbound frames; ends after the first error or once the transport closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Largest frame accepted from a server.
pub(crate) const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// How a transport delivers server messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Server may send frames at any time; many exchanges may be in flight
    Push,
    /// Server frames only arrive as replies; one exchange at a time
    RequestOnly,
}

impl Delivery {
    /// Whether server-initiated notifications can reach the client.
    pub fn supports_push(self) -> bool {
        matches!(self, Delivery::Push)
    }
}

/// Uniform channel contract implemented by every transport variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which personality this transport is.
    fn kind(&self) -> TransportKind;

    /// Delivery semantics, consulted by the session.
    fn delivery(&self) -> Delivery;

    /// Sends one frame.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Returns the inbound frame stream.
    ///
    /// Dropping the stream loses nothing; calling `receive` again resumes
    /// where the previous stream stopped.
    fn receive(&self) -> FrameStream;

    /// Sets the bearer token attached to outgoing HTTP requests.
    fn set_bearer_token(&self, _token: Option<String>) {}

    /// Closes the transport and releases its resources.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Shared type alias for a transport trait object.
pub type DynTransport = Arc<dyn Transport>;

/// Buffer of inbound frames shared by a transport's reader and its consumers.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    tx: Arc<parking_lot::Mutex<Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Result<Frame, TransportError>>>>,
}

impl InboundQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Arc::new(parking_lot::Mutex::new(Some(tx))),
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Handle used by reader tasks to push frames; `None` once closed.
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<Result<Frame, TransportError>>> {
        self.tx.lock().clone()
    }

    /// Pushes one frame. Returns false when the queue is closed.
    pub fn push(&self, item: Result<Frame, TransportError>) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Stops accepting frames; the stream ends once buffered frames drain
    /// and every outstanding sender is dropped.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Stream over the queued frames.
    pub fn stream(&self) -> FrameStream {
        let rx = self.rx.clone();
        Box::pin(async_stream::stream! {
            loop {
                let next = { rx.lock().await.recv().await };
                match next {
                    Some(Ok(frame)) => yield Ok(frame),
                    Some(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                    None => break,
                }
            }
        })
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens transports for server configs.
///
/// The client goes through this seam so hosts and tests can substitute their
/// own channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a transport for `config`, attaching `bearer` to HTTP requests.
    async fn open(
        &self,
        config: &ServerConfig,
        bearer: Option<String>,
    ) -> Result<DynTransport, TransportError>;
}

/// Connector for the three built-in transports.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl DefaultConnector {
    /// Creates a connector sharing one HTTP client across servers.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            connect_timeout,
        }
    }

    /// Uses a caller-provided HTTP client.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(
        &self,
        config: &ServerConfig,
        bearer: Option<String>,
    ) -> Result<DynTransport, TransportError> {
        open(config, &self.http, bearer, self.connect_timeout).await
    }
}

/// Opens the transport described by `config`.
pub async fn open(
    config: &ServerConfig,
    http: &reqwest::Client,
    bearer: Option<String>,
    connect_timeout: Duration,
) -> Result<DynTransport, TransportError> {
    match &config.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            let transport =
                StdioTransport::spawn(&config.id, command, args, env, cwd.as_deref()).await?;
            Ok(Arc::new(transport))
        }
        TransportConfig::Sse { url, headers } => {
            let transport = SseTransport::connect(
                &config.id,
                http.clone(),
                url,
                headers,
                bearer,
                connect_timeout,
            )
            .await?;
            Ok(Arc::new(transport))
        }
        TransportConfig::Http { url, headers } => {
            let transport = HttpTransport::new(&config.id, http.clone(), url, headers, bearer)?;
            Ok(Arc::new(transport))
        }
    }
}

/// Converts configured header pairs into a `HeaderMap`.
pub(crate) fn header_map(
    headers: &std::collections::HashMap<String, String>,
) -> Result<reqwest::header::HeaderMap, TransportError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Fatal(format!("invalid header name '{name}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| TransportError::Fatal(format!("invalid header value for '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;
    use futures::StreamExt;

    fn note(method: &str) -> Frame {
        JsonRpcMessage::Notification(JsonRpcNotification::new(method, None))
    }

    #[tokio::test]
    async fn test_inbound_stream_is_restartable() {
        let queue = InboundQueue::new();
        assert!(queue.push(Ok(note("a"))));
        assert!(queue.push(Ok(note("b"))));

        let mut first = queue.stream();
        assert_eq!(first.next().await.unwrap().unwrap().method(), Some("a"));
        drop(first);

        let mut second = queue.stream();
        assert_eq!(second.next().await.unwrap().unwrap().method(), Some("b"));
    }

    #[tokio::test]
    async fn test_inbound_stream_ends_after_error_and_close() {
        let queue = InboundQueue::new();
        queue.push(Err(TransportError::Fatal("gone".into())));
        let mut stream = queue.stream();
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());

        queue.close();
        assert!(!queue.push(Ok(note("late"))));
        let mut stream = queue.stream();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_header_map_rejects_bad_names() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&headers).is_err());
    }
}
