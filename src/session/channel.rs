//! Request/response correlation over a transport.

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{MutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    methods,
};
use crate::transport::{Delivery, DynTransport};

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<JsonRpcResponse, TransportError>>>>>;

/// Something the dispatcher saw that the session must react to.
#[derive(Debug, Clone)]
pub(crate) enum ChannelEvent {
    /// Server notification
    Notification {
        generation: u64,
        notification: JsonRpcNotification,
    },
    /// The transport failed; every pending request has been failed too
    Failed {
        generation: u64,
        error: TransportError,
    },
}

/// Why a request did not produce a response.
#[derive(Debug, Clone)]
pub(crate) struct ChannelError {
    pub error: TransportError,
    /// Whether the frame was handed to the transport
    pub sent: bool,
}

/// Live connection to one server: a transport plus its correlation table.
pub(crate) struct RpcChannel {
    server_id: String,
    transport: DynTransport,
    pending: Pending,
    next_id: AtomicI64,
    generation: u64,
    /// Held for the whole exchange on request-only transports
    turn: Option<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Exclusive use of a request-only channel; `None` on push channels.
pub(crate) type Turn<'a> = Option<MutexGuard<'a, ()>>;

impl RpcChannel {
    /// Wraps `transport` and starts dispatching its inbound frames.
    pub fn new(
        server_id: &str,
        transport: DynTransport,
        generation: u64,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatch(
            server_id.to_string(),
            transport.clone(),
            pending.clone(),
            events,
            cancel.clone(),
            generation,
        ));

        let turn = match transport.delivery() {
            Delivery::RequestOnly => Some(tokio::sync::Mutex::new(())),
            Delivery::Push => None,
        };

        Self {
            server_id: server_id.to_string(),
            transport,
            pending,
            next_id: AtomicI64::new(1),
            generation,
            turn,
            cancel,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn delivery(&self) -> Delivery {
        self.transport.delivery()
    }

    pub fn set_bearer_token(&self, token: Option<String>) {
        self.transport.set_bearer_token(token);
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Waits until the channel may carry another request.
    ///
    /// Request-only transports carry one exchange at a time, so the returned
    /// guard must be held until the response arrives. Push channels never wait.
    pub async fn turn(&self) -> Turn<'_> {
        match &self.turn {
            Some(turn) => Some(turn.lock().await),
            None => None,
        }
    }

    /// Sends a request and waits for the matching response.
    ///
    /// Dropping the returned future removes the correlation entry, so a late
    /// response is discarded by the dispatcher.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, ChannelError> {
        let _turn = self.turn().await;
        self.request_in_turn(method, params).await
    }

    /// Like [`request`](Self::request) for a caller already holding [`turn`](Self::turn).
    pub async fn request_in_turn(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError {
                error: TransportError::Fatal("channel closed".to_string()),
                sent: false,
            });
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let _entry = PendingEntry {
            pending: &self.pending,
            id: id.clone(),
        };

        debug!(server = %self.server_id, %id, method, "Sending request");
        let frame = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));
        self.transport
            .send(frame)
            .await
            .map_err(|error| ChannelError { error, sent: false })?;

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(ChannelError { error, sent: true }),
            Err(_) => Err(ChannelError {
                error: TransportError::Fatal("channel closed".to_string()),
                sent: true,
            }),
        }
    }

    /// Sends a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        debug!(server = %self.server_id, method, "Sending notification");
        let frame = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        self.transport.send(frame).await
    }

    /// Stops dispatching, fails pending requests and closes the transport.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        fail_all(&self.pending, &TransportError::Fatal("channel closed".to_string()));
        self.transport.close().await
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

/// Removes a correlation entry when its request finishes or is dropped.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: RequestId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

fn fail_all(pending: &Pending, error: &TransportError) {
    let drained: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(error.clone()));
    }
}

async fn dispatch(
    server: String,
    transport: DynTransport,
    pending: Pending,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
    generation: u64,
) {
    let mut inbound = transport.receive();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(JsonRpcMessage::Response(response))) => {
                let waiter = pending.lock().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        debug!(server = %server, id = %response.id, "Discarding response with no pending request");
                    }
                }
            }
            Some(Ok(JsonRpcMessage::Notification(notification))) => {
                debug!(server = %server, method = %notification.method, "Received notification");
                let _ = events.send(ChannelEvent::Notification {
                    generation,
                    notification,
                });
            }
            Some(Ok(JsonRpcMessage::Request(request))) => {
                let reply = if request.method == methods::PING {
                    JsonRpcResponse::success(request.id, json!({}))
                } else {
                    debug!(server = %server, method = %request.method, "Rejecting server request");
                    JsonRpcResponse::failure(request.id, JsonRpcError::method_not_found(&request.method))
                };
                let transport = transport.clone();
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.send(JsonRpcMessage::Response(reply)).await {
                        debug!(server = %server, error = %e, "Failed to answer server request");
                    }
                });
            }
            Some(Err(error)) => {
                fail_all(&pending, &error);
                let _ = events.send(ChannelEvent::Failed { generation, error });
                return;
            }
            None => {
                let error = TransportError::Fatal("inbound stream ended".to_string());
                fail_all(&pending, &error);
                let _ = events.send(ChannelEvent::Failed { generation, error });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::transport::{Frame, FrameStream, InboundQueue, Transport};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Transport that answers every request with its own params.
    struct Loopback {
        inbound: InboundQueue,
        sent: Mutex<Vec<Frame>>,
        silent: bool,
        delivery: Delivery,
    }

    impl Loopback {
        fn new(silent: bool) -> Arc<Self> {
            Self::with_delivery(silent, Delivery::Push)
        }

        fn with_delivery(silent: bool, delivery: Delivery) -> Arc<Self> {
            Arc::new(Self {
                inbound: InboundQueue::new(),
                sent: Mutex::new(Vec::new()),
                silent,
                delivery,
            })
        }
    }

    #[async_trait]
    impl Transport for Loopback {
        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        fn delivery(&self) -> Delivery {
            self.delivery
        }

        async fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.sent.lock().push(frame.clone());
            if let JsonRpcMessage::Request(req) = frame {
                if !self.silent {
                    let result = req.params.unwrap_or(Value::Null);
                    self.inbound
                        .push(Ok(JsonRpcMessage::Response(JsonRpcResponse::success(req.id, result))));
                }
            }
            Ok(())
        }

        fn receive(&self) -> FrameStream {
            self.inbound.stream()
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.inbound.close();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_request_is_correlated() {
        let (events, _rx) = mpsc::unbounded_channel();
        let channel = RpcChannel::new("s", Loopback::new(false), 1, events);

        let response = channel.request("echo", Some(json!({"x": 1}))).await.unwrap();
        assert_eq!(response.result.unwrap()["x"], 1);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_leaves_no_entry() {
        let (events, _rx) = mpsc::unbounded_channel();
        let channel = RpcChannel::new("s", Loopback::new(true), 1, events);

        let waited = tokio::time::timeout(Duration::from_secs(1), channel.request("slow", None)).await;
        assert!(waited.is_err());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_only_channel_carries_one_exchange_at_a_time() {
        let (events, _rx) = mpsc::unbounded_channel();
        let channel = Arc::new(RpcChannel::new(
            "s",
            Loopback::with_delivery(true, Delivery::RequestOnly),
            1,
            events,
        ));

        let busy = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request("slow", None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(channel.pending_count(), 1);

        let waiting = tokio::time::timeout(Duration::from_secs(1), channel.turn()).await;
        assert!(waiting.is_err());

        busy.abort();
        let _ = busy.await;
        assert!(channel.turn().await.is_some());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_push_channel_never_waits_for_a_turn() {
        let (events, _rx) = mpsc::unbounded_channel();
        let channel = RpcChannel::new("s", Loopback::new(true), 1, events);

        let _first = channel.turn().await;
        assert!(channel.turn().await.is_none());
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (events, _rx) = mpsc::unbounded_channel();
        let transport = Loopback::new(true);
        let _channel = RpcChannel::new("s", transport.clone(), 1, events);

        transport
            .inbound
            .push(Ok(JsonRpcMessage::Request(JsonRpcRequest::new(99, methods::PING, None))));

        let mut reply = None;
        for _ in 0..50 {
            if let Some(frame) = transport.sent.lock().first().cloned() {
                reply = Some(frame);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let Some(JsonRpcMessage::Response(reply)) = reply else {
            panic!("ping was not answered");
        };
        assert_eq!(reply.id, RequestId::Number(99));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_stream_failure_fails_pending_and_reports() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let transport = Loopback::new(true);
        let channel = Arc::new(RpcChannel::new("s", transport.clone(), 7, events));

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request("never", None).await })
        };
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        transport
            .inbound
            .push(Err(TransportError::Fatal("process exited".into())));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.sent);
        assert!(matches!(err.error, TransportError::Fatal(_)));
        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::Failed { generation: 7, .. })
        ));
    }
}
