//! Event-stream transport: server frames arrive as `message` events on a
//! long-lived GET, client frames are POSTed to the endpoint the server
//! announces in its first `endpoint` event.

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{Delivery, Frame, FrameStream, InboundQueue, MAX_FRAME_BYTES, Transport, header_map};
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name, `message` when the server sent none
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id, if any
    pub id: Option<String>,
}

/// Incremental `text/event-stream` line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator). Returns an event when the
    /// line was the blank line that ends it.
    pub fn feed(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

pub(crate) type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, TransportError>> + Send>>;

/// Turns a streaming response body into parsed events.
pub(crate) fn event_stream(response: reqwest::Response) -> EventStream {
    let body = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
    let mut lines = FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
    );

    Box::pin(async_stream::stream! {
        let mut parser = SseParser::new();
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if let Some(event) = parser.feed(&line) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(TransportError::Fatal(format!("event stream read failed: {e}")));
                    return;
                }
            }
        }
        // A trailing event without its blank line still counts.
        if let Some(event) = parser.feed("") {
            yield Ok(event);
        }
    })
}

/// Parses the data of a `message` event and pushes its frames.
pub(crate) fn push_message(server: &str, inbound: &InboundQueue, data: &str) -> bool {
    match JsonRpcMessage::parse_batch(data) {
        Ok(frames) => frames.into_iter().all(|frame| inbound.push(Ok(frame))),
        Err(e) => {
            warn!(server = %server, error = %e, "Malformed frame in event stream");
            inbound.push(Err(TransportError::Fatal(format!("malformed frame: {e}"))));
            false
        }
    }
}

/// Transport over a server-sent event stream.
pub struct SseTransport {
    server_id: String,
    http: Client,
    endpoint: Url,
    headers: HeaderMap,
    bearer: Arc<RwLock<Option<String>>>,
    inbound: InboundQueue,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Opens the event stream and waits for the server's `endpoint` event.
    pub async fn connect(
        server_id: &str,
        http: Client,
        url: &str,
        headers: &HashMap<String, String>,
        bearer: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base = Url::parse(url)
            .map_err(|e| TransportError::Fatal(format!("invalid url '{url}': {e}")))?;
        let headers = header_map(headers)?;

        debug!(server = %server_id, url = %base, "Opening event stream");

        let mut request = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = &bearer {
            request = request.bearer_auth(token);
        }

        let response = tokio::time::timeout(connect_timeout, request.send())
            .await
            .map_err(|_| TransportError::Retriable(format!("timed out connecting to {base}")))?
            .map_err(|e| TransportError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, &body));
        }

        let mut events = event_stream(response);
        let announced = tokio::time::timeout(connect_timeout, async {
            while let Some(event) = events.next().await {
                let event = event?;
                if event.event == "endpoint" {
                    return Ok(event.data);
                }
                debug!(server = %server_id, event = %event.event, "Ignoring event before endpoint");
            }
            Err(TransportError::Fatal(
                "event stream closed before the endpoint event".to_string(),
            ))
        })
        .await
        .map_err(|_| TransportError::Fatal("server never announced its endpoint".to_string()))??;

        let endpoint = base.join(announced.trim()).map_err(|e| {
            TransportError::Fatal(format!("invalid endpoint '{announced}': {e}"))
        })?;
        debug!(server = %server_id, endpoint = %endpoint, "Event stream ready");

        let inbound = InboundQueue::new();
        let reader = tokio::spawn(read_events(server_id.to_string(), events, inbound.clone()));

        Ok(Self {
            server_id: server_id.to_string(),
            http,
            endpoint,
            headers,
            bearer: Arc::new(RwLock::new(bearer)),
            inbound,
            reader: parking_lot::Mutex::new(Some(reader)),
        })
    }

    /// Endpoint client frames are POSTed to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

async fn read_events(server: String, mut events: EventStream, inbound: InboundQueue) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) if event.event == "message" => {
                if !push_message(&server, &inbound, &event.data) {
                    return;
                }
            }
            Ok(event) => {
                debug!(server = %server, event = %event.event, "Ignoring event");
            }
            Err(e) => {
                inbound.push(Err(e));
                return;
            }
        }
    }
    debug!(server = %server, "Event stream ended");
    inbound.push(Err(TransportError::Fatal("event stream closed".to_string())));
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(&frame);
        if let Some(token) = self.bearer.read().clone() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, &body));
        }

        // Most servers answer 202 and reply on the stream; some reply inline.
        let inline_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if inline_json {
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::Fatal(format!("failed to read response: {e}")))?;
            if !body.trim().is_empty() {
                push_message(&self.server_id, &self.inbound, &body);
            }
        }
        Ok(())
    }

    fn receive(&self) -> FrameStream {
        self.inbound.stream()
    }

    fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer.write() = token;
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.inbound.close();
        debug!(server = %self.server_id, "Event stream closed");
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut SseParser, lines: &[&str]) -> Vec<SseEvent> {
        lines.iter().filter_map(|line| parser.feed(line)).collect()
    }

    #[test]
    fn test_parses_named_event() {
        let mut parser = SseParser::new();
        let events = feed_all(&mut parser, &["event: endpoint", "data: /messages?s=1", ""]);
        assert_eq!(
            events,
            vec![SseEvent {
                event: "endpoint".into(),
                data: "/messages?s=1".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_default_event_name_and_multiline_data() {
        let mut parser = SseParser::new();
        let events = feed_all(&mut parser, &["data: {\"a\":", "data: 1}", "id: 42", ""]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"a\":\n1}");
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn test_comments_and_empty_events_are_skipped() {
        let mut parser = SseParser::new();
        let events = feed_all(&mut parser, &[": keepalive", "", "event: ping", "", "data:x", ""]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_push_message_rejects_garbage() {
        let inbound = InboundQueue::new();
        assert!(!push_message("s", &inbound, "not json"));
        assert!(push_message(
            "s",
            &inbound,
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#
        ));
    }
}
