//! Request/response transport: every frame is one POST and the reply comes
//! back in that POST's body.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, StatusCode, Url};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::sse::{event_stream, push_message};
use super::{Delivery, Frame, FrameStream, InboundQueue, Transport, header_map};
use crate::config::TransportKind;
use crate::error::TransportError;

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Transport over plain HTTP exchanges.
///
/// Exchanges are serialized: a frame is only sent once the previous reply has
/// been read in full.
pub struct HttpTransport {
    server_id: String,
    http: Client,
    url: Url,
    headers: HeaderMap,
    bearer: Arc<RwLock<Option<String>>>,
    session_id: RwLock<Option<String>>,
    exchange: tokio::sync::Mutex<()>,
    inbound: InboundQueue,
}

impl HttpTransport {
    pub fn new(
        server_id: &str,
        http: Client,
        url: &str,
        headers: &HashMap<String, String>,
        bearer: Option<String>,
    ) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::Fatal(format!("invalid url '{url}': {e}")))?;

        Ok(Self {
            server_id: server_id.to_string(),
            http,
            url,
            headers: header_map(headers)?,
            bearer: Arc::new(RwLock::new(bearer)),
            session_id: RwLock::new(None),
            exchange: tokio::sync::Mutex::new(()),
            inbound: InboundQueue::new(),
        })
    }

    /// Session id assigned by the server, once one has been seen.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(method, self.url.clone())
            .headers(self.headers.clone());
        if let Some(token) = self.bearer.read().clone() {
            request = request.bearer_auth(token);
        }
        if let Some(session) = self.session_id.read().clone() {
            request = request.header(SESSION_ID_HEADER, session);
        }
        request
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn delivery(&self) -> Delivery {
        Delivery::RequestOnly
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let _exchange = self.exchange.lock().await;

        let response = self
            .request(reqwest::Method::POST)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&frame)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(session) {
                debug!(server = %self.server_id, session, "Server assigned session id");
                *current = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, &body));
        }
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let streamed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        if streamed {
            let mut events = event_stream(response);
            while let Some(event) = events.next().await {
                let event = event?;
                if event.event == "message" && !push_message(&self.server_id, &self.inbound, &event.data) {
                    break;
                }
            }
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Fatal(format!("failed to read response: {e}")))?;
        if !body.trim().is_empty() {
            push_message(&self.server_id, &self.inbound, &body);
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
        // Servers that issued a session id expect it to be released.
        if self.session_id().is_some() {
            let released = self.request(reqwest::Method::DELETE).send().await;
            if let Err(e) = released {
                debug!(server = %self.server_id, error = %e, "Failed to release HTTP session");
            }
        }
        self.inbound.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcMessage, JsonRpcRequest};
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ping(id: i64) -> Frame {
        JsonRpcMessage::Request(JsonRpcRequest::new(id, "ping", None))
    }

    #[tokio::test]
    async fn test_reply_body_is_pushed_inbound() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_ID_HEADER, "abc")
                    .set_body_raw(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("h", Client::new(), &server.uri(), &HashMap::new(), None).unwrap();
        let mut inbound = transport.receive();
        transport.send(ping(1)).await.unwrap();

        let reply = inbound.next().await.unwrap().unwrap();
        assert!(matches!(reply, JsonRpcMessage::Response(_)));
        assert_eq!(transport.session_id().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_session_id_is_echoed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(SESSION_ID_HEADER, "abc"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).insert_header(SESSION_ID_HEADER, "abc"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("h", Client::new(), &server.uri(), &HashMap::new(), None).unwrap();
        transport.send(ping(1)).await.unwrap();
        transport.send(ping(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_event_stream_reply() {
        let server = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{\"ok\":true}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("h", Client::new(), &server.uri(), &HashMap::new(), None).unwrap();
        let mut inbound = transport.receive();
        transport.send(ping(5)).await.unwrap();

        let JsonRpcMessage::Response(reply) = inbound.next().await.unwrap().unwrap() else {
            panic!("expected response");
        };
        assert_eq!(reply.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_bearer_token_is_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("h", Client::new(), &server.uri(), &HashMap::new(), None).unwrap();
        transport.set_bearer_token(Some("t0k".into()));
        transport.send(ping(1)).await.unwrap();
    }
}
