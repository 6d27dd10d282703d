//! Tool invocation: routing, validation, deadlines and retries.

use futures::FutureExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::CredentialManager;
use crate::bridge::InvokeCallback;
use crate::config::{InvocationConfig, RetryPolicy};
use crate::error::{MCPError, Result, TransportError};
use crate::protocol::methods;
use crate::session::Session;
use crate::tool::validate_arguments;

/// Sessions by server id, shared by the client and the gateway.
pub(crate) type SessionTable = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// One tool call as requested by the host.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRequest {
    /// Id carried through the logs of this call
    pub correlation_id: Uuid,
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// Overrides the configured default deadline
    pub deadline: Option<Duration>,
}

impl InvocationRequest {
    pub fn new(server_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            server_id: server_id.into(),
            tool_name: tool_name.into(),
            arguments,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Clone)]
pub(crate) struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    sessions: SessionTable,
    credentials: Arc<CredentialManager>,
    settings: InvocationConfig,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        sessions: SessionTable,
        credentials: Arc<CredentialManager>,
        settings: InvocationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                sessions,
                credentials,
                settings,
                shutdown,
            }),
        }
    }

    /// Callback handed to the registry bridge. Holds the gateway weakly so
    /// registered tools do not keep a shut-down client alive.
    pub fn callback(&self) -> InvokeCallback {
        let weak: Weak<GatewayInner> = Arc::downgrade(&self.inner);
        Arc::new(move |request: InvocationRequest| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => Gateway { inner }.execute(request).await,
                    None => Err(MCPError::ShuttingDown),
                }
            }
            .boxed()
        })
    }

    /// Runs one invocation under its deadline.
    pub async fn execute(&self, request: InvocationRequest) -> Result<Value> {
        let deadline = request
            .deadline
            .unwrap_or(self.inner.settings.default_deadline);

        info!(
            correlation_id = %request.correlation_id,
            server = %request.server_id,
            tool = %request.tool_name,
            "Invoking MCP tool"
        );

        let outcome = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(MCPError::ShuttingDown),
            result = tokio::time::timeout(deadline, self.invoke(&request)) => {
                result.unwrap_or_else(|_| Err(MCPError::Timeout {
                    tool: request.tool_name.clone(),
                    timeout_ms: deadline.as_millis() as u64,
                }))
            }
        };

        match &outcome {
            Ok(_) => debug!(correlation_id = %request.correlation_id, "Tool call succeeded"),
            Err(e) => warn!(correlation_id = %request.correlation_id, error = %e, "Tool call failed"),
        }
        outcome
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<Value> {
        let session = self
            .inner
            .sessions
            .read()
            .get(&request.server_id)
            .cloned()
            .ok_or_else(|| MCPError::NotFound {
                server: request.server_id.clone(),
                tool: None,
            })?;

        let state = session.state();
        let channel = match session.channel() {
            Some(channel) if state.accepts_invocations() => channel,
            _ => {
                return Err(MCPError::NotReady {
                    server: request.server_id.clone(),
                    state,
                });
            }
        };

        let tool = session
            .tool(&request.tool_name)
            .ok_or_else(|| MCPError::NotFound {
                server: request.server_id.clone(),
                tool: Some(request.tool_name.clone()),
            })?;

        validate_arguments(&tool.parameters, &request.arguments).map_err(|reason| {
            MCPError::Validation {
                tool: request.tool_name.clone(),
                reason,
            }
        })?;

        if session.config().auth_required {
            let token = self.inner.credentials.ensure_fresh(&request.server_id).await?;
            channel.set_bearer_token(token);
        }

        let arguments = if request.arguments.is_null() {
            json!({})
        } else {
            request.arguments.clone()
        };
        let params = json!({ "name": request.tool_name, "arguments": arguments });

        let retry = &self.inner.settings.retry;
        let mut attempt = 0;
        let response = loop {
            match channel.request(methods::TOOLS_CALL, Some(params.clone())).await {
                Ok(response) => break response,
                Err(e) if !e.sent && e.error.is_retriable() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt) + jitter(retry);
                    attempt += 1;
                    debug!(
                        correlation_id = %request.correlation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e.error,
                        "Retrying tool call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(self.transport_failure(request, e.error).await),
            }
        };

        let result = response.into_result().map_err(|e| MCPError::Application {
            code: Some(e.code),
            message: e.message,
            data: e.data,
        })?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(MCPError::Application {
                code: None,
                message: error_text(&result),
                data: Some(result),
            });
        }
        Ok(result)
    }

    async fn transport_failure(&self, request: &InvocationRequest, error: TransportError) -> MCPError {
        if !error.is_unauthorized() {
            return MCPError::transport(&request.server_id, error);
        }
        if let Err(e) = self.inner.credentials.invalidate(&request.server_id).await {
            warn!(server = %request.server_id, error = %e, "Failed to drop rejected credentials");
        }
        MCPError::AuthRequired {
            server: request.server_id.clone(),
        }
    }
}

fn jitter(retry: &RetryPolicy) -> Duration {
    let max = retry.max_jitter.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// Text of an `isError` tool result.
fn error_text(result: &Value) -> String {
    let text: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        "tool reported an error".to_string()
    } else {
        text.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_joins_content() {
        let result = json!({
            "isError": true,
            "content": [
                {"type": "text", "text": "file not found"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "path: /tmp/x"}
            ]
        });
        assert_eq!(error_text(&result), "file not found\npath: /tmp/x");
        assert_eq!(error_text(&json!({"isError": true})), "tool reported an error");
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            max_jitter: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            assert!(jitter(&policy) <= Duration::from_millis(10));
        }
        let none = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(jitter(&none), Duration::ZERO);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = InvocationRequest::new("s", "t", Value::Null);
        let b = InvocationRequest::new("s", "t", Value::Null);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(a.deadline.is_none());
    }
}
