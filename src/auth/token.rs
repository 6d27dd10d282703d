use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// Expiry assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Longest lifetime accepted from a token endpoint (ten years).
const MAX_EXPIRES_IN: u64 = 10 * 365 * 24 * 3600;

/// An access token and what is needed to renew it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthToken {
    /// Whether the token expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = TimeDelta::from_std(margin).unwrap_or(TimeDelta::MAX);
        self.expires_at
            .checked_sub_signed(margin)
            .is_none_or(|deadline| deadline <= Utc::now())
    }
}

/// Successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Converts to a stored token; a missing refresh token keeps `previous_refresh`.
    pub fn into_token(self, previous_refresh: Option<String>) -> OAuthToken {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN).min(MAX_EXPIRES_IN);
        let now = Utc::now();
        let expires_at = i64::try_from(expires_in)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        OAuthToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at,
            scope: self.scope,
        }
    }
}

/// Token persistence, keyed by server id.
///
/// Encryption at rest is up to the implementation.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_token(&self, server_id: &str) -> Result<Option<OAuthToken>>;
    async fn set_token(&self, server_id: &str, token: OAuthToken) -> Result<()>;
    async fn delete_token(&self, server_id: &str) -> Result<()>;
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    tokens: RwLock<HashMap<String, OAuthToken>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_token(&self, server_id: &str) -> Result<Option<OAuthToken>> {
        Ok(self.tokens.read().get(server_id).cloned())
    }

    async fn set_token(&self, server_id: &str, token: OAuthToken) -> Result<()> {
        self.tokens.write().insert(server_id.to_string(), token);
        Ok(())
    }

    async fn delete_token(&self, server_id: &str) -> Result<()> {
        self.tokens.write().remove(server_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in_secs: i64) -> OAuthToken {
        OAuthToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
            scope: None,
        }
    }

    #[test]
    fn test_expiry_margin() {
        let margin = Duration::from_secs(60);
        assert!(token(30).expires_within(margin));
        assert!(token(-5).expires_within(margin));
        assert!(!token(600).expires_within(margin));
    }

    #[test]
    fn test_refresh_token_is_kept_when_omitted() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"new","token_type":"Bearer"}"#).unwrap();
        let token = response.into_token(Some("old-refresh".into()));
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
        assert!(!token.expires_within(Duration::from_secs(3000)));
    }

    #[test]
    fn test_huge_expires_in_is_capped() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"new","expires_in":20000000000000}"#,
        )
        .unwrap();
        let token = response.into_token(None);

        let lifetime = token.expires_at - Utc::now();
        assert!(lifetime <= TimeDelta::seconds(MAX_EXPIRES_IN as i64));
        assert!(lifetime > TimeDelta::days(365));
        assert!(!token.expires_within(Duration::from_secs(60)));

        let response: TokenResponse =
            serde_json::from_str(&format!(r#"{{"access_token":"new","expires_in":{}}}"#, u64::MAX)).unwrap();
        assert!(!response.into_token(None).expires_within(Duration::from_secs(60)));
    }

    #[test]
    fn test_far_future_expiry_with_huge_margin() {
        let token = OAuthToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: DateTime::<Utc>::MAX_UTC,
            scope: None,
        };
        assert!(!token.expires_within(Duration::from_secs(60)));
        assert!(token.expires_within(Duration::MAX));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        assert!(store.get_token("s").await.unwrap().is_none());
        store.set_token("s", token(100)).await.unwrap();
        assert_eq!(store.get_token("s").await.unwrap().unwrap().access_token, "a");
        store.delete_token("s").await.unwrap();
        assert!(store.get_token("s").await.unwrap().is_none());
    }
}
