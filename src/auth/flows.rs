//! Token endpoint exchanges for the supported OAuth2 grants.

use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;

use super::token::TokenResponse;
use crate::config::OAuthConfig;

/// Failure talking to an authorization server.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// The endpoint could not be reached or answered garbage
    #[error("{0}")]
    Http(String),
    /// The endpoint answered with an OAuth error code
    #[error("{error}{}", description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    OAuth {
        error: String,
        description: Option<String>,
    },
}

impl FlowError {
    /// The OAuth error code, if the endpoint sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            FlowError::OAuth { error, .. } => Some(error),
            FlowError::Http(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Response of the device authorization endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default = "default_device_expiry")]
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_device_expiry() -> u64 {
    600
}

fn default_poll_interval() -> u64 {
    5
}

/// Builds the browser URL for the authorization code grant.
pub fn authorization_url(
    oauth: &OAuthConfig,
    challenge: &str,
    state: &str,
) -> Result<Url, FlowError> {
    let endpoint = oauth
        .authorization_endpoint
        .as_deref()
        .ok_or_else(|| FlowError::Http("no authorization endpoint configured".to_string()))?;

    let mut params = vec![
        ("response_type", "code".to_string()),
        ("client_id", oauth.client_id.clone()),
        ("code_challenge", challenge.to_string()),
        ("code_challenge_method", "S256".to_string()),
        ("state", state.to_string()),
    ];
    if let Some(redirect) = &oauth.redirect_uri {
        params.push(("redirect_uri", redirect.clone()));
    }
    if let Some(scope) = oauth.scope() {
        params.push(("scope", scope));
    }

    Url::parse_with_params(endpoint, &params)
        .map_err(|e| FlowError::Http(format!("invalid authorization endpoint '{endpoint}': {e}")))
}

/// Exchanges an authorization code and its PKCE verifier for a token.
pub async fn exchange_code(
    http: &Client,
    oauth: &OAuthConfig,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse, FlowError> {
    let mut form = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("code_verifier", verifier.to_string()),
        ("client_id", oauth.client_id.clone()),
    ];
    if let Some(redirect) = &oauth.redirect_uri {
        form.push(("redirect_uri", redirect.clone()));
    }
    if let Some(secret) = &oauth.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    post_form(http, &oauth.token_endpoint, &form).await
}

/// Uses a refresh token.
pub async fn refresh(
    http: &Client,
    oauth: &OAuthConfig,
    refresh_token: &str,
) -> Result<TokenResponse, FlowError> {
    let mut form = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token.to_string()),
        ("client_id", oauth.client_id.clone()),
    ];
    if let Some(secret) = &oauth.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    post_form(http, &oauth.token_endpoint, &form).await
}

/// Client credentials grant.
pub async fn client_credentials(
    http: &Client,
    oauth: &OAuthConfig,
) -> Result<TokenResponse, FlowError> {
    let mut form = vec![
        ("grant_type", "client_credentials".to_string()),
        ("client_id", oauth.client_id.clone()),
        ("client_secret", oauth.client_secret.clone().unwrap_or_default()),
    ];
    if let Some(scope) = oauth.scope() {
        form.push(("scope", scope));
    }
    post_form(http, &oauth.token_endpoint, &form).await
}

/// Starts a device authorization.
pub async fn request_device_code(
    http: &Client,
    oauth: &OAuthConfig,
) -> Result<DeviceAuthorization, FlowError> {
    let endpoint = oauth
        .device_authorization_endpoint
        .as_deref()
        .ok_or_else(|| FlowError::Http("no device authorization endpoint configured".to_string()))?;

    let mut form = vec![("client_id", oauth.client_id.clone())];
    if let Some(scope) = oauth.scope() {
        form.push(("scope", scope));
    }
    post_form(http, endpoint, &form).await
}

/// Polls once for the token of a pending device authorization.
pub async fn poll_device_token(
    http: &Client,
    oauth: &OAuthConfig,
    device_code: &str,
) -> Result<TokenResponse, FlowError> {
    let form = vec![
        ("grant_type", "urn:ietf:params:oauth:grant-type:device_code".to_string()),
        ("device_code", device_code.to_string()),
        ("client_id", oauth.client_id.clone()),
    ];
    post_form(http, &oauth.token_endpoint, &form).await
}

async fn post_form<T: serde::de::DeserializeOwned>(
    http: &Client,
    endpoint: &str,
    form: &[(&str, String)],
) -> Result<T, FlowError> {
    let response = http
        .post(endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| FlowError::Http(format!("request to {endpoint} failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| FlowError::Http(format!("failed to read response from {endpoint}: {e}")))?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => FlowError::OAuth {
                error: err.error,
                description: err.error_description,
            },
            Err(_) => FlowError::Http(format!("{endpoint} returned {status}: {body}")),
        });
    }

    serde_json::from_str(&body)
        .map_err(|e| FlowError::Http(format!("malformed response from {endpoint}: {e}")))
}
