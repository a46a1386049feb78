use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::auth::AuthSession;
use crate::config::IdentityConfig;

/// Errors surfaced by identity-provider exchanges.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{operation} failed{}: {detail}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    OAuth {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[error("{0}")]
    Protocol(String),
}

/// Identity-provider contract consumed by the auth flow resolver.
///
/// `exchange_code` backs the PKCE flow; `session_from_tokens` backs the
/// implicit flow where the callback already carries the tokens.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<AuthSession, ProviderError>;

    async fn session_from_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<AuthSession, ProviderError>;
}

/// Generate an OAuth2 PKCE code verifier and its S256 challenge.
pub fn generate_pkce_pair() -> (String, String) {
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use rand::RngCore;
    use sha2::{Digest, Sha256};

    let mut verifier_bytes = [0u8; 32];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut verifier_bytes);
    let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let code_challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    (code_verifier, code_challenge)
}

/// Random `state` parameter for the authorization round-trip.
pub fn generate_state() -> String {
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Browser-bound authorization URL plus the state to verify on callback.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
}

/// Production identity-provider client.
///
/// The PKCE verifier generated by [`authorization_url`] is held in a
/// single-slot buffer until the matching `exchange_code` consumes it.
///
/// [`authorization_url`]: HttpIdentityProvider::authorization_url
pub struct HttpIdentityProvider {
    config: IdentityConfig,
    http: reqwest::Client,
    pending_verifier: Mutex<Option<String>>,
}

impl HttpIdentityProvider {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            pending_verifier: Mutex::new(None),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Build the authorization URL and stash the PKCE verifier for the
    /// eventual code exchange. A new call replaces any pending verifier.
    pub fn authorization_url(&self) -> AuthorizationRequest {
        let (verifier, challenge) = generate_pkce_pair();
        let state = generate_state();

        let params = [
            ("response_type", "code"),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", state.as_str()),
        ];
        let query = params
            .into_iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}?{query}", self.config.authorize_url);

        *self
            .pending_verifier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(verifier);

        AuthorizationRequest { url, state }
    }

    fn take_verifier(&self) -> Option<String> {
        self.pending_verifier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn fetch_user_id(&self, access_token: &str) -> Result<String, ProviderError> {
        let response = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = ensure_success(response, "userinfo request").await?;
        let info = response.json::<UserInfo>().await?;
        Ok(info.sub)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn exchange_code(&self, code: &str) -> Result<AuthSession, ProviderError> {
        let verifier = self.take_verifier().ok_or_else(|| {
            ProviderError::Protocol("no pending PKCE authorization for this callback".to_string())
        })?;

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier.as_str()),
        ];

        debug!(token_url = %self.config.token_url, "exchanging authorization code");
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        let response = ensure_success(response, "token exchange").await?;
        let tokens = response.json::<TokenResponse>().await?;

        let user_id = self.fetch_user_id(&tokens.access_token).await?;
        let expires_at = tokens
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));

        Ok(AuthSession {
            user_id,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.unwrap_or_default(),
            expires_at,
        })
    }

    async fn session_from_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<AuthSession, ProviderError> {
        let user_id = self.fetch_user_id(access_token).await?;
        Ok(AuthSession {
            user_id,
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at: None,
        })
    }
}

/// Checks HTTP response status; returns the response on success or an error
/// with details.
async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, ProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let detail = response.text().await.unwrap_or_default();
    Err(ProviderError::OAuth {
        operation,
        status: Some(status),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> IdentityConfig {
        IdentityConfig::default()
    }

    #[test]
    fn pkce_pair_is_nonempty_and_distinct() {
        let (verifier, challenge) = generate_pkce_pair();
        assert!(!verifier.is_empty());
        assert!(!challenge.is_empty());
        assert_ne!(verifier, challenge);
    }

    #[test]
    fn authorization_url_contains_pkce_params() {
        let provider = HttpIdentityProvider::new(test_config());
        let request = provider.authorization_url();

        assert!(request.url.contains("response_type=code"));
        assert!(request.url.contains("code_challenge="));
        assert!(request.url.contains("code_challenge_method=S256"));
        assert!(request.url.contains(&format!("state={}", request.state)));
    }

    #[test]
    fn authorization_url_is_unique_per_call() {
        let provider = HttpIdentityProvider::new(test_config());
        let first = provider.authorization_url();
        let second = provider.authorization_url();
        assert_ne!(first.state, second.state);
        assert_ne!(first.url, second.url);
    }

    #[test]
    fn verifier_slot_is_single_use() {
        let provider = HttpIdentityProvider::new(test_config());
        let _ = provider.authorization_url();
        assert!(provider.take_verifier().is_some());
        assert!(provider.take_verifier().is_none());
    }
}
