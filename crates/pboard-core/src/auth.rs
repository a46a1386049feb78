use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::provider::IdentityProvider;

/// OAuth session shared read-only with every component that needs a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the shared authentication state.
#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub session: Option<AuthSession>,
    pub error: Option<String>,
    pub loading: bool,
}

/// Shared reactive authentication state.
///
/// Cheap to clone; all clones observe the same snapshot.
#[derive(Clone, Default)]
pub struct AuthState {
    inner: Arc<RwLock<AuthSnapshot>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.read().clone()
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.read().session.clone()
    }

    pub fn set_session(&self, session: AuthSession) {
        let mut guard = self.write();
        guard.session = Some(session);
        guard.error = None;
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.write().error = Some(message.into());
    }

    /// Sign-out: drop the session and any stale error.
    pub fn clear(&self) {
        let mut guard = self.write();
        guard.session = None;
        guard.error = None;
    }

    fn set_loading(&self, loading: bool) {
        self.write().loading = loading;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AuthSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AuthSnapshot> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the `loading` flag when dropped, so every exit path (success,
/// provider error, panic) leaves the state consistent.
struct LoadingGuard<'a>(&'a AuthState);

impl<'a> LoadingGuard<'a> {
    fn engage(state: &'a AuthState) -> Self {
        state.set_loading(true);
        Self(state)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_loading(false);
    }
}

/// How a delivered callback URL was classified and handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Session replaced after a successful provider exchange.
    SignedIn,
    /// Error surfaced to the shared state; no exchange attempted or it failed.
    Failed,
    /// Not an auth callback at all; no state change.
    Ignored,
}

/// Resolves delivered deep-link URLs into OAuth sessions.
pub struct AuthResolver {
    provider: Arc<dyn IdentityProvider>,
    state: AuthState,
}

impl AuthResolver {
    pub fn new(provider: Arc<dyn IdentityProvider>, state: AuthState) -> Self {
        Self { provider, state }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Classify and resolve one callback URL.
    ///
    /// Error signals win over both flows, checked in strict precedence:
    /// query `error_description`, query `error`, fragment `error_description`,
    /// fragment `error`. A URL carrying neither an error nor `code` nor
    /// `access_token` is ignored; not every deep link is an auth callback.
    pub async fn resolve_callback(&self, raw: &str) -> CallbackOutcome {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(err) => {
                warn!(%err, "unparseable auth callback");
                self.state.set_error("Authentication failed");
                return CallbackOutcome::Failed;
            }
        };

        let fragment_pairs = parse_fragment(&url);

        if let Some(message) = query_param(&url, "error_description")
            .or_else(|| query_param(&url, "error"))
            .or_else(|| fragment_param(&fragment_pairs, "error_description"))
            .or_else(|| fragment_param(&fragment_pairs, "error"))
        {
            warn!(error = %message, "identity provider reported an error");
            self.state.set_error(message);
            return CallbackOutcome::Failed;
        }

        if let Some(code) = query_param(&url, "code") {
            let _loading = LoadingGuard::engage(&self.state);
            debug!("resolving callback via code exchange");
            return match self.provider.exchange_code(&code).await {
                Ok(session) => {
                    info!(user_id = %session.user_id, "signed in via code exchange");
                    self.state.set_session(session);
                    CallbackOutcome::SignedIn
                }
                Err(err) => {
                    warn!(%err, "code exchange failed");
                    self.state.set_error(err.to_string());
                    CallbackOutcome::Failed
                }
            };
        }

        if let Some(access_token) = fragment_param(&fragment_pairs, "access_token") {
            let refresh_token =
                fragment_param(&fragment_pairs, "refresh_token").unwrap_or_default();
            let _loading = LoadingGuard::engage(&self.state);
            debug!("resolving callback via token fragment");
            return match self
                .provider
                .session_from_tokens(&access_token, &refresh_token)
                .await
            {
                Ok(session) => {
                    info!(user_id = %session.user_id, "signed in via token fragment");
                    self.state.set_session(session);
                    CallbackOutcome::SignedIn
                }
                Err(err) => {
                    warn!(%err, "token-fragment sign-in failed");
                    self.state.set_error(err.to_string());
                    CallbackOutcome::Failed
                }
            };
        }

        debug!(url = %raw, "deep link carried no auth payload; ignoring");
        CallbackOutcome::Ignored
    }
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn parse_fragment(url: &Url) -> Vec<(String, String)> {
    let Some(fragment) = url.fragment() else {
        return Vec::new();
    };
    url::form_urlencoded::parse(fragment.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn fragment_param(pairs: &[(String, String)], name: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}
