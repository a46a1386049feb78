use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// The `{data?, error?}` envelope every backend channel resolves to.
///
/// Boundary calls never reject; transport and HTTP-status failures are folded
/// into the `error` field so callers handle one shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Narrow contract over the authenticated REST backend.
///
/// Everything else in the client (entity CRUD included) goes through this same
/// call; the session lifecycle and stats code only ever see the envelope.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<Value>,
    ) -> ApiResponse;
}

/// Production backend speaking HTTPS with bearer-token auth.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn request(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<Value>,
    ) -> ApiResponse {
        let url = self.endpoint(path);
        debug!(%method, %url, "backend request");

        let mut builder = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return ApiResponse::err(format!("request to {url} failed: {err}")),
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return ApiResponse::err(format!("{url} returned {status}: {detail}"));
        }

        match response.text().await {
            Ok(text) if text.trim().is_empty() => ApiResponse::ok(Value::Null),
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => ApiResponse::ok(value),
                Err(err) => ApiResponse::err(format!("{url} returned unparseable body: {err}")),
            },
            Err(err) => ApiResponse::err(format!("failed to read response from {url}: {err}")),
        }
    }
}
