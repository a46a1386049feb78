use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::Method;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use pboard_core::auth::AuthState;
use pboard_core::backend::ApiResponse;
use pboard_core::deeplink::DeepLinkRouter;
use pboard_core::provider::HttpIdentityProvider;
use pboard_core::session::SessionManager;
use pboard_core::stats::StatsService;
use pboard_core::token_store::TokenStore;
use pboard_core::usage::UsageTracker;

use crate::events::{AppEvent, EventHub};

/// Everything the bridge handlers need, shared across requests.
#[derive(Clone)]
pub struct AppContext {
    pub auth: AuthState,
    pub provider: Arc<HttpIdentityProvider>,
    pub sessions: Arc<SessionManager>,
    pub stats: Arc<StatsService>,
    pub usage: Arc<UsageTracker>,
    pub deeplinks: Arc<DeepLinkRouter>,
    pub tokens: TokenStore,
    pub events: EventHub,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct DeepLinkRequest {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct EndSessionRequest {
    #[serde(default)]
    session_id: Option<String>,
}

/// All channel handlers resolve to the `{data?, error?}` envelope; a UI call
/// never sees a rejected request, only an `error` field.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/ipc/health", get(health_handler))
        .route("/ipc/deep-link", post(deep_link_handler))
        .route("/ipc/auth", get(auth_snapshot_handler))
        .route("/ipc/auth/url", post(authorize_url_handler))
        .route("/ipc/sign-out", post(sign_out_handler))
        .route("/ipc/start-app-session", post(start_session_handler))
        .route("/ipc/end-app-session", post(end_session_handler))
        .route("/ipc/stats", get(stats_handler))
        .route("/ipc/events", get(events_handler))
        .with_state(ctx)
        .layer(cors)
}

pub async fn serve(listener: TcpListener, ctx: AppContext) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "IPC bridge listening");
    axum::serve(listener, build_router(ctx)).await?;
    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Deep links land here from two directions: the OS handler relaunching us,
/// and a rejected second instance forwarding its argv.
async fn deep_link_handler(
    State(ctx): State<AppContext>,
    Json(request): Json<DeepLinkRequest>,
) -> Json<ApiResponse> {
    ctx.deeplinks.handle_url(request.url);
    Json(ApiResponse::ok(Value::Null))
}

async fn auth_snapshot_handler(State(ctx): State<AppContext>) -> Json<ApiResponse> {
    let snapshot = ctx.auth.snapshot();
    Json(ApiResponse::ok(json!({
        "signed_in": snapshot.session.is_some(),
        "user_id": snapshot.session.as_ref().map(|s| s.user_id.clone()),
        "error": snapshot.error,
        "loading": snapshot.loading,
    })))
}

async fn authorize_url_handler(State(ctx): State<AppContext>) -> Json<ApiResponse> {
    let request = ctx.provider.authorization_url();
    Json(ApiResponse::ok(json!({
        "url": request.url,
        "state": request.state,
    })))
}

async fn start_session_handler(State(ctx): State<AppContext>) -> Json<ApiResponse> {
    let Some(session) = ctx.auth.session() else {
        return Json(ApiResponse::err("not signed in"));
    };

    match ctx.sessions.start_active_session(&session.access_token).await {
        Ok(app_session) => {
            ctx.events
                .publish(AppEvent::session_changed(Some(app_session.session_id.clone())));
            Json(ApiResponse::ok(json!({
                "session_id": app_session.session_id,
                "started_at": app_session.started_at,
            })))
        }
        Err(err) => Json(ApiResponse::err(err.to_string())),
    }
}

async fn end_session_handler(
    State(ctx): State<AppContext>,
    Json(request): Json<EndSessionRequest>,
) -> Json<ApiResponse> {
    match (request.session_id, ctx.auth.session()) {
        (Some(session_id), Some(session)) => {
            ctx.sessions
                .end_app_session(&session.access_token, &session_id)
                .await;
        }
        _ => ctx.sessions.end_active_session().await,
    }
    ctx.events.publish(AppEvent::session_changed(None));
    Json(ApiResponse::ok(Value::Null))
}

async fn stats_handler(State(ctx): State<AppContext>) -> Json<ApiResponse> {
    let Some(session) = ctx.auth.session() else {
        return Json(ApiResponse::err("not signed in"));
    };

    match ctx
        .stats
        .refresh(&session.access_token, &session.user_id)
        .await
    {
        Ok(snapshot) => Json(ApiResponse::ok(json!({
            "stats": snapshot.data,
            "total_app_time": snapshot.total_minutes,
            "elapsed_seconds": snapshot.elapsed_seconds,
        }))),
        Err(err) => Json(ApiResponse::err(err.to_string())),
    }
}

/// Composite sign-out: end the tracked session, stop and clear the usage
/// counter key, drop the stored refresh token, then clear the auth state.
async fn sign_out_handler(State(ctx): State<AppContext>) -> Json<ApiResponse> {
    let Some(session) = ctx.auth.session() else {
        return Json(ApiResponse::ok(Value::Null));
    };

    ctx.sessions.end_active_session().await;
    ctx.usage.sign_out(&session.user_id);
    ctx.tokens.delete_best_effort(&session.user_id);
    ctx.auth.clear();

    ctx.events.publish(AppEvent::session_changed(None));
    ctx.events.publish(AppEvent::auth_changed(false));
    info!(user_id = %session.user_id, "signed out");
    Json(ApiResponse::ok(Value::Null))
}

async fn events_handler(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(ctx.events.subscribe()).filter_map(|event| match event {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default().event("app-event").data(data))),
            Err(err) => {
                warn!(%err, "failed to encode app event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "event subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use pboard_core::auth::AuthSession;
    use pboard_core::backend::Backend;
    use pboard_core::config::IdentityConfig;
    use pboard_core::session::TokioScheduler;
    use pboard_core::usage::UsageStore;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeBackend {
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn paths(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn request(
            &self,
            _method: reqwest::Method,
            path: &str,
            _token: &str,
            _body: Option<Value>,
        ) -> ApiResponse {
            self.calls.lock().unwrap().push(path.to_string());
            if path == "/app-session/start" {
                return ApiResponse::ok(json!({"session_id": "sess-1"}));
            }
            if path == "/stats" {
                return ApiResponse::ok(json!({"total_app_time": 30}));
            }
            ApiResponse::ok(Value::Null)
        }
    }

    fn signed_in_session() -> AuthSession {
        AuthSession {
            user_id: "user-1".to_string(),
            access_token: "tok-a".to_string(),
            refresh_token: String::new(),
            expires_at: Some(Utc::now()),
        }
    }

    fn context(dir: &tempfile::TempDir) -> (AppContext, Arc<FakeBackend>) {
        let backend = FakeBackend::new();
        let usage = Arc::new(UsageTracker::new(UsageStore::at(dir.path().to_path_buf())));
        let ctx = AppContext {
            auth: AuthState::new(),
            provider: Arc::new(HttpIdentityProvider::new(IdentityConfig::default())),
            sessions: Arc::new(SessionManager::new(
                backend.clone(),
                Arc::new(TokioScheduler),
            )),
            stats: Arc::new(StatsService::new(backend.clone(), usage.clone())),
            usage,
            deeplinks: Arc::new(DeepLinkRouter::new()),
            tokens: TokenStore::new(),
            events: EventHub::new(),
        };
        (ctx, backend)
    }

    #[tokio::test]
    async fn deep_link_handler_routes_into_the_router() {
        let dir = tempdir().unwrap();
        let (ctx, _backend) = context(&dir);

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        ctx.deeplinks.set_callback(Arc::new(move |url| {
            sink.lock().unwrap().push(url);
        }));

        let response = deep_link_handler(
            State(ctx),
            Json(DeepLinkRequest {
                url: "pulseboard://auth/callback?code=1".to_string(),
            }),
        )
        .await;

        assert!(!response.0.is_err());
        assert_eq!(
            delivered.lock().unwrap().as_slice(),
            ["pulseboard://auth/callback?code=1"]
        );
    }

    #[tokio::test]
    async fn start_session_requires_sign_in() {
        let dir = tempdir().unwrap();
        let (ctx, backend) = context(&dir);

        let response = start_session_handler(State(ctx)).await;
        assert_eq!(response.0.error.as_deref(), Some("not signed in"));
        assert!(backend.paths().is_empty());
    }

    #[tokio::test]
    async fn start_session_returns_id_and_publishes_event() {
        let dir = tempdir().unwrap();
        let (ctx, _backend) = context(&dir);
        ctx.auth.set_session(signed_in_session());
        let mut events = ctx.events.subscribe();

        let response = start_session_handler(State(ctx)).await;
        let data = response.0.data.unwrap();
        assert_eq!(data["session_id"], "sess-1");

        match events.recv().await.unwrap() {
            AppEvent::SessionChanged { session_id, .. } => {
                assert_eq!(session_id.as_deref(), Some("sess-1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_session_without_id_ends_the_active_one() {
        let dir = tempdir().unwrap();
        let (ctx, backend) = context(&dir);
        ctx.auth.set_session(signed_in_session());

        start_session_handler(State(ctx.clone())).await;
        let response =
            end_session_handler(State(ctx.clone()), Json(EndSessionRequest::default())).await;

        assert!(!response.0.is_err());
        assert!(ctx.sessions.active_session().await.is_none());
        assert!(backend.paths().contains(&"/app-session/sess-1/end".to_string()));
    }

    #[tokio::test]
    async fn stats_folds_backend_minutes_into_elapsed_seconds() {
        let dir = tempdir().unwrap();
        let (ctx, _backend) = context(&dir);
        ctx.auth.set_session(signed_in_session());

        let response = stats_handler(State(ctx)).await;
        let data = response.0.data.unwrap();
        assert_eq!(data["total_app_time"], 30);
        assert_eq!(data["elapsed_seconds"], 1800);
    }

    #[tokio::test]
    async fn sign_out_ends_session_and_clears_auth() {
        let dir = tempdir().unwrap();
        let (ctx, backend) = context(&dir);
        ctx.auth.set_session(signed_in_session());
        start_session_handler(State(ctx.clone())).await;

        let response = sign_out_handler(State(ctx.clone())).await;

        assert!(!response.0.is_err());
        assert!(ctx.auth.session().is_none());
        assert!(ctx.sessions.active_session().await.is_none());
        assert!(backend.paths().contains(&"/app-session/sess-1/end".to_string()));
    }

    #[tokio::test]
    async fn sign_out_when_signed_out_is_a_noop() {
        let dir = tempdir().unwrap();
        let (ctx, backend) = context(&dir);

        let response = sign_out_handler(State(ctx)).await;
        assert!(!response.0.is_err());
        assert!(backend.paths().is_empty());
    }

    #[tokio::test]
    async fn authorize_url_carries_pkce_challenge() {
        let dir = tempdir().unwrap();
        let (ctx, _backend) = context(&dir);

        let response = authorize_url_handler(State(ctx)).await;
        let data = response.0.data.unwrap();
        let url = data["url"].as_str().unwrap();
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
    }

    #[tokio::test]
    async fn auth_snapshot_reflects_state() {
        let dir = tempdir().unwrap();
        let (ctx, _backend) = context(&dir);

        let response = auth_snapshot_handler(State(ctx.clone())).await;
        let data = response.0.data.unwrap();
        assert_eq!(data["signed_in"], false);

        ctx.auth.set_session(signed_in_session());
        let response = auth_snapshot_handler(State(ctx)).await;
        let data = response.0.data.unwrap();
        assert_eq!(data["signed_in"], true);
        assert_eq!(data["user_id"], "user-1");
    }
}
