use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;

/// Default self-renewal interval for a backend-tracked app session.
pub const SESSION_RENEWAL_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);

/// Future handed to a [`Scheduler`] for delayed execution.
pub type ScheduledTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to an armed delayed task.
pub struct CancelToken {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CancelToken {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Cancel the pending task. Safe to call after the task has fired.
    pub fn cancel(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Delayed-execution seam so tests can drive timers deterministically.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> CancelToken;
}

/// Production scheduler backed by the tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> CancelToken {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        CancelToken::new(handle)
    }
}

/// Backend-tracked record of one continuous period of application usage.
#[derive(Debug, Clone)]
pub struct AppSession {
    pub session_id: String,
    pub owner_token: String,
    pub started_at: DateTime<Utc>,
}

/// Where the manager currently sits in the renewal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Active,
    Renewing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session start failed: {0}")]
    Start(String),
    #[error("session start response carried no session id")]
    MissingId,
}

struct SessionSlot {
    active: Option<AppSession>,
    timer: Option<CancelToken>,
    lifecycle: LifecycleState,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            active: None,
            timer: None,
            lifecycle: LifecycleState::Idle,
        }
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Owns the at-most-one-active app session and its self-renewal timer.
///
/// All starts and ends serialize behind one async mutex so that an end
/// racing a start can never leave two sessions recorded on the backend.
pub struct SessionManager {
    backend: Arc<dyn Backend>,
    scheduler: Arc<dyn Scheduler>,
    renewal_after: Duration,
    slot: AsyncMutex<SessionSlot>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn Backend>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_renewal_interval(backend, scheduler, SESSION_RENEWAL_INTERVAL)
    }

    pub fn with_renewal_interval(
        backend: Arc<dyn Backend>,
        scheduler: Arc<dyn Scheduler>,
        renewal_after: Duration,
    ) -> Self {
        Self {
            backend,
            scheduler,
            renewal_after,
            slot: AsyncMutex::new(SessionSlot::new()),
        }
    }

    /// Start a backend-tracked session for `token`, first fully ending any
    /// session that is already active. On success the renewal timer is armed;
    /// on failure no session is recorded and the next start is unaffected.
    pub async fn start_active_session(
        self: &Arc<Self>,
        token: &str,
    ) -> Result<AppSession, SessionError> {
        let mut slot = self.slot.lock().await;
        if slot.active.is_some() {
            debug!("ending previous app session before starting a new one");
            self.end_locked(&mut slot).await;
        }

        let response = self
            .backend
            .request(Method::POST, "/app-session/start", token, None)
            .await;

        if let Some(error) = response.error {
            return Err(SessionError::Start(error));
        }

        let session_id = response
            .data
            .as_ref()
            .and_then(|data| data.get("session_id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or(SessionError::MissingId)?;

        let session = AppSession {
            session_id,
            owner_token: token.to_string(),
            started_at: Utc::now(),
        };

        info!(session_id = %session.session_id, "app session started");
        slot.active = Some(session.clone());
        slot.lifecycle = LifecycleState::Active;
        slot.disarm_timer();
        slot.timer = Some(self.arm_renewal());

        Ok(session)
    }

    /// End the active session, if any. Idempotent; backend failures are
    /// logged and swallowed; ending is always best-effort.
    pub async fn end_active_session(self: &Arc<Self>) {
        let mut slot = self.slot.lock().await;
        self.end_locked(&mut slot).await;
    }

    /// Channel-level end request carrying a session id from the UI layer.
    ///
    /// When a session is currently active it is ended even if its id differs
    /// from `requested_session_id`: the backend tracks one session per user,
    /// so a stale id from the UI still refers to "my session". The mismatch
    /// is logged so the assumption stays visible.
    pub async fn end_app_session(self: &Arc<Self>, token: &str, requested_session_id: &str) {
        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.active.as_ref() {
            if active.session_id != requested_session_id {
                warn!(
                    requested = %requested_session_id,
                    current = %active.session_id,
                    "end request id does not match the active session; ending the active one"
                );
            }
            self.end_locked(&mut slot).await;
            return;
        }
        drop(slot);

        let response = self
            .backend
            .request(
                Method::POST,
                &format!("/app-session/{requested_session_id}/end"),
                token,
                None,
            )
            .await;
        if let Some(error) = response.error {
            warn!(%error, session_id = %requested_session_id, "direct session end failed");
        }
    }

    /// Current session, if one is active.
    pub async fn active_session(&self) -> Option<AppSession> {
        self.slot.lock().await.active.clone()
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        self.slot.lock().await.lifecycle
    }

    /// Whether a renewal timer is armed. Exactly zero or one timer exists at
    /// any instant.
    pub async fn renewal_armed(&self) -> bool {
        self.slot.lock().await.timer.is_some()
    }

    async fn end_locked(&self, slot: &mut SessionSlot) {
        slot.disarm_timer();

        let Some(session) = slot.active.take() else {
            slot.lifecycle = LifecycleState::Idle;
            return;
        };

        let response = self
            .backend
            .request(
                Method::POST,
                &format!("/app-session/{}/end", session.session_id),
                &session.owner_token,
                None,
            )
            .await;
        if let Some(error) = response.error {
            warn!(%error, session_id = %session.session_id, "best-effort session end failed");
        } else {
            info!(session_id = %session.session_id, "app session ended");
        }

        slot.lifecycle = LifecycleState::Idle;
    }

    fn arm_renewal(self: &Arc<Self>) -> CancelToken {
        let manager = Arc::downgrade(self);
        self.scheduler.schedule(
            self.renewal_after,
            Box::pin(async move {
                if let Some(manager) = manager.upgrade() {
                    manager.renew().await;
                }
            }),
        )
    }

    /// Timer-driven `Active -> Renewing -> Active` transition: capture the
    /// owner token, fully end the current session, then start a fresh one
    /// with the same token.
    async fn renew(self: Arc<Self>) {
        let owner_token = {
            let mut slot = self.slot.lock().await;
            slot.lifecycle = LifecycleState::Renewing;
            // The timer that woke this task has already fired; drop the
            // handle without cancelling it, or the abort would cut down the
            // renewal itself at its next await point.
            slot.timer.take();
            slot.active.as_ref().map(|s| s.owner_token.clone())
        };

        self.end_active_session().await;

        let Some(token) = owner_token else {
            return;
        };
        if let Err(err) = self.start_active_session(&token).await {
            warn!(%err, "session renewal failed; no session is active");
        }
    }
}
