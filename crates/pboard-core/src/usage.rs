use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::config_directory;
use crate::session::CancelToken;

const USAGE_DIR: &str = "usage";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedUsage {
    seconds: u64,
}

/// Crash-resilient per-user elapsed-seconds store: one JSON file per user
/// under the config directory.
#[derive(Debug, Clone)]
pub struct UsageStore {
    dir: PathBuf,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::at(config_directory().join(USAGE_DIR))
    }

    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_key(user_id)))
    }

    pub fn load(&self, user_id: &str) -> Option<u64> {
        let raw = match fs::read_to_string(self.path_for(user_id)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(%err, user_id, "failed to read persisted usage counter");
                return None;
            }
        };
        match serde_json::from_str::<PersistedUsage>(&raw) {
            Ok(persisted) => Some(persisted.seconds),
            Err(err) => {
                warn!(%err, user_id, "persisted usage counter was unparseable");
                None
            }
        }
    }

    pub fn save(&self, user_id: &str, seconds: u64) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let encoded = serde_json::to_string(&PersistedUsage { seconds })
            .map_err(|err| io::Error::other(err.to_string()))?;
        fs::write(self.path_for(user_id), encoded)
    }

    pub fn remove(&self, user_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(user_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Default for UsageStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn an arbitrary user id into a safe file stem.
fn file_key(user_id: &str) -> String {
    let mut key = String::with_capacity(user_id.len());
    let mut previous_dash = false;
    for ch in user_id.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            key.push(lower);
            previous_dash = false;
        } else if !previous_dash {
            key.push('-');
            previous_dash = true;
        }
    }
    if key.is_empty() {
        "user".to_string()
    } else {
        key
    }
}

struct TrackerState {
    user_id: Option<String>,
    seconds: u64,
    ticker: Option<CancelToken>,
}

/// Per-user elapsed-time counter, ticking once per second and reconciled
/// monotonically against backend-reported totals.
pub struct UsageTracker {
    store: Arc<UsageStore>,
    state: Arc<Mutex<TrackerState>>,
}

impl UsageTracker {
    pub fn new(store: UsageStore) -> Self {
        Self {
            store: Arc::new(store),
            state: Arc::new(Mutex::new(TrackerState {
                user_id: None,
                seconds: 0,
                ticker: None,
            })),
        }
    }

    /// Fold a backend-reported total (in minutes) into the counter.
    ///
    /// The counter never regresses for a given user: the new value is the
    /// maximum of the in-memory count, the backend report, and anything
    /// persisted from an earlier run. Starts the tick task if it is not
    /// already running. Returns the reconciled value in seconds.
    pub fn reconcile(&self, user_id: &str, backend_minutes: u64) -> u64 {
        let backend_seconds = backend_minutes * 60;
        let persisted = self.store.load(user_id).unwrap_or(0);

        let mut state = self.lock();
        let in_memory = match state.user_id.as_deref() {
            Some(current) if current == user_id => state.seconds,
            _ => 0,
        };
        let reconciled = in_memory.max(backend_seconds).max(persisted);

        state.user_id = Some(user_id.to_string());
        state.seconds = reconciled;
        debug!(user_id, reconciled, "usage counter reconciled");

        if state.ticker.is_none() {
            state.ticker = Some(self.spawn_ticker());
        }
        reconciled
    }

    /// Current in-memory counter value in seconds.
    pub fn seconds(&self) -> u64 {
        self.lock().seconds
    }

    /// Stop ticking and remove the persisted key for the signed-out user.
    /// The in-memory counter is left as-is; it only zeroes on [`reset`].
    ///
    /// [`reset`]: UsageTracker::reset
    pub fn sign_out(&self, user_id: &str) {
        {
            let mut state = self.lock();
            if let Some(ticker) = state.ticker.take() {
                ticker.cancel();
            }
        }
        if let Err(err) = self.store.remove(user_id) {
            warn!(%err, user_id, "failed to remove persisted usage counter");
        }
    }

    /// Full state reset: stop ticking and zero the counter.
    pub fn reset(&self) {
        let mut state = self.lock();
        if let Some(ticker) = state.ticker.take() {
            ticker.cancel();
        }
        state.user_id = None;
        state.seconds = 0;
    }

    fn spawn_ticker(&self) -> CancelToken {
        let state = Arc::downgrade(&self.state);
        let store = self.store.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // The first tick completes immediately; skip it so one second of
            // wall time maps to one increment.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(state) = state.upgrade() else {
                    return;
                };
                let (user_id, seconds) = {
                    let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
                    let Some(user_id) = state.user_id.clone() else {
                        return;
                    };
                    state.seconds += 1;
                    (user_id, state.seconds)
                };
                if let Err(err) = store.save(&user_id, seconds) {
                    warn!(%err, user_id, "failed to persist usage counter");
                }
            }
        });
        CancelToken::new(handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
