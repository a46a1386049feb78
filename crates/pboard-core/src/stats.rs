use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::backend::Backend;
use crate::usage::UsageTracker;

const STATS_PATH: &str = "/stats";
const TOTAL_APP_TIME_FIELD: &str = "total_app_time";

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats request failed: {0}")]
    Backend(String),
}

/// Stats payload plus the locally reconciled elapsed counter.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Raw stats object as returned by the backend.
    pub data: Value,
    /// Backend-reported total app time, in minutes.
    pub total_minutes: u64,
    /// Elapsed counter after folding the backend total in, in seconds.
    pub elapsed_seconds: u64,
}

/// Fetches account stats and feeds the reported app time into the usage
/// counter. Every successful refresh also guarantees the counter is ticking.
pub struct StatsService {
    backend: Arc<dyn Backend>,
    usage: Arc<UsageTracker>,
}

impl StatsService {
    pub fn new(backend: Arc<dyn Backend>, usage: Arc<UsageTracker>) -> Self {
        Self { backend, usage }
    }

    pub async fn refresh(&self, token: &str, user_id: &str) -> Result<StatsSnapshot, StatsError> {
        let response = self
            .backend
            .request(Method::GET, STATS_PATH, token, None)
            .await;

        if let Some(error) = response.error {
            return Err(StatsError::Backend(error));
        }
        let data = response.data.unwrap_or(Value::Null);

        // A missing or malformed total is treated as zero minutes; the
        // reconcile is monotonic so this can never rewind the counter.
        let total_minutes = data
            .get(TOTAL_APP_TIME_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let elapsed_seconds = self.usage.reconcile(user_id, total_minutes);
        debug!(user_id, total_minutes, elapsed_seconds, "stats refreshed");

        Ok(StatsSnapshot {
            data,
            total_minutes,
            elapsed_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ApiResponse;
    use crate::usage::UsageStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeBackend {
        responses: Mutex<Vec<ApiResponse>>,
    }

    impl FakeBackend {
        fn returning(responses: Vec<ApiResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn request(
            &self,
            method: Method,
            path: &str,
            _token: &str,
            _body: Option<Value>,
        ) -> ApiResponse {
            assert_eq!(method, Method::GET);
            assert_eq!(path, STATS_PATH);
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn service(backend: Arc<FakeBackend>, dir: &tempfile::TempDir) -> StatsService {
        let usage = Arc::new(UsageTracker::new(UsageStore::at(dir.path().to_path_buf())));
        StatsService::new(backend, usage)
    }

    #[tokio::test]
    async fn refresh_reconciles_reported_minutes() {
        let dir = tempdir().unwrap();
        let backend = FakeBackend::returning(vec![ApiResponse::ok(
            json!({"total_app_time": 90, "plan": "pro"}),
        )]);
        let service = service(backend, &dir);

        let snapshot = service.refresh("tok", "user-1").await.unwrap();
        assert_eq!(snapshot.total_minutes, 90);
        assert_eq!(snapshot.elapsed_seconds, 5400);
        assert_eq!(snapshot.data["plan"], "pro");
    }

    #[tokio::test]
    async fn missing_total_counts_as_zero_minutes() {
        let dir = tempdir().unwrap();
        let backend = FakeBackend::returning(vec![ApiResponse::ok(json!({"plan": "free"}))]);
        let service = service(backend, &dir);

        let snapshot = service.refresh("tok", "user-1").await.unwrap();
        assert_eq!(snapshot.total_minutes, 0);
        assert_eq!(snapshot.elapsed_seconds, 0);
    }

    #[tokio::test]
    async fn lagging_backend_total_does_not_rewind_counter() {
        let dir = tempdir().unwrap();
        let backend = FakeBackend::returning(vec![
            ApiResponse::ok(json!({"total_app_time": 120})),
            ApiResponse::ok(json!({"total_app_time": 30})),
        ]);
        let service = service(backend, &dir);

        assert_eq!(
            service.refresh("tok", "user-1").await.unwrap().elapsed_seconds,
            7200
        );
        assert_eq!(
            service.refresh("tok", "user-1").await.unwrap().elapsed_seconds,
            7200
        );
    }

    #[tokio::test]
    async fn backend_error_surfaces_without_touching_counter() {
        let dir = tempdir().unwrap();
        let backend = FakeBackend::returning(vec![ApiResponse::err("stats unavailable")]);
        let service = service(backend.clone(), &dir);

        let err = service.refresh("tok", "user-1").await.unwrap_err();
        assert!(err.to_string().contains("stats unavailable"));
        assert_eq!(service.usage.seconds(), 0);
    }
}
