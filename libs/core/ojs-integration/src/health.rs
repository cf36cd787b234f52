//! Health probe for an OJS backend and the local worker.
//!
//! This module provides:
//! - [`HealthIndicator`], which never fails and reports `UP` or `DOWN`
//! - reusable Axum handlers for `/health` and `/metrics`

use crate::client::JobQueueClient;
use crate::metrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, warn};

/// Lifecycle state of a worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    /// Finishing in-flight jobs, not fetching new ones.
    Quiet,
    Terminating,
    Terminated,
}

/// Read-only view of a worker, used for health details.
pub trait WorkerStatus: Send + Sync {
    fn worker_id(&self) -> String;

    fn state(&self) -> WorkerState;

    fn active_job_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub details: Map<String, Value>,
}

impl Health {
    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Combines backend health, worker state and queue statistics.
#[derive(Clone)]
pub struct HealthIndicator {
    client: Arc<dyn JobQueueClient>,
    worker: Option<Arc<dyn WorkerStatus>>,
}

impl HealthIndicator {
    pub fn new(client: Arc<dyn JobQueueClient>) -> Self {
        Self {
            client,
            worker: None,
        }
    }

    pub fn with_worker(mut self, worker: Arc<dyn WorkerStatus>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Probe the backend.
    ///
    /// Backend failures become a `DOWN` result. Queue listing is best effort
    /// and its failure only omits `queues` from the details.
    pub async fn health(&self) -> Health {
        match self.client.health().await {
            Ok(mut details) => {
                if let Some(worker) = &self.worker {
                    details.insert(
                        "worker".to_string(),
                        json!({
                            "id": worker.worker_id(),
                            "state": worker.state(),
                            "activeJobs": worker.active_job_count(),
                        }),
                    );
                }

                match self.client.list_queues().await {
                    Ok(queues) if !queues.is_empty() => {
                        details.insert("queues".to_string(), json!(queues));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Queue statistics unavailable"),
                }

                Health {
                    status: HealthStatus::Up,
                    details,
                }
            }
            Err(e) => {
                warn!(error = %e, "OJS backend health check failed");
                let mut details = Map::new();
                details.insert("error".to_string(), Value::String(e.to_string()));
                if let Some(worker) = &self.worker {
                    details.insert("worker.state".to_string(), json!(worker.state()));
                }

                Health {
                    status: HealthStatus::Down,
                    details,
                }
            }
        }
    }
}

/// Health probe handler. `200` when up, `503` when down.
pub async fn health_handler(
    State(indicator): State<Arc<HealthIndicator>>,
) -> (StatusCode, Json<Health>) {
    let health = indicator.health().await;
    let status = if health.is_up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the worker's health router.
///
/// - `/health` - backend and worker health
/// - `/metrics` - Prometheus metrics
pub fn health_router(indicator: Arc<HealthIndicator>) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(indicator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockJobQueueClient, QueueInfo};
    use crate::error::ClientError;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt; // For oneshot()

    struct FixedWorker;

    impl WorkerStatus for FixedWorker {
        fn worker_id(&self) -> String {
            "worker_1".to_string()
        }

        fn state(&self) -> WorkerState {
            WorkerState::Running
        }

        fn active_job_count(&self) -> usize {
            3
        }
    }

    fn backend_ok(mock: &mut MockJobQueueClient) {
        mock.expect_health().returning(|| {
            let mut details = Map::new();
            details.insert("status".into(), json!("ok"));
            details.insert("version".into(), json!("1.0.0"));
            Ok(details)
        });
    }

    #[tokio::test]
    async fn test_up_merges_worker_and_queues() {
        let mut mock = MockJobQueueClient::new();
        backend_ok(&mut mock);
        mock.expect_list_queues().returning(|| {
            Ok(vec![QueueInfo {
                name: "default".into(),
                available: 4,
                active: 1,
                paused: false,
            }])
        });
        let indicator = HealthIndicator::new(Arc::new(mock)).with_worker(Arc::new(FixedWorker));

        let health = indicator.health().await;
        assert!(health.is_up());
        assert_eq!(health.details["version"], "1.0.0");
        assert_eq!(
            health.details["worker"],
            json!({"id": "worker_1", "state": "running", "activeJobs": 3})
        );
        assert_eq!(health.details["queues"][0]["name"], "default");
    }

    #[tokio::test]
    async fn test_queue_listing_failure_is_swallowed() {
        let mut mock = MockJobQueueClient::new();
        backend_ok(&mut mock);
        mock.expect_list_queues()
            .returning(|| Err(ClientError::Unavailable("stats disabled".into())));
        let indicator = HealthIndicator::new(Arc::new(mock));

        let health = indicator.health().await;
        assert!(health.is_up());
        assert!(health.details.get("queues").is_none());
        assert!(health.details.get("worker").is_none());
    }

    #[tokio::test]
    async fn test_down_reports_error_and_worker_state() {
        let mut mock = MockJobQueueClient::new();
        mock.expect_health()
            .returning(|| Err(ClientError::Unavailable("connection refused".into())));
        mock.expect_list_queues().never();
        let indicator = HealthIndicator::new(Arc::new(mock)).with_worker(Arc::new(FixedWorker));

        let health = indicator.health().await;
        assert_eq!(health.status, HealthStatus::Down);
        assert!(health.details["error"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
        assert_eq!(health.details["worker.state"], "running");
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(HealthStatus::Up).unwrap(), json!("UP"));
        assert_eq!(WorkerState::Terminating.to_string(), "terminating");
        assert_eq!("quiet".parse::<WorkerState>().unwrap(), WorkerState::Quiet);
    }

    #[tokio::test]
    async fn test_health_route_returns_503_when_down() {
        let mut mock = MockJobQueueClient::new();
        mock.expect_health()
            .returning(|| Err(ClientError::Unavailable("down".into())));
        let app = health_router(Arc::new(HealthIndicator::new(Arc::new(mock))));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "DOWN");
    }

    #[tokio::test]
    async fn test_health_route_returns_200_when_up() {
        let mut mock = MockJobQueueClient::new();
        backend_ok(&mut mock);
        mock.expect_list_queues().returning(|| Ok(Vec::new()));
        let app = health_router(Arc::new(HealthIndicator::new(Arc::new(mock))));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
