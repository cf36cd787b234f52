//! Interface to the remote job-queue backend.

use crate::error::ClientError;
use crate::job::{Job, JobRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Summary of one queue as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub available: u64,
    #[serde(default)]
    pub active: u64,
    #[serde(default)]
    pub paused: bool,
}

/// Job queue client.
///
/// Implementations perform network I/O; every failure is reported as a
/// [`ClientError`] and never swallowed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueueClient: Send + Sync {
    /// Enqueue a job on the backend's default routing.
    async fn enqueue(&self, job_type: &str, args: Map<String, Value>) -> Result<Job, ClientError>;

    /// Enqueue with explicit queue, schedule or metadata.
    async fn enqueue_request(&self, request: JobRequest) -> Result<Job, ClientError>;

    async fn get_job(&self, id: &str) -> Result<Job, ClientError>;

    async fn cancel_job(&self, id: &str) -> Result<Job, ClientError>;

    /// Enqueue several jobs given in [`JobRequest::to_wire`] form.
    async fn enqueue_batch(
        &self,
        requests: Vec<Map<String, Value>>,
    ) -> Result<Vec<Job>, ClientError>;

    /// Backend health details.
    async fn health(&self) -> Result<Map<String, Value>, ClientError>;

    async fn list_queues(&self) -> Result<Vec<QueueInfo>, ClientError>;
}
