//! Convenience facade over a [`JobQueueClient`] for application code.

use crate::client::JobQueueClient;
use crate::error::ClientError;
use crate::job::{Job, JobRequest, LIST_ARGS_KEY};
use crate::metrics::MetricsState;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Enqueue, look up and cancel jobs.
///
/// Every successful enqueue is counted when metrics are attached.
#[derive(Clone)]
pub struct JobTemplate {
    client: Arc<dyn JobQueueClient>,
    default_queue: String,
    metrics: Option<Arc<MetricsState>>,
}

impl JobTemplate {
    pub fn new(client: Arc<dyn JobQueueClient>, default_queue: impl Into<String>) -> Self {
        Self {
            client,
            default_queue: default_queue.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsState>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The underlying client, for calls the template does not wrap.
    pub fn client(&self) -> &Arc<dyn JobQueueClient> {
        &self.client
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    pub async fn enqueue(&self, job_type: &str, args: Map<String, Value>) -> Result<Job, ClientError> {
        let job = self.client.enqueue(job_type, args).await?;
        self.record(1);
        debug!(job_type, job_id = %job.id, "Enqueued job");
        Ok(job)
    }

    /// Enqueue positional arguments, wrapped under `_args`.
    pub async fn enqueue_list(&self, job_type: &str, args: Vec<Value>) -> Result<Job, ClientError> {
        let mut wrapped = Map::new();
        wrapped.insert(LIST_ARGS_KEY.to_string(), Value::Array(args));
        self.enqueue(job_type, wrapped).await
    }

    pub async fn enqueue_to_queue(
        &self,
        queue: &str,
        job_type: &str,
        args: Map<String, Value>,
    ) -> Result<Job, ClientError> {
        self.submit(JobRequest::new(job_type, args).queue(queue)).await
    }

    /// Schedule on the default queue at `at`.
    pub async fn enqueue_at(
        &self,
        job_type: &str,
        args: Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<Job, ClientError> {
        let request = JobRequest::new(job_type, args)
            .queue(&self.default_queue)
            .scheduled_at(at);
        self.submit(request).await
    }

    /// Schedule positional arguments on the default queue at `at`.
    pub async fn enqueue_list_at(
        &self,
        job_type: &str,
        args: Vec<Value>,
        at: DateTime<Utc>,
    ) -> Result<Job, ClientError> {
        let request = JobRequest::from_list(job_type, args)
            .queue(&self.default_queue)
            .scheduled_at(at);
        self.submit(request).await
    }

    /// Schedule on the default queue after `delay`.
    pub async fn enqueue_with_delay(
        &self,
        job_type: &str,
        args: Map<String, Value>,
        delay: Duration,
    ) -> Result<Job, ClientError> {
        let request = JobRequest::new(job_type, args)
            .queue(&self.default_queue)
            .delay(delay);
        self.submit(request).await
    }

    pub async fn enqueue_batch(&self, requests: Vec<JobRequest>) -> Result<Vec<Job>, ClientError> {
        let wire = requests.iter().map(JobRequest::to_wire).collect();
        let jobs = self.client.enqueue_batch(wire).await?;
        self.record(jobs.len() as u64);
        debug!(count = jobs.len(), "Enqueued job batch");
        Ok(jobs)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, ClientError> {
        self.client.get_job(id).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<Job, ClientError> {
        self.client.cancel_job(id).await
    }

    pub async fn health(&self) -> Result<Map<String, Value>, ClientError> {
        self.client.health().await
    }

    async fn submit(&self, request: JobRequest) -> Result<Job, ClientError> {
        let job = self.client.enqueue_request(request).await?;
        self.record(1);
        debug!(job_type = %job.job_type, queue = %job.queue, job_id = %job.id, "Enqueued job");
        Ok(job)
    }

    fn record(&self, count: u64) {
        if let Some(metrics) = &self.metrics {
            for _ in 0..count {
                metrics.record_enqueue();
            }
        }
    }
}
