//! In-memory job queue backend for tests and local runs.

use crate::client::{JobQueueClient, QueueInfo};
use crate::dispatcher::JobSource;
use crate::error::ClientError;
use crate::handler::HandlerResult;
use crate::job::{Job, JobRequest, JobState};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Jobs in insertion order with lookup by id.
#[derive(Debug, Default)]
struct MemoryState {
    order: VecDeque<String>,
    jobs: HashMap<String, Job>,
}

impl MemoryState {
    fn insert(&mut self, job: Job) {
        self.order.push_back(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
    }

    fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }
}

/// A [`JobQueueClient`] that keeps every job in process memory.
///
/// Doubles as the [`JobSource`] for an in-process
/// [`Dispatcher`](crate::Dispatcher).
#[derive(Clone)]
pub struct MemoryClient {
    state: Arc<RwLock<MemoryState>>,
    default_queue: String,
    available: Arc<AtomicBool>,
}

impl fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryClient")
            .field("default_queue", &self.default_queue)
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MemoryClient {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            default_queue: default_queue.into(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the backend going away. Every call fails with
    /// [`ClientError::Unavailable`] while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Every stored job, oldest first.
    pub async fn enqueued(&self) -> Vec<Job> {
        self.state.read().await.iter().cloned().collect()
    }

    fn check(&self) -> Result<(), ClientError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ClientError::Unavailable(
                "in-memory backend marked unavailable".to_string(),
            ))
        }
    }

    fn build(&self, request: JobRequest) -> Job {
        let queue = request
            .queue
            .unwrap_or_else(|| self.default_queue.clone());
        let mut job = Job::new(request.job_type, queue, vec![Value::Object(request.args)]);
        job.meta = request.meta;
        if let Some(at) = request.scheduled_at {
            job.scheduled_at = Some(at);
            job.state = JobState::Scheduled;
        }
        job
    }
}

fn validate(request: &JobRequest) -> Result<(), ClientError> {
    if request.job_type.is_empty() {
        return Err(ClientError::Rejected("job type must not be empty".to_string()));
    }
    Ok(())
}

fn is_due(job: &Job) -> bool {
    match job.state {
        JobState::Available => true,
        JobState::Scheduled => job.scheduled_at.is_none_or(|at| at <= Utc::now()),
        _ => false,
    }
}

#[async_trait]
impl JobQueueClient for MemoryClient {
    async fn enqueue(&self, job_type: &str, args: Map<String, Value>) -> Result<Job, ClientError> {
        self.enqueue_request(JobRequest::new(job_type, args)).await
    }

    async fn enqueue_request(&self, request: JobRequest) -> Result<Job, ClientError> {
        self.check()?;
        validate(&request)?;

        let job = self.build(request);
        self.state.write().await.insert(job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Job, ClientError> {
        self.check()?;
        self.state
            .read()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    async fn cancel_job(&self, id: &str) -> Result<Job, ClientError> {
        self.check()?;
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;

        if job.state.is_terminal() {
            return Err(ClientError::Rejected(format!(
                "job {id} is already {}",
                job.state
            )));
        }
        job.state = JobState::Cancelled;
        Ok(job.clone())
    }

    async fn enqueue_batch(
        &self,
        requests: Vec<Map<String, Value>>,
    ) -> Result<Vec<Job>, ClientError> {
        self.check()?;
        let parsed = requests
            .iter()
            .map(|wire| {
                let request = JobRequest::from_wire(wire)
                    .ok_or_else(|| ClientError::Rejected("batch entry is missing a type".to_string()))?;
                validate(&request)?;
                Ok(request)
            })
            .collect::<Result<Vec<_>, ClientError>>()?;

        let jobs: Vec<Job> = parsed.into_iter().map(|r| self.build(r)).collect();
        let mut state = self.state.write().await;
        for job in &jobs {
            state.insert(job.clone());
        }
        Ok(jobs)
    }

    async fn health(&self) -> Result<Map<String, Value>, ClientError> {
        self.check()?;
        let jobs = self.state.read().await.jobs.len();

        let mut details = Map::new();
        details.insert("status".to_string(), json!("ok"));
        details.insert("backend".to_string(), json!("memory"));
        details.insert("jobs".to_string(), json!(jobs));
        Ok(details)
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>, ClientError> {
        self.check()?;
        let state = self.state.read().await;

        let mut queues: BTreeMap<&str, QueueInfo> = BTreeMap::new();
        for job in state.iter() {
            let info = queues.entry(job.queue.as_str()).or_insert_with(|| QueueInfo {
                name: job.queue.clone(),
                available: 0,
                active: 0,
                paused: false,
            });
            match job.state {
                JobState::Available | JobState::Scheduled => info.available += 1,
                JobState::Active => info.active += 1,
                _ => {}
            }
        }
        Ok(queues.into_values().collect())
    }
}

#[async_trait]
impl JobSource for MemoryClient {
    /// An empty `queues` slice matches every queue.
    async fn fetch(&self, queues: &[String], limit: usize) -> Result<Vec<Job>, ClientError> {
        self.check()?;
        let mut state = self.state.write().await;

        let due: Vec<String> = state
            .iter()
            .filter(|job| queues.is_empty() || queues.contains(&job.queue))
            .filter(|job| is_due(job))
            .take(limit)
            .map(|job| job.id.clone())
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.state = JobState::Active;
                job.attempt += 1;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, job_id: &str, outcome: &HandlerResult) -> Result<(), ClientError> {
        self.check()?;
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ClientError::NotFound(job_id.to_string()))?;

        // A job cancelled while it ran stays cancelled
        if job.state.is_terminal() {
            debug!(job_id, state = %job.state, "Ignoring outcome for finished job");
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                job.state = JobState::Completed;
                if !result.is_null() {
                    job.meta.insert("result".to_string(), result.clone());
                }
            }
            Err(e) => {
                job.state = JobState::Retryable;
                job.meta.insert("error".to_string(), json!(e.to_string()));
            }
        }
        Ok(())
    }
}
