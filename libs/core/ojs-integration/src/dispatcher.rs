//! In-process worker engine.
//!
//! Owns the dispatch table filled by
//! [`HandlerRegistry::initialize`](crate::HandlerRegistry::initialize), runs
//! every job through the middleware [`Pipeline`], and bounds concurrency with
//! a semaphore sized from configuration.

use crate::config::OjsConfig;
use crate::context::{Heartbeat, JobContext};
use crate::error::{ClientError, HandlerError, RegistrationError};
use crate::handler::{HandlerResult, JobHandler};
use crate::health::{WorkerState, WorkerStatus};
use crate::job::Job;
use crate::middleware::{Middleware, Pipeline};
use crate::registry::WorkerEngine;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Where the dispatcher gets work from and reports outcomes to.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Claim up to `limit` available jobs from `queues`.
    async fn fetch(&self, queues: &[String], limit: usize) -> Result<Vec<Job>, ClientError>;

    /// Report the outcome of a claimed job.
    async fn ack(&self, job_id: &str, outcome: &HandlerResult) -> Result<(), ClientError>;
}

type CancelFlags = Mutex<HashMap<String, Arc<AtomicBool>>>;

/// Dispatch table plus execution policy.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    pipeline: Pipeline,
    worker_id: String,
    queues: Vec<String>,
    state: RwLock<WorkerState>,
    active: AtomicUsize,
    permits: Arc<Semaphore>,
    heartbeats: Option<Sender<Heartbeat>>,
    in_flight: CancelFlags,
}

impl Dispatcher {
    pub fn new(concurrency: usize, queues: Vec<String>) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            handlers: HashMap::new(),
            pipeline: Pipeline::new(),
            worker_id: format!("worker_{}", uuid::Uuid::new_v4()),
            queues,
            state: RwLock::new(WorkerState::Idle),
            active: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(concurrency)),
            heartbeats: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Size the dispatcher from the resolved worker settings.
    pub fn from_config(config: &OjsConfig) -> Self {
        Self::new(config.resolved_concurrency(), config.resolved_queues())
    }

    /// Append a middleware. The first one added runs outermost.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        info!(middleware = middleware.name(), "Added OJS middleware");
        self.pipeline.push(middleware);
    }

    /// Forward handler heartbeats to `sender`.
    ///
    /// Heartbeats are dropped while the channel is full, so the receiver only
    /// needs to keep up, not to see every beat.
    pub fn with_heartbeats(mut self, sender: Sender<Heartbeat>) -> Self {
        self.heartbeats = Some(sender);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Build the context for a claimed job.
    ///
    /// The job stays cancellable through [`cancel`](Self::cancel) until its
    /// dispatch finishes.
    pub fn context_for(&self, job: Job) -> JobContext {
        let flag = Arc::new(AtomicBool::new(false));
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), flag.clone());

        let ctx = JobContext::new(job).with_cancellation(flag);
        match &self.heartbeats {
            Some(sender) => ctx.with_heartbeat(sender.clone()),
            None => ctx,
        }
    }

    /// Ask an in-flight job to stop. Handlers observe this through
    /// [`JobContext::is_cancelled`]. Returns `false` when the job is not
    /// running here.
    pub fn cancel(&self, job_id: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match in_flight.get(job_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                info!(job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run the registered handler for `ctx` through the middleware pipeline.
    ///
    /// Waits for a concurrency permit first. Unknown job types fail with
    /// [`HandlerError::UnknownJobType`] without touching the pipeline.
    pub async fn dispatch(&self, ctx: &JobContext) -> HandlerResult {
        let _tracked = InFlight::new(&self.in_flight, ctx.job_id());
        let handler = self.lookup(ctx)?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| HandlerError::with_source("worker is shutting down", e))?;
        self.invoke(ctx, handler.as_ref()).await
    }

    fn lookup(&self, ctx: &JobContext) -> Result<Arc<dyn JobHandler>, HandlerError> {
        self.handlers
            .get(ctx.job_type())
            .cloned()
            .ok_or_else(|| HandlerError::UnknownJobType(ctx.job_type().to_string()))
    }

    async fn invoke(&self, ctx: &JobContext, handler: &dyn JobHandler) -> HandlerResult {
        let _active = ActiveJob::enter(&self.active);

        debug!(
            job_id = %ctx.job_id(),
            job_type = %ctx.job_type(),
            attempt = ctx.attempt(),
            "Dispatching job"
        );
        self.pipeline.invoke(ctx, handler).await
    }

    /// Poll `source` until `shutdown` flips to `true`, then drain in-flight
    /// jobs.
    ///
    /// Permits are taken before fetching, so a fetch never claims more jobs
    /// than there are free slots. The loop only sleeps for `poll_interval`
    /// when a fetch comes back empty or fails.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn JobSource>,
        mut shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) {
        info!(
            worker_id = %self.worker_id,
            queues = ?self.queues,
            job_types = ?self.job_types(),
            concurrency = self.permits.available_permits(),
            "Starting OJS worker"
        );
        self.set_state(WorkerState::Running);

        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping worker");
                break;
            }

            while let Some(joined) = join_set.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "Job task aborted");
                }
            }

            let first = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, stopping worker");
                        break;
                    }
                    continue;
                }
            };
            let mut permits = vec![first];
            while let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
                permits.push(permit);
            }

            let jobs = match source.fetch(&self.queues, permits.len()).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch jobs");
                    Vec::new()
                }
            };
            let idle = jobs.is_empty();

            for job in jobs {
                let permit = match permits.pop() {
                    Some(permit) => permit,
                    // The source returned more than asked for
                    None => match Arc::clone(&self.permits).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let dispatcher = Arc::clone(&self);
                let source = Arc::clone(&source);
                join_set.spawn(async move {
                    dispatcher.process(source.as_ref(), job, permit).await;
                });
            }
            drop(permits);

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            info!("Shutdown channel closed, stopping worker");
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(WorkerState::Terminating);
        while join_set.join_next().await.is_some() {}
        self.set_state(WorkerState::Terminated);
        info!(worker_id = %self.worker_id, "OJS worker stopped");
    }

    async fn process(&self, source: &dyn JobSource, job: Job, _permit: OwnedSemaphorePermit) {
        let ctx = self.context_for(job);
        let outcome = {
            let _tracked = InFlight::new(&self.in_flight, ctx.job_id());
            match self.lookup(&ctx) {
                Ok(handler) => self.invoke(&ctx, handler.as_ref()).await,
                Err(e) => Err(e),
            }
        };

        match &outcome {
            Ok(_) => debug!(job_id = %ctx.job_id(), job_type = %ctx.job_type(), "Job completed"),
            Err(e) => warn!(
                job_id = %ctx.job_id(),
                job_type = %ctx.job_type(),
                error = %e,
                "Job failed"
            ),
        }

        let outcome = match (outcome, ctx.take_result()) {
            (Ok(_), Some(recorded)) => Ok(recorded),
            (outcome, _) => outcome,
        };
        if let Err(e) = source.ack(ctx.job_id(), &outcome).await {
            warn!(job_id = %ctx.job_id(), error = %e, "Failed to report job outcome");
        }
    }
}

impl WorkerEngine for Dispatcher {
    fn register(
        &mut self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistrationError> {
        if job_type.is_empty() {
            return Err(RegistrationError::EmptyJobType);
        }
        if self.handlers.insert(job_type.to_string(), handler).is_some() {
            warn!(job_type, "Replacing previously registered handler");
        }
        Ok(())
    }
}

impl WorkerStatus for Dispatcher {
    fn worker_id(&self) -> String {
        self.worker_id.clone()
    }

    fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_job_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Keeps a job's cancellation flag registered until dropped.
struct InFlight<'a> {
    flags: &'a CancelFlags,
    job_id: &'a str,
}

impl<'a> InFlight<'a> {
    fn new(flags: &'a CancelFlags, job_id: &'a str) -> Self {
        Self { flags, job_id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.job_id);
    }
}

/// Counts one in-flight job until dropped.
struct ActiveJob<'a>(&'a AtomicUsize);

impl<'a> ActiveJob<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn first(_ctx: &JobContext) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async { Ok(json!("first")) })
    }

    fn second(_ctx: &JobContext) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async { Ok(json!("second")) })
    }

    fn beat(ctx: &JobContext) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            ctx.heartbeat();
            Ok(json!(ctx.is_cancelled()))
        })
    }

    fn ctx(job_type: &str) -> JobContext {
        JobContext::new(Job::new(job_type, "default", vec![]))
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut dispatcher = Dispatcher::new(2, vec!["default".into()]);
        dispatcher.register("t", Arc::new(FnHandler::new("t", first))).unwrap();
        dispatcher.register("t", Arc::new(FnHandler::new("t", second))).unwrap();

        assert_eq!(dispatcher.job_types(), vec!["t"]);
        assert_eq!(dispatcher.dispatch(&ctx("t")).await.unwrap(), json!("second"));
    }

    #[test]
    fn test_register_rejects_empty_type() {
        let mut dispatcher = Dispatcher::new(1, vec![]);
        let err = dispatcher
            .register("", Arc::new(FnHandler::new("", first)))
            .unwrap_err();
        assert_eq!(err, RegistrationError::EmptyJobType);
        assert!(dispatcher.job_types().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_type() {
        let dispatcher = Dispatcher::new(1, vec![]);
        let err = dispatcher.dispatch(&ctx("missing")).await.unwrap_err();
        assert!(matches!(err, HandlerError::UnknownJobType(ref t) if t == "missing"));
        assert_eq!(dispatcher.active_job_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeats_are_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut dispatcher = Dispatcher::new(1, vec![]).with_heartbeats(tx);
        dispatcher.register("beat", Arc::new(FnHandler::new("beat", beat))).unwrap();

        let ctx = dispatcher.context_for(Job::new("beat", "default", vec![]));
        assert_eq!(dispatcher.dispatch(&ctx).await.unwrap(), json!(false));
        assert_eq!(rx.recv().await.unwrap().job_id, ctx.job_id());
    }

    fn wait_for_cancel(ctx: &JobContext) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            for _ in 0..200 {
                if ctx.is_cancelled() {
                    return Err(HandlerError::Cancelled {
                        job_id: ctx.job_id().to_string(),
                    });
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(json!("finished"))
        })
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_handler() {
        let mut dispatcher = Dispatcher::new(1, vec![]);
        dispatcher
            .register("slow", Arc::new(FnHandler::new("slow", wait_for_cancel)))
            .unwrap();

        let ctx = dispatcher.context_for(Job::new("slow", "default", vec![]));
        let job_id = ctx.job_id().to_string();

        let (outcome, cancelled) = tokio::join!(dispatcher.dispatch(&ctx), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            dispatcher.cancel(&job_id)
        });

        assert!(cancelled);
        assert!(matches!(outcome, Err(HandlerError::Cancelled { ref job_id }) if *job_id == ctx.job_id()));
        // Finished jobs are no longer cancellable
        assert!(!dispatcher.cancel(&job_id));
        assert!(!dispatcher.cancel("unknown"));
    }

    #[tokio::test]
    async fn test_run_does_not_wait_between_full_fetches() {
        use crate::client::JobQueueClient;
        use crate::job::JobState;
        use crate::memory::MemoryClient;

        let client = Arc::new(MemoryClient::default());
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(client.enqueue("t", serde_json::Map::new()).await.unwrap().id);
        }

        let mut dispatcher = Dispatcher::new(2, vec!["default".into()]);
        dispatcher.register("t", Arc::new(FnHandler::new("t", first))).unwrap();
        let dispatcher = Arc::new(dispatcher);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(dispatcher.clone().run(
            client.clone(),
            shutdown_rx,
            Duration::from_secs(30),
        ));

        let mut completed = 0;
        for _ in 0..100 {
            completed = 0;
            for id in &ids {
                if client.get_job(id).await.unwrap().state == JobState::Completed {
                    completed += 1;
                }
            }
            if completed == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(completed, 6);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
        assert_eq!(dispatcher.state(), WorkerState::Terminated);
        assert_eq!(dispatcher.active_job_count(), 0);
    }

    #[test]
    fn test_status_reporting() {
        let dispatcher = Dispatcher::new(0, vec!["a".into()]);
        assert!(dispatcher.worker_id().starts_with("worker_"));
        assert_eq!(dispatcher.state(), WorkerState::Idle);
        dispatcher.set_state(WorkerState::Quiet);
        assert_eq!(WorkerStatus::state(&dispatcher), WorkerState::Quiet);
        assert_eq!(dispatcher.queues(), ["a".to_string()]);
    }
}
