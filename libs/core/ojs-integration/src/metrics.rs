//! Job execution metrics.
//!
//! [`MetricsMiddleware`] counts every invocation in a shared [`MetricsState`]
//! and mirrors each update to the `metrics` facade, so a Prometheus recorder
//! installed with [`init_metrics`] exports the same numbers.

use crate::context::JobContext;
use crate::handler::HandlerResult;
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const JOBS_ENQUEUED: &str = "ojs_jobs_enqueued_total";
pub const JOBS_COMPLETED: &str = "ojs_jobs_completed_total";
pub const JOBS_FAILED: &str = "ojs_jobs_failed_total";
pub const JOBS_ACTIVE: &str = "ojs_jobs_active";
pub const JOB_DURATION: &str = "ojs_job_duration_seconds";

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and describe the job metrics.
///
/// Call this once at startup. Subsequent calls are no-ops. If another global
/// recorder is already installed, the failure is logged and `/metrics` renders
/// empty.
pub fn init_metrics() {
    let handle = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        describe_metrics();
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    if let Err(e) = handle {
        warn!(error = %e, "Failed to install Prometheus recorder");
    }
}

fn describe_metrics() {
    describe_counter!(JOBS_ENQUEUED, "Total number of jobs enqueued");
    describe_counter!(JOBS_COMPLETED, "Total number of jobs completed successfully");
    describe_counter!(JOBS_FAILED, "Total number of jobs that failed");
    describe_gauge!(JOBS_ACTIVE, "Number of jobs currently executing");
    describe_histogram!(JOB_DURATION, metrics::Unit::Seconds, "Job execution duration");
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-job-type counters.
#[derive(Debug, Default)]
struct JobTypeStats {
    completed: AtomicU64,
    failed: AtomicU64,
    duration_samples: AtomicU64,
    duration_nanos: AtomicU64,
}

/// Point-in-time copy of one job type's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobTypeSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub duration_samples: u64,
    pub total_duration: Duration,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub active: i64,
    pub job_types: HashMap<String, JobTypeSnapshot>,
}

/// Counters shared by every invocation of the metrics middleware and by
/// enqueue call sites.
///
/// All updates are atomic; the per-type map is only write-locked the first
/// time a job type is seen.
#[derive(Debug, Default)]
pub struct MetricsState {
    enqueued: AtomicU64,
    active: AtomicI64,
    job_types: RwLock<HashMap<String, Arc<JobTypeStats>>>,
}

impl MetricsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one successful enqueue.
    pub fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!(JOBS_ENQUEUED).increment(1);
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn active_jobs(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    /// Counters for one job type; zeroed when the type was never seen.
    pub fn job_type(&self, job_type: &str) -> JobTypeSnapshot {
        self.job_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .map(|stats| stats.snapshot())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let job_types = self
            .job_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        MetricsSnapshot {
            enqueued: self.enqueued(),
            active: self.active_jobs(),
            job_types,
        }
    }

    fn stats(&self, job_type: &str) -> Arc<JobTypeStats> {
        if let Some(stats) = self
            .job_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
        {
            return stats.clone();
        }

        self.job_types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_type.to_string())
            .or_default()
            .clone()
    }

    fn begin(&self, job_type: &str) -> InvocationGuard<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        gauge!(JOBS_ACTIVE).increment(1.0);

        InvocationGuard {
            state: self,
            job_type: job_type.to_string(),
            stats: self.stats(job_type),
            started: Instant::now(),
            outcome: Outcome::Failed,
        }
    }
}

impl JobTypeStats {
    fn snapshot(&self) -> JobTypeSnapshot {
        JobTypeSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duration_samples: self.duration_samples.load(Ordering::Relaxed),
            total_duration: Duration::from_nanos(self.duration_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
}

/// Scoped measurement of one invocation.
///
/// Dropping the guard records the outcome counter, the duration and the gauge
/// decrement, in that order, whichever way the invocation ended. An
/// invocation that never reports completion (error or panic) counts as failed.
struct InvocationGuard<'a> {
    state: &'a MetricsState,
    job_type: String,
    stats: Arc<JobTypeStats>,
    started: Instant,
    outcome: Outcome,
}

impl InvocationGuard<'_> {
    fn complete(&mut self) {
        self.outcome = Outcome::Completed;
    }
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();

        match self.outcome {
            Outcome::Completed => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                counter!(JOBS_COMPLETED, "type" => self.job_type.clone()).increment(1);
            }
            Outcome::Failed => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                counter!(JOBS_FAILED, "type" => self.job_type.clone()).increment(1);
            }
        }

        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.stats.duration_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.stats.duration_samples.fetch_add(1, Ordering::Relaxed);
        histogram!(JOB_DURATION, "type" => self.job_type.clone()).record(elapsed.as_secs_f64());

        self.state.active.fetch_sub(1, Ordering::AcqRel);
        gauge!(JOBS_ACTIVE).decrement(1.0);
    }
}

/// Counts completions, failures, durations and in-flight jobs per job type.
#[derive(Debug, Clone, Default)]
pub struct MetricsMiddleware {
    state: Arc<MetricsState>,
}

impl MetricsMiddleware {
    pub fn new(state: Arc<MetricsState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<MetricsState> {
        &self.state
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, ctx: &JobContext, next: Next<'_>) -> HandlerResult {
        let mut guard = self.state.begin(ctx.job_type());
        let result = next.run(ctx).await;
        if result.is_ok() {
            guard.complete();
        }
        result
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}
