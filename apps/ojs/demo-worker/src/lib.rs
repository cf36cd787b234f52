//! OJS Demo Worker
//!
//! Runs the handler integration layer end to end against the in-memory
//! backend.
//!
//! ## Architecture
//!
//! ```text
//! TransactionScope ──commit──▶ DeferredEnqueue ──▶ MemoryClient
//!                                                     ↓ fetch
//!                            Dispatcher (MetricsMiddleware → handlers)
//!                                                     ↓ ack
//!                                                 MemoryClient
//! ```
//!
//! ## Features
//!
//! - Method-level (`EmailJobs`) and class-level (`ReportJob`) handlers
//! - Commit-deferred enqueue
//! - Health and Prometheus endpoints
//! - Graceful shutdown handling

pub mod jobs;

use axum::Router;
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use jobs::{EmailJobs, ReportJob, EMAIL_DIGEST, EMAIL_SEND, REPORT_GENERATE, REPORTS_QUEUE};
use ojs_integration::{
    health_router, metrics, Candidate, DeferredEnqueue, Dispatcher, HandlerRegistry, Heartbeat,
    HealthIndicator, JobQueueClient, JobTemplate, MemoryClient, MetricsMiddleware, MetricsState,
    OjsConfig, TransactionScope,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const HEARTBEAT_BUFFER: usize = 256;

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Backend and worker health: `/health`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(indicator: Arc<HealthIndicator>, server: ServerConfig) -> Result<()> {
    let app: Router = health_router(indicator);

    let addr = server
        .socket_addr()
        .wrap_err("Invalid health server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Build the worker: middleware first, then handler registration.
pub fn build_dispatcher(
    config: &OjsConfig,
    metrics: Arc<MetricsState>,
    emails: Arc<EmailJobs>,
) -> Result<(Dispatcher, HandlerRegistry)> {
    let mut queues = config.resolved_queues();
    if !queues.iter().any(|q| q == REPORTS_QUEUE) {
        queues.push(REPORTS_QUEUE.to_string());
    }

    let mut dispatcher = Dispatcher::new(config.resolved_concurrency(), queues);
    dispatcher.use_middleware(Arc::new(MetricsMiddleware::new(metrics)));

    let registry = HandlerRegistry::initialize(
        &mut dispatcher,
        &[
            Candidate::component(emails),
            Candidate::handler(Arc::new(ReportJob::new(Duration::from_millis(200)))),
        ],
    )
    .wrap_err("Failed to register job handlers")?;

    Ok((dispatcher, registry))
}

/// Log handler heartbeats until every sender is dropped.
pub fn spawn_heartbeat_logger() -> mpsc::Sender<Heartbeat> {
    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<Heartbeat>(HEARTBEAT_BUFFER);
    tokio::spawn(async move {
        while let Some(beat) = heartbeat_rx.recv().await {
            debug!(job_id = %beat.job_id, "Job heartbeat");
        }
    });
    heartbeat_tx
}

fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Enqueue a few demo jobs: one welcome email deferred until a simulated
/// signup transaction commits, a second one whose transaction rolls back, and
/// direct enqueues through the template.
pub async fn seed_jobs(deferred: &DeferredEnqueue, template: &JobTemplate) -> Result<()> {
    let signup = TransactionScope::new();
    deferred
        .after_commit(
            Some(&signup),
            EMAIL_SEND,
            args(&[("to", json!("new.user@example.com")), ("subject", json!("Welcome"))]),
        )
        .await?;
    info!(pending = signup.pending(), "Signup transaction committing");
    signup.commit().await.wrap_err("Deferred enqueue failed on commit")?;

    let aborted = TransactionScope::new();
    deferred
        .after_commit(
            Some(&aborted),
            EMAIL_SEND,
            args(&[("to", json!("never.sent@example.com"))]),
        )
        .await?;
    aborted.rollback();

    template
        .enqueue_list(EMAIL_DIGEST, vec![json!("a@example.com"), json!("b@example.com")])
        .await?;
    template
        .enqueue_to_queue(REPORTS_QUEUE, REPORT_GENERATE, args(&[("report_id", json!("r-2025-q4"))]))
        .await?;

    Ok(())
}

/// Run the demo worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging and error reports
/// 2. Loads `OJS_*` configuration
/// 3. Registers the demo handlers behind the metrics middleware
/// 4. Seeds jobs and processes them until Ctrl+C or SIGTERM
///
/// # Errors
///
/// Returns an error if configuration is invalid, handler registration fails,
/// or a seeded enqueue fails.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting OJS demo worker"
    );

    let config = OjsConfig::from_env().wrap_err("Failed to load OJS configuration")?;
    if !config.enabled {
        warn!("OJS integration disabled (OJS_ENABLED=false), exiting");
        return Ok(());
    }
    let server = ServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    info!(
        url = %config.url,
        default_queue = %config.default_queue,
        queues = ?config.resolved_queues(),
        concurrency = config.resolved_concurrency(),
        max_attempts = config.retry.max_attempts,
        backoff = %config.retry.backoff,
        "OJS configuration loaded"
    );

    let client = Arc::new(MemoryClient::new(config.default_queue.clone()));
    let queue_client: Arc<dyn JobQueueClient> = client.clone();
    let metrics_state = Arc::new(MetricsState::new());
    let emails = Arc::new(EmailJobs::new());

    let (dispatcher, registry) = build_dispatcher(&config, metrics_state.clone(), emails.clone())?;
    info!(job_types = ?registry.job_types(), queues = ?registry.queues(), "Handlers registered");

    let dispatcher = Arc::new(dispatcher.with_heartbeats(spawn_heartbeat_logger()));

    let template = JobTemplate::new(queue_client.clone(), config.default_queue.clone())
        .with_metrics(metrics_state.clone());
    let deferred = DeferredEnqueue::new(queue_client.clone()).with_metrics(metrics_state.clone());
    seed_jobs(&deferred, &template).await?;

    let indicator = Arc::new(HealthIndicator::new(queue_client).with_worker(dispatcher.clone()));
    tokio::spawn(async move {
        if let Err(e) = start_health_server(indicator, server).await {
            error!(error = %e, "Health server failed");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    dispatcher
        .clone()
        .run(client, shutdown_rx, config.poll_interval())
        .await;

    let snapshot = metrics_state.snapshot();
    info!(
        enqueued = snapshot.enqueued,
        emails_sent = emails.sent(),
        "OJS demo worker stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojs_integration::{JobState, WorkerStatus};

    #[tokio::test]
    async fn test_build_dispatcher_registers_demo_handlers() {
        let config = OjsConfig::default();
        let (dispatcher, registry) = build_dispatcher(
            &config,
            Arc::new(MetricsState::new()),
            Arc::new(EmailJobs::new()),
        )
        .unwrap();

        assert_eq!(registry.job_types(), vec![EMAIL_SEND, EMAIL_DIGEST, REPORT_GENERATE]);
        assert_eq!(dispatcher.queues(), ["default".to_string(), REPORTS_QUEUE.to_string()]);
        assert_eq!(dispatcher.pipeline().names(), vec!["metrics"]);
        assert_eq!(dispatcher.active_job_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_logger_drains_channel() {
        let sender = spawn_heartbeat_logger();
        for i in 0..(HEARTBEAT_BUFFER * 2) {
            sender
                .send(Heartbeat {
                    job_id: format!("job-{i}"),
                })
                .await
                .unwrap();
        }
        assert!(!sender.is_closed());
    }

    #[tokio::test]
    async fn test_seed_jobs_skips_rolled_back_email() {
        let client = Arc::new(MemoryClient::default());
        let metrics = Arc::new(MetricsState::new());
        let template = JobTemplate::new(client.clone(), "default").with_metrics(metrics.clone());
        let deferred = DeferredEnqueue::new(client.clone()).with_metrics(metrics.clone());

        seed_jobs(&deferred, &template).await.unwrap();

        let jobs = client.enqueued().await;
        let types: Vec<&str> = jobs.iter().map(|j| j.job_type.as_str()).collect();
        assert_eq!(types, vec![EMAIL_SEND, EMAIL_DIGEST, REPORT_GENERATE]);
        assert_eq!(jobs[0].arg::<String>("to").unwrap(), "new.user@example.com");
        assert_eq!(jobs[2].queue, REPORTS_QUEUE);
        assert!(jobs.iter().all(|j| j.state == JobState::Available));
        assert_eq!(metrics.enqueued(), 3);
    }
}
