//! OJS job-handler integration layer.
//!
//! Wires application-declared job handlers into a worker, applies
//! cross-cutting middleware around every invocation, and defers enqueues
//! until the surrounding transaction commits.
//!
//! # Architecture
//!
//! ```text
//!  startup                                  runtime
//! ┌────────────┐  discover  ┌────────────┐  fetch   ┌──────────────┐
//! │ Candidates │──────────▶│  Registry  │────────▶│  Dispatcher  │
//! │ (handlers) │           └─────┬──────┘ register │ (WorkerEngine)│
//! └────────────┘                 │                 └──────┬───────┘
//!                                ▼                        │ per job
//!                        HandlerDescriptor                ▼
//!                                                 ┌──────────────┐
//!                                                 │   Pipeline   │
//!                                                 │ metrics, ... │
//!                                                 └──────┬───────┘
//!                                                        ▼
//!                                                     handler
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ojs_integration::*;
//!
//! let config = OjsConfig::from_env()?;
//! let metrics = Arc::new(MetricsState::new());
//!
//! let mut dispatcher = Dispatcher::from_config(&config);
//! dispatcher.use_middleware(Arc::new(MetricsMiddleware::new(metrics.clone())));
//!
//! let registry = HandlerRegistry::initialize(
//!     &mut dispatcher,
//!     &[
//!         Candidate::component(Arc::new(EmailJobs::new(mailer))),
//!         Candidate::handler(Arc::new(ReportJob)),
//!     ],
//! )?;
//!
//! // Enqueue once the order row is committed
//! let deferred = DeferredEnqueue::new(client.clone()).with_metrics(metrics);
//! deferred.after_commit(Some(&tx), "email.send", args).await?;
//! tx.commit().await?;
//! ```

mod client;
mod config;
mod context;
mod deferred;
mod discovery;
mod dispatcher;
mod error;
mod handler;
mod health;
mod job;
mod memory;
pub mod metrics;
mod middleware;
mod registry;
mod template;
mod transaction;

pub use client::{JobQueueClient, QueueInfo};
pub use config::{Backoff, OjsConfig, RetrySettings, WorkerSettings, DEFAULT_QUEUE, DEFAULT_URL};
pub use context::{Heartbeat, JobContext};
pub use deferred::{DeferredEnqueue, EnqueueOutcome};
pub use discovery::{discover, Candidate, HandlerDescriptor};
pub use dispatcher::{Dispatcher, JobSource};
pub use error::{ClientError, HandlerError, RegistrationError};
pub use handler::{
    BoundMethod, FnHandler, HandlerMetadata, HandlerResult, JobComponent, JobFn, JobHandler,
    JobMethod, JobMethodFn,
};
pub use health::{
    health_handler, health_router, metrics_handler, Health, HealthIndicator, HealthStatus,
    WorkerState, WorkerStatus,
};
pub use job::{Job, JobRequest, JobState, LIST_ARGS_KEY};
pub use memory::MemoryClient;
pub use self::metrics::{JobTypeSnapshot, MetricsMiddleware, MetricsSnapshot, MetricsState};
pub use middleware::{Middleware, Next, Pipeline};
pub use registry::{GuardedHandler, HandlerRegistry, WorkerEngine};
pub use template::JobTemplate;
pub use transaction::{AfterCommit, TransactionContext, TransactionScope};

// Handler signatures use this type.
pub use futures::future::BoxFuture;
