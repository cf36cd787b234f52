//! Startup registration of discovered handlers with a worker engine.

use crate::context::JobContext;
use crate::discovery::{discover, Candidate, HandlerDescriptor};
use crate::error::{HandlerError, RegistrationError};
use crate::handler::{HandlerResult, JobHandler};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

/// Dispatch table owned by a worker engine.
pub trait WorkerEngine {
    /// Register `handler` for `job_type`.
    ///
    /// Fails with [`RegistrationError::EmptyJobType`] when `job_type` is
    /// empty. Registering a type twice replaces the earlier handler.
    fn register(
        &mut self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistrationError>;
}

/// Converts a panic inside the wrapped handler into
/// [`HandlerError::Panicked`]. Errors returned by the handler pass through
/// untouched.
pub struct GuardedHandler {
    job_type: String,
    inner: Arc<dyn JobHandler>,
}

impl GuardedHandler {
    pub fn new(job_type: impl Into<String>, inner: Arc<dyn JobHandler>) -> Self {
        Self {
            job_type: job_type.into(),
            inner,
        }
    }
}

#[async_trait]
impl JobHandler for GuardedHandler {
    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        match AssertUnwindSafe(self.inner.execute(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::panicked(self.job_type.clone(), payload)),
        }
    }
}

/// The set of handlers registered at startup.
#[derive(Debug)]
pub struct HandlerRegistry {
    descriptors: Vec<HandlerDescriptor>,
}

impl HandlerRegistry {
    /// Discover handlers in `candidates` and register each one with `engine`,
    /// in discovery order.
    ///
    /// Call once during startup, before the engine starts fetching jobs. The
    /// first registration failure aborts initialization.
    pub fn initialize<E>(engine: &mut E, candidates: &[Candidate]) -> Result<Self, RegistrationError>
    where
        E: WorkerEngine + ?Sized,
    {
        let descriptors = discover(candidates);

        for descriptor in &descriptors {
            let guarded = GuardedHandler::new(descriptor.job_type.clone(), descriptor.invoke.clone());
            if let Err(e) = engine.register(&descriptor.job_type, Arc::new(guarded)) {
                error!(candidate = descriptor.candidate, error = %e, "Failed to register OJS job handler");
                return Err(e);
            }
            info!(
                job_type = %descriptor.job_type,
                queue = descriptor.queue.as_deref().unwrap_or("-"),
                candidate = descriptor.candidate,
                "Registered OJS job handler"
            );
        }

        info!(count = descriptors.len(), "OJS handler registration complete");
        Ok(Self { descriptors })
    }

    pub fn descriptors(&self) -> &[HandlerDescriptor] {
        &self.descriptors
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.job_type.as_str()).collect()
    }

    /// Declared queue overrides, deduplicated and sorted.
    pub fn queues(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .filter_map(|d| d.queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
