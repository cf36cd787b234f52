//! Handler capabilities and the metadata they declare.
//!
//! Two shapes are supported:
//! - class-level: a type implementing [`JobHandler`] whose
//!   [`metadata`](JobHandler::metadata) names the job type it executes;
//! - method-level: a type implementing [`JobComponent`] that lists any number
//!   of `(metadata, method)` pairs in a static table.
//!
//! Plain functions can also be registered through [`FnHandler`].

use crate::context::JobContext;
use crate::error::HandlerError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// Result of one job invocation.
pub type HandlerResult = Result<Value, HandlerError>;

/// Method-level handler: a method on `C` taking the invocation context.
pub type JobMethodFn<C> = for<'a> fn(&'a C, &'a JobContext) -> BoxFuture<'a, HandlerResult>;

/// Free-function handler.
pub type JobFn = for<'a> fn(&'a JobContext) -> BoxFuture<'a, HandlerResult>;

/// Declared handler metadata.
///
/// `job_type` is the primary field and `value` the legacy alias; see
/// [`resolve_job_type`](Self::resolve_job_type).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerMetadata {
    pub job_type: String,
    pub value: String,
    pub queue: String,
}

impl HandlerMetadata {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    /// Metadata that only sets the legacy alias.
    pub fn legacy(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// `job_type` when non-empty, otherwise `value`; empty when both are.
    pub fn resolve_job_type(&self) -> &str {
        if self.job_type.is_empty() {
            &self.value
        } else {
            &self.job_type
        }
    }

    /// Queue override, if one was declared.
    pub fn queue_override(&self) -> Option<&str> {
        (!self.queue.is_empty()).then_some(self.queue.as_str())
    }
}

/// Class-level handler capability.
///
/// # Example
///
/// ```rust,ignore
/// struct ReportJob;
///
/// #[async_trait]
/// impl JobHandler for ReportJob {
///     fn metadata(&self) -> HandlerMetadata {
///         HandlerMetadata::new("report.generate").on_queue("reports")
///     }
///
///     async fn execute(&self, ctx: &JobContext) -> HandlerResult {
///         let id: String = ctx.job().arg("report_id")?;
///         Ok(json!({ "report_id": id }))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Declared metadata. Types without it are skipped by discovery.
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::default()
    }

    async fn execute(&self, ctx: &JobContext) -> HandlerResult;
}

/// One entry of a [`JobComponent`]'s method table.
pub struct JobMethod<C> {
    pub metadata: HandlerMetadata,
    pub method: JobMethodFn<C>,
}

impl<C> JobMethod<C> {
    pub fn new(metadata: HandlerMetadata, method: JobMethodFn<C>) -> Self {
        Self { metadata, method }
    }
}

impl<C> Clone for JobMethod<C> {
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            method: self.method,
        }
    }
}

/// Method-level handler provider.
///
/// ```rust,ignore
/// impl JobComponent for EmailJobs {
///     fn job_methods() -> Vec<JobMethod<Self>> {
///         vec![JobMethod::new(HandlerMetadata::new("email.send"), |this, ctx| {
///             Box::pin(this.send(ctx))
///         })]
///     }
/// }
/// ```
pub trait JobComponent: Send + Sync + Sized + 'static {
    fn job_methods() -> Vec<JobMethod<Self>>;
}

/// A method bound to its receiving component.
pub struct BoundMethod<C> {
    receiver: Arc<C>,
    method: JobMethodFn<C>,
}

impl<C> BoundMethod<C> {
    pub fn new(receiver: Arc<C>, method: JobMethodFn<C>) -> Self {
        Self { receiver, method }
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> JobHandler for BoundMethod<C> {
    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        (self.method)(&self.receiver, ctx).await
    }
}

/// A free function registered under an explicit job type.
pub struct FnHandler {
    metadata: HandlerMetadata,
    function: JobFn,
}

impl FnHandler {
    pub fn new(job_type: impl Into<String>, function: JobFn) -> Self {
        Self {
            metadata: HandlerMetadata::new(job_type),
            function,
        }
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    fn metadata(&self) -> HandlerMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        (self.function)(ctx).await
    }
}
