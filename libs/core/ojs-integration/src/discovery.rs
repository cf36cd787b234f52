//! Turns application-provided candidates into handler descriptors.
//!
//! Candidates are listed explicitly at startup; discovery only reads their
//! declared metadata and never runs handler code, so scanning the same
//! candidate set twice yields the same descriptors.

use crate::handler::{BoundMethod, FnHandler, JobComponent, JobFn, JobHandler};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A job type bound to its invocable target and optional queue override.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub job_type: String,
    /// Name of the candidate that declared this handler.
    pub candidate: &'static str,
    pub queue: Option<String>,
    pub invoke: Arc<dyn JobHandler>,
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("job_type", &self.job_type)
            .field("candidate", &self.candidate)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

type Scan = Arc<dyn Fn() -> Vec<HandlerDescriptor> + Send + Sync>;

/// An object offered to discovery.
#[derive(Clone)]
pub struct Candidate {
    name: &'static str,
    scan: Scan,
}

impl Candidate {
    /// Method-level candidate: one descriptor per entry of the component's
    /// method table. Empty job types are passed through to registration.
    pub fn component<C: JobComponent>(component: Arc<C>) -> Self {
        let name = std::any::type_name::<C>();
        let scan: Scan = Arc::new(move || {
            C::job_methods()
                .into_iter()
                .map(|entry| HandlerDescriptor {
                    job_type: entry.metadata.resolve_job_type().to_string(),
                    candidate: name,
                    queue: entry.metadata.queue_override().map(str::to_string),
                    invoke: Arc::new(BoundMethod::new(component.clone(), entry.method)),
                })
                .collect()
        });

        Self { name, scan }
    }

    /// Class-level candidate: a single descriptor, or none when the handler's
    /// metadata resolves to an empty job type.
    pub fn handler<H: JobHandler>(handler: Arc<H>) -> Self {
        let name = std::any::type_name::<H>();
        let scan: Scan = Arc::new(move || {
            let metadata = handler.metadata();
            let job_type = metadata.resolve_job_type();
            if job_type.is_empty() {
                debug!(candidate = name, "Skipping handler without a job type");
                return Vec::new();
            }

            vec![HandlerDescriptor {
                job_type: job_type.to_string(),
                candidate: name,
                queue: metadata.queue_override().map(str::to_string),
                invoke: handler.clone(),
            }]
        });

        Self { name, scan }
    }

    /// Explicit `(job type, function)` pair.
    pub fn function(job_type: impl Into<String>, function: JobFn) -> Self {
        let job_type = job_type.into();
        let handler: Arc<dyn JobHandler> = Arc::new(FnHandler::new(job_type.clone(), function));
        let scan: Scan = Arc::new(move || {
            vec![HandlerDescriptor {
                job_type: job_type.clone(),
                candidate: "function",
                queue: None,
                invoke: handler.clone(),
            }]
        });

        Self {
            name: "function",
            scan,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Descriptors declared by this candidate.
    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        (self.scan)()
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate").field("name", &self.name).finish()
    }
}

/// Scan every candidate in order.
pub fn discover(candidates: &[Candidate]) -> Vec<HandlerDescriptor> {
    candidates
        .iter()
        .flat_map(|candidate| {
            let found = candidate.descriptors();
            debug!(
                candidate = candidate.name(),
                count = found.len(),
                "Scanned handler candidate"
            );
            found
        })
        .collect()
}
