//! Composable interceptors around every job invocation.

use crate::context::JobContext;
use crate::handler::{HandlerResult, JobHandler};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A cross-cutting behavior wrapped around handler execution.
///
/// Implementations call [`Next::run`] at most once; `Next` is consumed by the
/// call. Skipping it short-circuits the rest of the chain. Errors returned by
/// `next` are propagated unchanged once any bookkeeping is done.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &JobContext, next: Next<'_>) -> HandlerResult;

    /// Used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The remainder of the pipeline, ending in the handler.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn JobHandler,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], handler: &'a dyn JobHandler) -> Self {
        Self { chain, handler }
    }

    pub async fn run(self, ctx: &JobContext) -> HandlerResult {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(ctx, Next::new(rest, self.handler)).await,
            None => self.handler.execute(ctx).await,
        }
    }
}

/// Ordered middleware chain. The first middleware added is the outermost.
#[derive(Clone, Default)]
pub struct Pipeline {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Run `handler` for `ctx` through every middleware.
    pub async fn invoke(&self, ctx: &JobContext, handler: &dyn JobHandler) -> HandlerResult {
        Next::new(&self.middleware, handler).run(ctx).await
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("middleware", &self.names())
            .finish()
    }
}
