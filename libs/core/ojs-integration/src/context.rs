//! Per-invocation execution context handed to handlers and middleware.

use crate::job::Job;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::Sender;

/// Signal sent to the worker engine when a handler calls
/// [`JobContext::heartbeat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub job_id: String,
}

/// Context for one job invocation.
///
/// Owned by the worker engine; handlers and middleware only borrow it.
#[derive(Debug)]
pub struct JobContext {
    job: Job,
    cancelled: Arc<AtomicBool>,
    heartbeat: Option<Sender<Heartbeat>>,
    result: Mutex<Option<Value>>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            cancelled: Arc::new(AtomicBool::new(false)),
            heartbeat: None,
            result: Mutex::new(None),
        }
    }

    /// Share a cancellation flag with the engine.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Route heartbeats to the engine's visibility-timeout tracker.
    ///
    /// The channel is bounded: heartbeats sent while it is full are dropped.
    pub fn with_heartbeat(mut self, sender: Sender<Heartbeat>) -> Self {
        self.heartbeat = Some(sender);
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn args(&self) -> &[Value] {
        &self.job.args
    }

    pub fn args_map(&self) -> Map<String, Value> {
        self.job.args_map()
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.job.meta
    }

    /// Extend the job's visibility timeout. Never blocks; a missing, full or
    /// closed channel is ignored.
    pub fn heartbeat(&self) {
        if let Some(sender) = &self.heartbeat {
            let _ = sender.try_send(Heartbeat {
                job_id: self.job.id.clone(),
            });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record the job's outcome. A later call replaces an earlier one.
    pub fn set_result(&self, value: Value) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub fn take_result(&self) -> Option<Value> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn context() -> JobContext {
        JobContext::new(Job::new("email.send", "mail", vec![json!({"to": "a@b.c"})]))
    }

    #[test]
    fn test_accessors_read_through_to_job() {
        let ctx = context();
        assert_eq!(ctx.job_type(), "email.send");
        assert_eq!(ctx.queue(), "mail");
        assert_eq!(ctx.attempt(), 0);
        assert_eq!(ctx.args().len(), 1);
        assert_eq!(ctx.args_map().get("to"), Some(&json!("a@b.c")));
        assert!(ctx.meta().is_empty());
        assert_eq!(ctx.job_id(), ctx.job().id);
    }

    #[test]
    fn test_heartbeat_without_channel_is_noop() {
        context().heartbeat();
    }

    #[test]
    fn test_heartbeat_sends_job_id() {
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = context().with_heartbeat(tx);
        ctx.heartbeat();
        ctx.heartbeat();

        assert_eq!(rx.try_recv().unwrap().job_id, ctx.job_id());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_heartbeat_ignores_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        context().with_heartbeat(tx).heartbeat();
    }

    #[test]
    fn test_heartbeat_drops_when_channel_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = context().with_heartbeat(tx);
        ctx.heartbeat();
        ctx.heartbeat();
        ctx.heartbeat();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = context().with_cancellation(flag.clone());
        assert!(!ctx.is_cancelled());

        flag.store(true, Ordering::Release);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_result_round_trip() {
        let ctx = context();
        assert_eq!(ctx.take_result(), None);

        ctx.set_result(json!({"sent": 1}));
        ctx.set_result(json!({"sent": 2}));
        assert_eq!(ctx.take_result(), Some(json!({"sent": 2})));
        assert_eq!(ctx.take_result(), None);
    }
}
