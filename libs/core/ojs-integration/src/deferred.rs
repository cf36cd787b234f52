//! Enqueue that waits for the surrounding transaction to commit.

use crate::client::JobQueueClient;
use crate::error::ClientError;
use crate::job::Job;
use crate::metrics::MetricsState;
use crate::transaction::TransactionContext;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// What [`DeferredEnqueue::after_commit`] did with the request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// No transaction was active; the job was enqueued right away.
    Enqueued(Job),
    /// The enqueue will run when the transaction commits.
    Deferred,
}

impl EnqueueOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred)
    }

    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Enqueued(job) => Some(job),
            Self::Deferred => None,
        }
    }
}

/// Routes enqueue requests either straight to the client or to the commit
/// hook of an active transaction.
#[derive(Clone)]
pub struct DeferredEnqueue {
    client: Arc<dyn JobQueueClient>,
    metrics: Option<Arc<MetricsState>>,
}

impl DeferredEnqueue {
    pub fn new(client: Arc<dyn JobQueueClient>) -> Self {
        Self {
            client,
            metrics: None,
        }
    }

    /// Count successful enqueues in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsState>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enqueue `job_type` with `args` now, or once `tx` commits.
    ///
    /// With a transaction, nothing reaches the client until commit, and a
    /// rollback drops the request. Client failures at commit time propagate to
    /// whoever drives the commit.
    pub async fn after_commit(
        &self,
        tx: Option<&dyn TransactionContext>,
        job_type: &str,
        args: Map<String, Value>,
    ) -> Result<EnqueueOutcome, ClientError> {
        match tx {
            None => {
                let job = enqueue(&self.client, self.metrics.as_deref(), job_type, args).await?;
                debug!(job_type, job_id = %job.id, "Enqueued job immediately");
                Ok(EnqueueOutcome::Enqueued(job))
            }
            Some(tx) => {
                debug!(job_type, "Deferring enqueue until commit");
                let client = self.client.clone();
                let metrics = self.metrics.clone();
                let job_type = job_type.to_string();

                tx.register_after_commit(Box::new(
                    move || -> BoxFuture<'static, Result<(), ClientError>> {
                        Box::pin(async move {
                            let job = enqueue(&client, metrics.as_deref(), &job_type, args).await?;
                            info!(job_type = %job_type, job_id = %job.id, "Enqueued job after commit");
                            Ok(())
                        })
                    },
                ));
                Ok(EnqueueOutcome::Deferred)
            }
        }
    }
}

async fn enqueue(
    client: &Arc<dyn JobQueueClient>,
    metrics: Option<&MetricsState>,
    job_type: &str,
    args: Map<String, Value>,
) -> Result<Job, ClientError> {
    let job = client.enqueue(job_type, args).await?;
    if let Some(metrics) = metrics {
        metrics.record_enqueue();
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockJobQueueClient;
    use crate::transaction::TransactionScope;
    use mockall::predicate::eq;
    use serde_json::json;

    fn args() -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("to".into(), json!("user@example.com"));
        args
    }

    fn expect_enqueue(mock: &mut MockJobQueueClient, times: usize) {
        mock.expect_enqueue()
            .with(eq("email.send"), eq(args()))
            .times(times)
            .returning(|job_type, args| Ok(Job::new(job_type, "default", vec![Value::Object(args)])));
    }

    #[tokio::test]
    async fn test_without_transaction_enqueues_immediately() {
        let mut mock = MockJobQueueClient::new();
        expect_enqueue(&mut mock, 1);
        let metrics = Arc::new(MetricsState::new());
        let deferred = DeferredEnqueue::new(Arc::new(mock)).with_metrics(metrics.clone());

        let outcome = deferred.after_commit(None, "email.send", args()).await.unwrap();
        assert_eq!(outcome.job().unwrap().job_type, "email.send");
        assert_eq!(metrics.enqueued(), 1);
    }

    #[tokio::test]
    async fn test_with_transaction_waits_for_commit() {
        let mut mock = MockJobQueueClient::new();
        expect_enqueue(&mut mock, 1);
        let metrics = Arc::new(MetricsState::new());
        let deferred = DeferredEnqueue::new(Arc::new(mock)).with_metrics(metrics.clone());
        let tx = TransactionScope::new();

        let outcome = deferred
            .after_commit(Some(&tx), "email.send", args())
            .await
            .unwrap();
        assert!(outcome.is_deferred());
        assert_eq!(tx.pending(), 1);
        assert_eq!(metrics.enqueued(), 0);

        tx.commit().await.unwrap();
        assert_eq!(metrics.enqueued(), 1);
    }

    #[tokio::test]
    async fn test_rollback_never_enqueues() {
        let mut mock = MockJobQueueClient::new();
        mock.expect_enqueue().never();
        let deferred = DeferredEnqueue::new(Arc::new(mock));
        let tx = TransactionScope::new();

        deferred
            .after_commit(Some(&tx), "email.send", args())
            .await
            .unwrap();
        tx.rollback();
    }

    #[tokio::test]
    async fn test_immediate_failure_propagates() {
        let mut mock = MockJobQueueClient::new();
        mock.expect_enqueue()
            .returning(|_, _| Err(ClientError::Unavailable("connection refused".into())));
        let metrics = Arc::new(MetricsState::new());
        let deferred = DeferredEnqueue::new(Arc::new(mock)).with_metrics(metrics.clone());

        let err = deferred.after_commit(None, "email.send", args()).await.unwrap_err();
        assert!(matches!(err, ClientError::Unavailable(_)));
        assert_eq!(metrics.enqueued(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_propagates_to_committer() {
        let mut mock = MockJobQueueClient::new();
        mock.expect_enqueue()
            .times(1)
            .returning(|_, _| Err(ClientError::Rejected("duplicate".into())));
        let deferred = DeferredEnqueue::new(Arc::new(mock));
        let tx = TransactionScope::new();

        deferred
            .after_commit(Some(&tx), "email.send", args())
            .await
            .unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
    }
}
