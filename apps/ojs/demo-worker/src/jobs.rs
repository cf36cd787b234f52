//! Demo job handlers.
//!
//! `EmailJobs` declares its handlers method by method; `ReportJob` is a single
//! class-level handler with a queue override.

use async_trait::async_trait;
use ojs_integration::{
    HandlerError, HandlerMetadata, HandlerResult, JobComponent, JobContext, JobHandler, JobMethod,
    LIST_ARGS_KEY,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

pub const EMAIL_SEND: &str = "email.send";
pub const EMAIL_DIGEST: &str = "email.digest";
pub const REPORT_GENERATE: &str = "report.generate";
pub const REPORTS_QUEUE: &str = "reports";

#[derive(Debug, Deserialize)]
struct SendEmail {
    to: String,
    #[serde(default)]
    subject: String,
}

/// Email handlers. Sending is simulated.
#[derive(Debug, Default)]
pub struct EmailJobs {
    sent: AtomicU64,
}

impl EmailJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    async fn send(&self, ctx: &JobContext) -> HandlerResult {
        let email: SendEmail = serde_json::from_value(ctx.args_map().into())?;
        if email.to.is_empty() {
            return Err(HandlerError::failed("recipient must not be empty"));
        }

        let total = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        info!(job_id = %ctx.job_id(), to = %email.to, subject = %email.subject, "Sent email");
        Ok(json!({ "to": email.to, "sent_total": total }))
    }

    async fn digest(&self, ctx: &JobContext) -> HandlerResult {
        let recipients: Vec<String> = ctx.job().arg(LIST_ARGS_KEY)?;
        let recipients = recipients.len();
        info!(job_id = %ctx.job_id(), recipients, "Sent digest");
        Ok(json!({ "recipients": recipients }))
    }
}

impl JobComponent for EmailJobs {
    fn job_methods() -> Vec<JobMethod<Self>> {
        vec![
            JobMethod::new(HandlerMetadata::new(EMAIL_SEND), |this, ctx| {
                Box::pin(this.send(ctx))
            }),
            // Declared through the legacy alias only
            JobMethod::new(HandlerMetadata::legacy(EMAIL_DIGEST), |this, ctx| {
                Box::pin(this.digest(ctx))
            }),
        ]
    }
}

/// Builds a report in a few steps, heart-beating between them.
#[derive(Debug, Clone)]
pub struct ReportJob {
    step: Duration,
}

impl ReportJob {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }
}

#[async_trait]
impl JobHandler for ReportJob {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(REPORT_GENERATE).on_queue(REPORTS_QUEUE)
    }

    async fn execute(&self, ctx: &JobContext) -> HandlerResult {
        let report_id: String = ctx.job().arg("report_id")?;

        for page in 1..=3u32 {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled {
                    job_id: ctx.job_id().to_string(),
                });
            }
            tokio::time::sleep(self.step).await;
            ctx.heartbeat();
            info!(report_id = %report_id, page, "Rendered report page");
        }

        ctx.set_result(json!({ "report_id": report_id, "pages": 3 }));
        Ok(json!({ "report_id": report_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojs_integration::Job;
    use serde_json::Value;

    fn ctx(job_type: &str, args: Value) -> JobContext {
        JobContext::new(Job::new(job_type, "default", vec![args]))
    }

    #[tokio::test]
    async fn test_send_counts_and_validates() {
        let jobs = EmailJobs::new();
        let result = jobs
            .send(&ctx(EMAIL_SEND, json!({"to": "a@example.com"})))
            .await
            .unwrap();
        assert_eq!(result["sent_total"], 1);

        let err = jobs.send(&ctx(EMAIL_SEND, json!({"to": ""}))).await.unwrap_err();
        assert!(err.to_string().contains("recipient"));

        let err = jobs.send(&ctx(EMAIL_SEND, json!({}))).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArgs(_)));
        assert_eq!(jobs.sent(), 1);
    }

    #[tokio::test]
    async fn test_digest_counts_list_args() {
        let jobs = EmailJobs::new();
        let result = jobs
            .digest(&ctx(EMAIL_DIGEST, json!({"_args": ["a@example.com", "b@example.com"]})))
            .await
            .unwrap();
        assert_eq!(result["recipients"], 2);
    }

    #[test]
    fn test_method_table_resolves_legacy_alias() {
        let types: Vec<String> = EmailJobs::job_methods()
            .iter()
            .map(|m| m.metadata.resolve_job_type().to_string())
            .collect();
        assert_eq!(types, vec![EMAIL_SEND, EMAIL_DIGEST]);
    }

    #[tokio::test]
    async fn test_report_records_result() {
        let job = ReportJob::new(Duration::from_millis(1));
        let ctx = ctx(REPORT_GENERATE, json!({"report_id": "r-1"}));

        let result = job.execute(&ctx).await.unwrap();
        assert_eq!(result["report_id"], "r-1");
        assert_eq!(ctx.take_result().unwrap()["pages"], 3);
        assert_eq!(job.metadata().queue_override(), Some(REPORTS_QUEUE));
    }
}
