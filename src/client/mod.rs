//! Submission client abstraction over external batch-inference services.
//!
//! The orchestrator talks to the outside world exclusively through
//! [`SubmissionClient`]. The production implementation is
//! [`OpenAiBatchClient`]; tests use [`MockSubmissionClient`] with scripted
//! responses.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;
pub mod openai;

pub use mock::{MockCall, MockSubmissionClient};
pub use openai::OpenAiBatchClient;

/// Classified submission failure.
///
/// The classification drives orchestration policy: transient failures are
/// retried with backoff, size failures trigger a batch split, auth failures
/// abort the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The payload exceeded the service's size limit.
    #[error("payload exceeds the service size limit")]
    SizeExceeded,

    /// Network-level failure (timeout, connect, DNS).
    #[error("network failure: {0}")]
    NetworkTimeout(String),

    /// The service rejected the request due to rate limiting.
    #[error("rate limited by the service")]
    RateLimited,

    /// Credentials were rejected. Not retryable.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Anything the classifier could not place.
    #[error("unclassified submission failure: {0}")]
    Unknown(String),
}

impl SubmitError {
    /// Transient errors may succeed on retry without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubmitError::NetworkTimeout(_) | SubmitError::RateLimited
        )
    }
}

/// One request line of a batch job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    /// Request id unique within the job, echoed back in results.
    pub custom_id: String,
    /// Request body forwarded verbatim to the service.
    pub body: serde_json::Value,
}

/// Remote job status as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    InProgress { completed: usize, total: usize },
    Completed,
    Failed { reason: String },
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress { .. })
    }
}

/// One result row fetched from a completed job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub custom_id: String,
    /// The service payload, or the per-item error reported in its place.
    pub payload: std::result::Result<serde_json::Value, String>,
}

/// Stream of result rows from a completed job.
pub type ResultStream =
    Pin<Box<dyn Stream<Item = std::result::Result<JobResult, SubmitError>> + Send>>;

/// External batch-inference service.
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    /// Submit a payload, returning the external job id.
    async fn submit(&self, items: &[JobItem]) -> std::result::Result<String, SubmitError>;

    /// Poll the status of a previously submitted job.
    async fn poll_status(&self, job_id: &str) -> std::result::Result<JobStatus, SubmitError>;

    /// Fetch the results of a completed job.
    async fn fetch_results(&self, job_id: &str) -> std::result::Result<ResultStream, SubmitError>;
}

/// Outcome of waiting on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished(JobStatus),
    TimedOut,
}

/// Poll a job until it reaches a terminal status or the timeout elapses.
///
/// Transient poll errors are logged and retried on the next interval; only
/// non-transient errors propagate.
pub async fn wait_for_completion<C: SubmissionClient + ?Sized>(
    client: &C,
    job_id: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> std::result::Result<WaitOutcome, SubmitError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match client.poll_status(job_id).await {
            Ok(status) if status.is_terminal() => return Ok(WaitOutcome::Finished(status)),
            Ok(JobStatus::InProgress { completed, total }) => {
                tracing::debug!(job_id, completed, total, "job in progress");
            }
            Ok(_) => unreachable!("terminal statuses returned above"),
            Err(e) if e.is_transient() => {
                tracing::warn!(job_id, error = %e, "transient poll failure, will retry");
            }
            Err(e) => return Err(e),
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            return Ok(WaitOutcome::TimedOut);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SubmitError::RateLimited.is_transient());
        assert!(SubmitError::NetworkTimeout("timed out".into()).is_transient());
        assert!(!SubmitError::SizeExceeded.is_transient());
        assert!(!SubmitError::AuthFailed("401".into()).is_transient());
        assert!(!SubmitError::Unknown("?".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_finished_on_terminal_status() {
        let mock = MockSubmissionClient::new();
        mock.push_poll("job-1", JobStatus::InProgress { completed: 1, total: 3 });
        mock.push_poll("job-1", JobStatus::Completed);

        let outcome = wait_for_completion(
            &mock,
            "job-1",
            Duration::from_secs(600),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Finished(JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_on_stuck_job() {
        let mock = MockSubmissionClient::new();
        mock.push_poll("job-1", JobStatus::InProgress { completed: 0, total: 3 });

        let outcome = wait_for_completion(
            &mock,
            "job-1",
            Duration::from_secs(90),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
