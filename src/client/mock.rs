//! Scripted mock submission client for tests.
//!
//! Responses are pushed in advance and consumed FIFO; calls are recorded so
//! tests can assert on exactly what the orchestrator sent.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use super::{JobItem, JobResult, JobStatus, ResultStream, SubmissionClient, SubmitError};

/// A recorded call made against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Submit { custom_ids: Vec<String> },
    Poll { job_id: String },
    Fetch { job_id: String },
}

#[derive(Default)]
struct Inner {
    submit_responses: VecDeque<Result<String, SubmitError>>,
    poll_responses: HashMap<String, VecDeque<Result<JobStatus, SubmitError>>>,
    results: HashMap<String, Vec<JobResult>>,
    calls: Vec<MockCall>,
}

/// Mock [`SubmissionClient`] with scripted responses and call recording.
#[derive(Clone, Default)]
pub struct MockSubmissionClient {
    inner: Arc<Mutex<Inner>>,
}

impl MockSubmissionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next submit call to succeed with the given job id.
    pub fn push_submit_ok(&self, job_id: impl Into<String>) {
        self.inner.lock().submit_responses.push_back(Ok(job_id.into()));
    }

    /// Script the next submit call to fail.
    pub fn push_submit_err(&self, err: SubmitError) {
        self.inner.lock().submit_responses.push_back(Err(err));
    }

    /// Script a poll response for a job. The last response for a job is
    /// sticky: once the queue is down to one entry it is repeated.
    pub fn push_poll(&self, job_id: impl Into<String>, status: JobStatus) {
        self.inner
            .lock()
            .poll_responses
            .entry(job_id.into())
            .or_default()
            .push_back(Ok(status));
    }

    /// Script a poll failure for a job.
    pub fn push_poll_err(&self, job_id: impl Into<String>, err: SubmitError) {
        self.inner
            .lock()
            .poll_responses
            .entry(job_id.into())
            .or_default()
            .push_back(Err(err));
    }

    /// Set the results a completed job will return.
    pub fn set_results(&self, job_id: impl Into<String>, results: Vec<JobResult>) {
        self.inner.lock().results.insert(job_id.into(), results);
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().calls.clone()
    }

    /// Number of submit calls recorded.
    pub fn submit_count(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Submit { .. }))
            .count()
    }
}

#[async_trait]
impl SubmissionClient for MockSubmissionClient {
    async fn submit(&self, items: &[JobItem]) -> Result<String, SubmitError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Submit {
            custom_ids: items.iter().map(|i| i.custom_id.clone()).collect(),
        });
        inner
            .submit_responses
            .pop_front()
            .unwrap_or_else(|| Err(SubmitError::Unknown("no scripted submit response".into())))
    }

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus, SubmitError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Poll {
            job_id: job_id.to_string(),
        });
        let queue = inner
            .poll_responses
            .get_mut(job_id)
            .ok_or_else(|| SubmitError::Unknown(format!("no scripted polls for {job_id}")))?;
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| SubmitError::Unknown(format!("no scripted polls for {job_id}")))?
        }
    }

    async fn fetch_results(&self, job_id: &str) -> Result<ResultStream, SubmitError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Fetch {
            job_id: job_id.to_string(),
        });
        let results = inner
            .results
            .get(job_id)
            .cloned()
            .ok_or_else(|| SubmitError::Unknown(format!("no scripted results for {job_id}")))?;
        Ok(Box::pin(stream::iter(results.into_iter().map(Ok))))
    }
}
