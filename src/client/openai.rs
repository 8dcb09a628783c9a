//! OpenAI Batch API implementation of [`SubmissionClient`].
//!
//! Submit uploads a JSONL payload file, then creates a batch job referencing
//! it. Results come back as a JSONL output file keyed by `custom_id`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{JobItem, JobResult, JobStatus, ResultStream, SubmissionClient, SubmitError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_ENDPOINT: &str = "/v1/chat/completions";
const DEFAULT_COMPLETION_WINDOW: &str = "24h";

#[derive(Debug, Deserialize)]
struct FileResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    request_counts: Option<RequestCounts>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RequestCounts {
    #[serde(default)]
    completed: usize,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct OutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<OutputResponse>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

/// Client for the OpenAI Batch API.
pub struct OpenAiBatchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    endpoint: String,
    completion_window: String,
}

impl OpenAiBatchClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Result<Self, SubmitError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SubmitError::Unknown(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            completion_window: DEFAULT_COMPLETION_WINDOW.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn classify_transport(e: reqwest::Error) -> SubmitError {
        if e.is_timeout() || e.is_connect() {
            SubmitError::NetworkTimeout(e.to_string())
        } else {
            SubmitError::Unknown(e.to_string())
        }
    }

    async fn classify_response(resp: reqwest::Response) -> SubmitError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SubmitError::AuthFailed(body),
            StatusCode::TOO_MANY_REQUESTS => SubmitError::RateLimited,
            StatusCode::PAYLOAD_TOO_LARGE => SubmitError::SizeExceeded,
            _ if body.to_lowercase().contains("too large") => SubmitError::SizeExceeded,
            _ => SubmitError::Unknown(format!("{status}: {body}")),
        }
    }

    async fn upload_payload(&self, items: &[JobItem]) -> Result<String, SubmitError> {
        let mut jsonl = String::new();
        for item in items {
            let line = json!({
                "custom_id": item.custom_id,
                "method": "POST",
                "url": self.endpoint,
                "body": item.body,
            });
            jsonl.push_str(&line.to_string());
            jsonl.push('\n');
        }

        let part = reqwest::multipart::Part::text(jsonl)
            .file_name("payload.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| SubmitError::Unknown(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let resp = self
            .http
            .post(self.url("/v1/files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(Self::classify_transport)?;
        if !resp.status().is_success() {
            return Err(Self::classify_response(resp).await);
        }
        let file: FileResponse = resp
            .json()
            .await
            .map_err(|e| SubmitError::Unknown(e.to_string()))?;
        Ok(file.id)
    }

    async fn get_batch(&self, job_id: &str) -> Result<BatchResponse, SubmitError> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/batches/{job_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::classify_transport)?;
        if !resp.status().is_success() {
            return Err(Self::classify_response(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| SubmitError::Unknown(e.to_string()))
    }

    async fn download_file(&self, file_id: &str) -> Result<String, SubmitError> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/files/{file_id}/content")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::classify_transport)?;
        if !resp.status().is_success() {
            return Err(Self::classify_response(resp).await);
        }
        resp.text()
            .await
            .map_err(|e| SubmitError::Unknown(e.to_string()))
    }

    fn parse_output_line(line: &str) -> Result<JobResult, SubmitError> {
        let row: OutputLine = serde_json::from_str(line)
            .map_err(|e| SubmitError::Unknown(format!("unparseable result line: {e}")))?;
        let payload = if let Some(error) = row.error {
            Err(error.to_string())
        } else {
            match row.response {
                Some(resp) if resp.status_code.is_none_or(|c| c < 400) => {
                    resp.body.ok_or("empty response body".to_string())
                }
                Some(resp) => Err(format!(
                    "request failed with status {}",
                    resp.status_code.unwrap_or(0)
                )),
                None => Err("missing response".to_string()),
            }
        };
        Ok(JobResult {
            custom_id: row.custom_id,
            payload,
        })
    }
}

#[async_trait]
impl SubmissionClient for OpenAiBatchClient {
    async fn submit(&self, items: &[JobItem]) -> Result<String, SubmitError> {
        let input_file_id = self.upload_payload(items).await?;
        tracing::debug!(%input_file_id, items = items.len(), "payload uploaded");

        let resp = self
            .http
            .post(self.url("/v1/batches"))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "input_file_id": input_file_id,
                "endpoint": self.endpoint,
                "completion_window": self.completion_window,
            }))
            .send()
            .await
            .map_err(Self::classify_transport)?;
        if !resp.status().is_success() {
            return Err(Self::classify_response(resp).await);
        }
        let batch: BatchResponse = resp
            .json()
            .await
            .map_err(|e| SubmitError::Unknown(e.to_string()))?;
        tracing::info!(job_id = %batch.id, items = items.len(), "batch job created");
        Ok(batch.id)
    }

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus, SubmitError> {
        let batch = self.get_batch(job_id).await?;
        let status = match batch.status.as_str() {
            "completed" => JobStatus::Completed,
            "failed" | "cancelled" | "cancelling" => JobStatus::Failed {
                reason: batch
                    .errors
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| batch.status.clone()),
            },
            "expired" => JobStatus::Expired,
            _ => {
                let counts = batch.request_counts.unwrap_or_default();
                JobStatus::InProgress {
                    completed: counts.completed,
                    total: counts.total,
                }
            }
        };
        Ok(status)
    }

    async fn fetch_results(&self, job_id: &str) -> Result<ResultStream, SubmitError> {
        let batch = self.get_batch(job_id).await?;
        let mut rows = Vec::new();
        // Successful rows land in the output file, per-request failures in
        // the error file. Both are keyed by custom_id.
        for file_id in [batch.output_file_id, batch.error_file_id]
            .into_iter()
            .flatten()
        {
            let content = self.download_file(&file_id).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                rows.push(Self::parse_output_line(line));
            }
        }
        Ok(Box::pin(stream::iter(rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_line_with_body_parses_as_payload() {
        let line = r#"{"custom_id":"b_0000","response":{"status_code":200,"body":{"choices":[]}}}"#;
        let result = OpenAiBatchClient::parse_output_line(line).unwrap();
        assert_eq!(result.custom_id, "b_0000");
        assert!(result.payload.is_ok());
    }

    #[test]
    fn output_line_with_error_parses_as_failure() {
        let line = r#"{"custom_id":"b_0001","error":{"message":"server_error"}}"#;
        let result = OpenAiBatchClient::parse_output_line(line).unwrap();
        assert!(result.payload.unwrap_err().contains("server_error"));
    }

    #[test]
    fn output_line_with_http_failure_status() {
        let line = r#"{"custom_id":"b_0002","response":{"status_code":500}}"#;
        let result = OpenAiBatchClient::parse_output_line(line).unwrap();
        assert!(result.payload.unwrap_err().contains("500"));
    }
}
