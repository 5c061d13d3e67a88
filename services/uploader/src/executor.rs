//! Multipart form submission and outcome classification.

use crate::job::JobRecord;
use crate::policy::{RetryPolicy, StatusAction};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Normalized outcome of one HTTP transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    /// HTTP status; `None` when no response was received
    pub status: Option<u16>,
    pub body: String,
    /// Reason phrase for the status, or the transport failure description
    pub reason: String,
    pub elapsed: Duration,
    pub url: String,
}

impl SubmitResponse {
    /// A submission that never produced an HTTP response
    pub fn transport_failure(url: impl Into<String>, reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: None,
            body: String::new(),
            reason: reason.into(),
            elapsed,
            url: url.into(),
        }
    }

    /// True when the HTTP transaction completed, whatever the status
    pub fn completed(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.status.map_or(false, |code| (200..300).contains(&code))
    }
}

/// Performs a single blocking multipart submission, without retries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FormSubmitter: Send + Sync {
    async fn submit(&self, job: &JobRecord, timeout: Duration) -> SubmitResponse;
}

/// [`FormSubmitter`] backed by a reqwest client
#[derive(Debug, Clone)]
pub struct HttpFormSubmitter {
    client: reqwest::Client,
}

impl HttpFormSubmitter {
    /// Create a submitter sending `Accept: */*` on every request
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("upload-queue/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    /// Build the form, reading every attachment from disk now
    async fn build_form(job: &JobRecord) -> Result<Form, String> {
        let mut form = Form::new();

        for (name, value) in &job.form_fields {
            form = form.text(name.clone(), value.clone());
        }

        for (name, file) in &job.file_fields {
            let data = tokio::fs::read(&file.path).await.map_err(|e| {
                format!("cannot read attachment '{}' for field '{}': {}", file.path, name, e)
            })?;

            let file_name = Path::new(&file.path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(name)
                .to_string();

            let part = Part::bytes(data)
                .file_name(file_name)
                .mime_str(&file.mime_type)
                .map_err(|e| format!("invalid mime type '{}' for field '{}': {}", file.mime_type, name, e))?;

            form = form.part(name.clone(), part);
        }

        Ok(form)
    }
}

#[async_trait]
impl FormSubmitter for HttpFormSubmitter {
    async fn submit(&self, job: &JobRecord, timeout: Duration) -> SubmitResponse {
        let started = Instant::now();

        let url = match target_url(&job.host, job.port) {
            Ok(url) => url,
            Err(reason) => return SubmitResponse::transport_failure(&job.host, reason, started.elapsed()),
        };

        let form = match Self::build_form(job).await {
            Ok(form) => form,
            Err(reason) => return SubmitResponse::transport_failure(url, reason, started.elapsed()),
        };

        let result = self
            .client
            .post(url.clone())
            .timeout(timeout)
            .multipart(form)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "Failed to read response body");
                        String::new()
                    }
                };

                SubmitResponse {
                    status: Some(status.as_u16()),
                    body,
                    reason: status.canonical_reason().unwrap_or_default().to_string(),
                    elapsed: started.elapsed(),
                    url: url.to_string(),
                }
            }
            Err(e) => SubmitResponse::transport_failure(
                url,
                describe_transport_error(&e, timeout),
                started.elapsed(),
            ),
        }
    }
}

/// Resolve a job's host and port into the URL to post to.
///
/// A host with a scheme is used as is; a bare host gets `https` on port 443
/// and `http` otherwise.
pub fn target_url(host: &str, port: u16) -> Result<Url, String> {
    let raw = if host.contains("://") {
        host.to_string()
    } else {
        let scheme = if port == 443 { "https" } else { "http" };
        format!("{scheme}://{host}")
    };

    let mut url = Url::parse(&raw).map_err(|e| format!("invalid host '{host}': {e}"))?;
    url.set_port(Some(port))
        .map_err(|_| format!("cannot set port {port} on '{host}'"))?;

    Ok(url)
}

fn describe_transport_error(e: &reqwest::Error, timeout: Duration) -> String {
    let mut message = if e.is_timeout() {
        format!("timed out after {:.1}s", timeout.as_secs_f64())
    } else if e.is_connect() {
        "connection failed".to_string()
    } else {
        "request failed".to_string()
    };

    let mut source: Option<&dyn std::error::Error> = Some(e);
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }

    message
}

/// Classified result of executing a job
#[derive(Debug, Clone)]
pub struct Execution {
    pub response: SubmitResponse,
    pub action: StatusAction,
    /// Classification followed by the transport reason, `"<class> | <reason>"`
    pub error_description: String,
}

impl Execution {
    pub fn retry_later(&self) -> bool {
        self.action == StatusAction::RetryLater
    }
}

/// Runs one submission and decides, through the retry policy, what happens next
pub struct UploadExecutor {
    submitter: Arc<dyn FormSubmitter>,
    policy: RetryPolicy,
}

impl UploadExecutor {
    pub fn new(submitter: Arc<dyn FormSubmitter>, policy: RetryPolicy) -> Self {
        Self { submitter, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submit a job once and classify the outcome
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    pub async fn execute(&self, job: &JobRecord, timeout: Duration, verbose: bool) -> Execution {
        info!(host = %job.host, port = job.port, "Starting job");

        let response = self.submitter.submit(job, timeout).await;
        let elapsed_secs = response.elapsed.as_secs_f64();
        metrics::histogram!("uploader.upload.duration_seconds").record(elapsed_secs);

        let classification = classify(response.status);

        if response.is_success() {
            info!(
                url = %response.url,
                status = response.status,
                elapsed_secs,
                "Job finished OK"
            );
        } else if response.completed() {
            error!(
                url = %response.url,
                status = response.status,
                reason = %classification,
                http_reason = %response.reason,
                elapsed_secs,
                "Job failed with server status"
            );
        } else {
            error!(
                url = %response.url,
                reason = %response.reason,
                elapsed_secs,
                "Job failed without a server response"
            );
        }

        if verbose || job.verbose {
            info!(response = %response.body, "Server response");
        } else {
            debug!(response = %response.body, "Server response");
        }

        let action = self.policy.action_for(response.status);
        let error_description = format!("{} | {}", classification, response.reason);

        Execution {
            response,
            action,
            error_description,
        }
    }
}

fn classify(status: Option<u16>) -> String {
    match status {
        Some(code) => StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {code}")),
        None => "No response from server".to_string(),
    }
}
