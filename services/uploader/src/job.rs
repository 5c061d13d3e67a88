//! Upload jobs and the results produced by executing them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// MIME type used for file fields added without an explicit one
pub const DEFAULT_MIME_TYPE: &str = "text/plain";

/// Errors raised while building or validating a job
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job host is empty")]
    EmptyHost,

    #[error("Form field name is empty")]
    EmptyFieldName,

    #[error("Form field '{0}' has an empty value")]
    EmptyFieldValue(String),

    #[error("Form field '{0}' already exists")]
    DuplicateField(String),

    #[error("File field '{field}' has an empty {part}")]
    IncompleteFile { field: String, part: &'static str },

    #[error("File field '{0}' already exists")]
    DuplicateFile(String),
}

/// A file attached to a job, read from disk when the job executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: String,
    pub mime_type: String,
}

/// One multipart form submission plus its retry bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// Target host or URL
    pub host: String,
    pub port: u16,
    /// Caller correlation key, handed back in the execution result
    pub job_id: String,
    /// Field name -> value
    pub form_fields: BTreeMap<String, String>,
    /// Field name -> attached file
    pub file_fields: BTreeMap<String, FileAttachment>,
    /// Creation time, seconds since epoch
    pub timestamp: i64,
    pub verbose: bool,
    /// Failed retries from the failed store so far
    pub num_tries: u32,
}

impl JobRecord {
    /// Start building a job for `host:port`
    pub fn builder(host: impl Into<String>, port: u16, job_id: impl Into<String>) -> JobBuilder {
        JobBuilder::new(host, port, job_id)
    }

    /// Check that no part of the job is empty.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.host.is_empty() {
            return Err(JobError::EmptyHost);
        }

        for (name, value) in &self.form_fields {
            check_field(name, value)?;
        }

        for (name, file) in &self.file_fields {
            check_file(name, &file.path, &file.mime_type)?;
        }

        Ok(())
    }

    /// Paths of every attached file
    pub fn attachment_paths(&self) -> impl Iterator<Item = &str> {
        self.file_fields.values().map(|f| f.path.as_str())
    }
}

fn check_field(name: &str, value: &str) -> Result<(), JobError> {
    if name.is_empty() {
        return Err(JobError::EmptyFieldName);
    }
    if value.is_empty() {
        return Err(JobError::EmptyFieldValue(name.to_string()));
    }
    Ok(())
}

fn check_file(name: &str, path: &str, mime_type: &str) -> Result<(), JobError> {
    let missing = if name.is_empty() {
        Some("field name")
    } else if path.is_empty() {
        Some("path")
    } else if mime_type.is_empty() {
        Some("mime type")
    } else {
        None
    };

    match missing {
        Some(part) => Err(JobError::IncompleteFile {
            field: name.to_string(),
            part,
        }),
        None => Ok(()),
    }
}

/// Builder for [`JobRecord`]; rejects duplicate and empty entries
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job: JobRecord,
}

impl JobBuilder {
    /// Create a new job builder stamped with the current time
    pub fn new(host: impl Into<String>, port: u16, job_id: impl Into<String>) -> Self {
        Self {
            job: JobRecord {
                host: host.into(),
                port,
                job_id: job_id.into(),
                form_fields: BTreeMap::new(),
                file_fields: BTreeMap::new(),
                timestamp: Utc::now().timestamp(),
                verbose: false,
                num_tries: 0,
            },
        }
    }

    /// Add a string form field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self, JobError> {
        let name = name.into();
        let value = value.into();
        check_field(&name, &value)?;

        if self.job.form_fields.contains_key(&name) {
            return Err(JobError::DuplicateField(name));
        }
        self.job.form_fields.insert(name, value);
        Ok(self)
    }

    /// Attach a file with the default `text/plain` MIME type
    pub fn file(self, name: impl Into<String>, path: impl Into<String>) -> Result<Self, JobError> {
        self.file_with_mime(name, path, DEFAULT_MIME_TYPE)
    }

    /// Attach a file with an explicit MIME type
    pub fn file_with_mime(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Result<Self, JobError> {
        let name = name.into();
        let attachment = FileAttachment {
            path: path.into(),
            mime_type: mime_type.into(),
        };
        check_file(&name, &attachment.path, &attachment.mime_type)?;

        if self.job.file_fields.contains_key(&name) {
            return Err(JobError::DuplicateFile(name));
        }
        self.job.file_fields.insert(name, attachment);
        Ok(self)
    }

    /// Log the full server response when this job executes
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.job.verbose = verbose;
        self
    }

    /// Override the creation timestamp
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.job.timestamp = timestamp;
        self
    }

    /// Build the job
    pub fn build(self) -> Result<JobRecord, JobError> {
        self.job.validate()?;
        Ok(self.job)
    }
}

/// How an executed attempt was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Server accepted the upload; job and attachments removed
    Delivered,
    /// Server rejected the upload for good; job and attachments removed
    Rejected,
    /// Attempt failed; job kept in the failed store for a later retry
    RetryScheduled,
    /// Retry budget exhausted; job and attachments removed
    Abandoned,
}

/// Result of one executed attempt, drained by the owning application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobExecutionResult {
    pub job_id: String,
    /// True only when the upload was delivered
    pub ok: bool,
    /// True when the attempt came from the pending store
    pub is_fresh_attempt: bool,
    pub outcome: JobOutcome,
    pub server_response_body: String,
    /// HTTP status, `None` when no response was received
    pub server_status_code: Option<u16>,
    pub error_description: String,
}
