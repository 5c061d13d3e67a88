//! On-disk job store.
//!
//! Every job lives in its own `.job` file under one of two directories:
//!
//! ```text
//! {storage_dir}/
//!   pending/   jobs not attempted yet, executed oldest first
//!   failed/    jobs that failed at least once, retried in random order
//! ```
//!
//! File names are `t{timestamp}_{job_id}_{uuid}.job`, so a lexicographic sort
//! of the pending directory yields creation order.

use crate::job::{FileAttachment, JobError, JobRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Extension of job files; anything else in the store directories is ignored
pub const JOB_FILE_EXTENSION: &str = "job";

const PENDING_DIR: &str = "pending";
const FAILED_DIR: &str = "failed";
const TMP_EXTENSION: &str = "tmp";

/// Errors that can occur while reading or writing job files
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize job: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt job file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Invalid job: {0}")]
    InvalidJob(#[from] JobError),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True when the file itself is unusable and retrying the read cannot help
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Which store directory a job comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Pending,
    Failed,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Pending => PENDING_DIR,
            JobSource::Failed => FAILED_DIR,
        }
    }
}

/// Serialized form of a job file
#[derive(Debug, Serialize, Deserialize)]
struct JobFile {
    config: JobFileConfig,
    #[serde(default)]
    fields: Vec<FieldEntry>,
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobFileConfig {
    #[serde(default)]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_job_id")]
    job_id: String,
    #[serde(default = "default_timestamp")]
    timestamp: i64,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    num_tries: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    #[serde(default)]
    field_name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    mime_type: String,
}

fn default_port() -> u16 {
    80
}

fn default_job_id() -> String {
    "missing job id".to_string()
}

fn default_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

impl From<&JobRecord> for JobFile {
    fn from(job: &JobRecord) -> Self {
        Self {
            config: JobFileConfig {
                host: job.host.clone(),
                port: job.port,
                job_id: job.job_id.clone(),
                timestamp: job.timestamp,
                verbose: job.verbose,
                num_tries: job.num_tries,
            },
            fields: job
                .form_fields
                .iter()
                .map(|(name, value)| FieldEntry {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            files: job
                .file_fields
                .iter()
                .map(|(name, file)| FileEntry {
                    field_name: name.clone(),
                    path: file.path.clone(),
                    mime_type: file.mime_type.clone(),
                })
                .collect(),
        }
    }
}

impl JobFile {
    fn into_job(self, path: &Path) -> Result<JobRecord, StoreError> {
        let mut form_fields = BTreeMap::new();
        for field in self.fields {
            if form_fields.contains_key(&field.name) {
                return Err(StoreError::corrupt(
                    path,
                    format!("duplicate field '{}'", field.name),
                ));
            }
            form_fields.insert(field.name, field.value);
        }

        let mut file_fields = BTreeMap::new();
        for file in self.files {
            if file_fields.contains_key(&file.field_name) {
                return Err(StoreError::corrupt(
                    path,
                    format!("duplicate file field '{}'", file.field_name),
                ));
            }
            file_fields.insert(
                file.field_name,
                FileAttachment {
                    path: file.path,
                    mime_type: file.mime_type,
                },
            );
        }

        let job = JobRecord {
            host: self.config.host,
            port: self.config.port,
            job_id: self.config.job_id,
            form_fields,
            file_fields,
            timestamp: self.config.timestamp,
            verbose: self.config.verbose,
            num_tries: self.config.num_tries,
        };

        job.validate()
            .map_err(|e| StoreError::corrupt(path, e.to_string()))?;

        Ok(job)
    }
}

/// Durable store holding pending and failed jobs, one file per job
#[derive(Debug, Clone)]
pub struct JobStore {
    pending_dir: PathBuf,
    failed_dir: PathBuf,
}

impl JobStore {
    /// Open a store rooted at `storage_dir`, creating both directories
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = storage_dir.as_ref();
        let store = Self {
            pending_dir: root.join(PENDING_DIR),
            failed_dir: root.join(FAILED_DIR),
        };

        for dir in [&store.pending_dir, &store.failed_dir] {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }

        Ok(store)
    }

    /// Directory backing a source
    pub fn dir(&self, source: JobSource) -> &Path {
        match source {
            JobSource::Pending => &self.pending_dir,
            JobSource::Failed => &self.failed_dir,
        }
    }

    /// Persist a job into the given directory and return the new file path.
    ///
    /// The record is written to a temporary file first and renamed into place.
    pub fn write(&self, job: &JobRecord, target: JobSource) -> Result<PathBuf, StoreError> {
        job.validate()?;

        let dir = self.dir(target);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let path = dir.join(file_name_for(job));
        let tmp_path = path.with_extension(TMP_EXTENSION);
        let contents = serde_json::to_vec_pretty(&JobFile::from(job))?;

        fs::write(&tmp_path, contents).map_err(|e| StoreError::io(&tmp_path, e))?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::io(&path, e));
        }

        debug!(job_id = %job.job_id, file = %path.display(), "Job written to {}", target.as_str());
        Ok(path)
    }

    /// Load a job file back into a [`JobRecord`].
    ///
    /// Fails with [`StoreError::Corrupt`] when the record cannot be parsed, the
    /// host is empty, or any field or file entry has an empty part.
    pub fn read(&self, path: &Path) -> Result<JobRecord, StoreError> {
        let contents = fs::read(path).map_err(|e| StoreError::io(path, e))?;
        let file: JobFile = serde_json::from_slice(&contents)
            .map_err(|e| StoreError::corrupt(path, e.to_string()))?;
        file.into_job(path)
    }

    /// Job files in a directory, sorted by file name
    pub fn list(&self, source: JobSource) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.dir(source);
        let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(JOB_FILE_EXTENSION)
            })
            .collect();

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    pub fn list_pending(&self) -> Result<Vec<PathBuf>, StoreError> {
        self.list(JobSource::Pending)
    }

    pub fn list_failed(&self) -> Result<Vec<PathBuf>, StoreError> {
        self.list(JobSource::Failed)
    }

    /// Delete a job file. Failures are logged and reported as `false`.
    pub fn remove(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to remove job file");
                false
            }
        }
    }

    /// Move a job file into the failed directory, keeping its name
    pub fn move_to_failed(&self, path: &Path) -> Option<PathBuf> {
        let Some(name) = path.file_name() else {
            error!(file = %path.display(), "Job path has no file name");
            return None;
        };
        let target = self.failed_dir.join(name);

        match fs::rename(path, &target) {
            Ok(()) => Some(target),
            Err(e) => {
                warn!(
                    file = %path.display(),
                    target = %target.display(),
                    error = %e,
                    "Failed to move job file to failed store"
                );
                None
            }
        }
    }
}

/// Bytes of the job id kept in a file name, so names stay under NAME_MAX
pub const MAX_ID_BYTES_IN_FILE_NAME: usize = 64;

/// Unique file name for a job: `t{timestamp}_{safe_job_id}_{uuid}.job`
///
/// The id part is cut to [`MAX_ID_BYTES_IN_FILE_NAME`] bytes on a char
/// boundary. The full id is kept inside the record.
pub fn file_name_for(job: &JobRecord) -> String {
    let safe_id = file_system_safe(&job.job_id);
    format!(
        "t{}_{}_{}.{}",
        job.timestamp,
        truncate_on_char_boundary(&safe_id, MAX_ID_BYTES_IN_FILE_NAME),
        new_file_token(),
        JOB_FILE_EXTENSION
    )
}

fn truncate_on_char_boundary(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let end = input
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|end| *end <= max_bytes)
        .last()
        .unwrap_or(0);
    &input[..end]
}

/// Random 36 character token (8-4-4-4-12 hex) used to keep file names unique
pub fn new_file_token() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// Replace characters that are unsafe in file names with `_`
pub fn file_system_safe(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '?' | '\\' | '/' | '*' | '<' | '>' | '"' | ';' | ':' | '#' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
