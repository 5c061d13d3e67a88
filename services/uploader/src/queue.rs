//! Public entry point used by the owning application.

use crate::engine::{QueueEngine, QueueSettings, QueueStats, SharedState};
use crate::executor::{FormSubmitter, HttpFormSubmitter, UploadExecutor};
use crate::job::{JobExecutionResult, JobRecord};
use crate::policy::RetryPolicy;
use crate::store::{JobStore, StoreError};
use std::mem;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors that can occur while starting the queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to open job store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Upload queue must be started inside a tokio runtime")]
    NoRuntime,
}

/// Durable background upload queue.
///
/// Create it once with [`UploadQueue::setup`], feed it with
/// [`UploadQueue::add_job`] and poll [`UploadQueue::drain_results`] from the
/// owning thread. Dropping the queue signals the worker to stop; use
/// [`UploadQueue::shutdown`] to also wait for it.
pub struct UploadQueue {
    shared: Arc<SharedState>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl UploadQueue {
    /// Open the store under `storage_dir` and start the worker, posting with reqwest
    pub fn setup(
        storage_dir: impl AsRef<Path>,
        policy: RetryPolicy,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let submitter = HttpFormSubmitter::new()?;
        Self::with_submitter(storage_dir, policy, settings, Arc::new(submitter))
    }

    /// Start the queue with a custom [`FormSubmitter`]
    pub fn with_submitter(
        storage_dir: impl AsRef<Path>,
        policy: RetryPolicy,
        settings: QueueSettings,
        submitter: Arc<dyn FormSubmitter>,
    ) -> Result<Self, QueueError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let store = JobStore::open(storage_dir)?;

        let shared = Arc::new(SharedState::new(settings));
        let engine = QueueEngine::new(shared.clone(), store, UploadExecutor::new(submitter, policy));

        let cancel = CancellationToken::new();
        let worker = runtime.spawn(engine.run(cancel.clone()));

        info!("Upload queue started");

        Ok(Self {
            shared,
            cancel,
            worker: Some(worker),
        })
    }

    /// Queue a job for upload. Never blocks on I/O.
    pub fn add_job(&self, job: JobRecord) {
        info!(job_id = %job.job_id, "Adding job");
        self.shared.pending.lock().push_back(job);
        metrics::counter!("uploader.jobs.enqueued").increment(1);
    }

    /// Take every result produced since the last call, in completion order
    pub fn drain_results(&self) -> Vec<JobExecutionResult> {
        mem::take(&mut *self.shared.results.lock())
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }

    /// Current settings snapshot
    pub fn settings(&self) -> QueueSettings {
        self.shared.settings.read().clone()
    }

    pub fn timeout(&self) -> Duration {
        self.shared.settings.read().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.settings.write().timeout = timeout;
    }

    pub fn execute_rate(&self) -> Duration {
        self.shared.settings.read().execute_rate
    }

    pub fn set_execute_rate(&self, rate: Duration) {
        self.shared.settings.write().execute_rate = rate;
    }

    pub fn fail_skip_factor(&self) -> u32 {
        self.shared.settings.read().fail_skip_factor
    }

    /// Values below 1 behave as 1 (try a failed job every iteration)
    pub fn set_fail_skip_factor(&self, factor: u32) {
        self.shared.settings.write().fail_skip_factor = factor;
    }

    pub fn max_retries(&self) -> u32 {
        self.shared.settings.read().max_retries
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.shared.settings.write().max_retries = max_retries;
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.shared.settings.write().verbose = verbose;
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// An upload in flight is allowed to finish; jobs still in memory are
    /// written to the pending directory.
    pub async fn shutdown(mut self) {
        info!("Shutting down upload queue");
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Upload worker ended abnormally");
            }
        }
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
