//! Background worker driving jobs from memory, to disk, to the server.
//!
//! Each iteration of the worker:
//!
//! 1. sleeps half the execute rate
//! 2. flushes the in-memory pending list to the pending directory
//! 3. executes the oldest pending job
//! 4. sleeps the other half of the execute rate
//! 5. every `fail_skip_factor` iterations, executes one random failed job
//!
//! ```text
//! add_job ──▶ memory ──flush──▶ pending/ ──execute──┬─▶ delete (delivered / rejected)
//!                                                  └─▶ failed/ ──execute──┬─▶ delete
//!                                                                         ├─▶ failed/ (num_tries + 1)
//!                                                                         └─▶ delete (abandoned)
//! ```

use crate::executor::{Execution, UploadExecutor};
use crate::job::{JobExecutionResult, JobOutcome, JobRecord};
use crate::store::{JobSource, JobStore, StoreError};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime tunables, read by the worker on every iteration
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// HTTP timeout per submission
    pub timeout: Duration,
    /// Length of one worker iteration
    pub execute_rate: Duration,
    /// Iterations between attempts from the failed store
    pub fail_skip_factor: u32,
    /// Failed retries allowed before a job is abandoned
    pub max_retries: u32,
    /// Log every server response at info level
    pub verbose: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            execute_rate: Duration::from_secs(1),
            fail_skip_factor: 20,
            max_retries: 50,
            verbose: false,
        }
    }
}

/// Snapshot of the queue's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_in_memory: usize,
    /// Pending directory size when last listed
    pub pending_on_disk: usize,
    /// Failed directory size when last listed
    pub failed_on_disk: usize,
    pub executed_ok: u64,
    pub executed_failed: u64,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Upload queue:")?;
        writeln!(f, "  Num Pending: {}", self.pending_in_memory + self.pending_on_disk)?;
        writeln!(f, "  Num Pending Retry: {}", self.failed_on_disk)?;
        writeln!(f, "  Num Executed OK so far: {}", self.executed_ok)?;
        write!(f, "  Num Executed & Failed so far: {}", self.executed_failed)
    }
}

/// State shared between the facade and the worker
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub(crate) pending: Mutex<VecDeque<JobRecord>>,
    pub(crate) results: Mutex<Vec<JobExecutionResult>>,
    pub(crate) settings: RwLock<QueueSettings>,
    pending_on_disk: AtomicUsize,
    failed_on_disk: AtomicUsize,
    executed_ok: AtomicU64,
    executed_failed: AtomicU64,
}

impl SharedState {
    pub(crate) fn new(settings: QueueSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            ..Default::default()
        }
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            pending_in_memory: self.pending.lock().len(),
            pending_on_disk: self.pending_on_disk.load(Ordering::Relaxed),
            failed_on_disk: self.failed_on_disk.load(Ordering::Relaxed),
            executed_ok: self.executed_ok.load(Ordering::Relaxed),
            executed_failed: self.executed_failed.load(Ordering::Relaxed),
        }
    }

    fn record_disk_count(&self, source: JobSource, count: usize) {
        let counter = match source {
            JobSource::Pending => &self.pending_on_disk,
            JobSource::Failed => &self.failed_on_disk,
        };
        counter.store(count, Ordering::Relaxed);
    }
}

/// The single worker that persists and executes jobs
pub struct QueueEngine {
    shared: Arc<SharedState>,
    store: JobStore,
    executor: UploadExecutor,
    iteration: u64,
}

/// What came out of reading a job file
#[derive(Debug)]
enum Loaded {
    Job(JobRecord),
    /// Corrupt record, file already deleted
    Dropped,
    /// Transient failure, file left in place
    Unavailable,
}

impl QueueEngine {
    pub(crate) fn new(shared: Arc<SharedState>, store: JobStore, executor: UploadExecutor) -> Self {
        Self {
            shared,
            store,
            executor,
            iteration: 0,
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Cancellation is only observed while sleeping, so an upload in flight
    /// always completes. Jobs still in memory are flushed to disk before exit.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            pending_dir = %self.store.dir(JobSource::Pending).display(),
            failed_dir = %self.store.dir(JobSource::Failed).display(),
            "Upload worker started"
        );

        loop {
            if self.pause(&cancel).await {
                break;
            }

            self.flush_in_background().await;
            self.execute_next(JobSource::Pending).await;

            if self.pause(&cancel).await {
                break;
            }

            let fail_skip_factor = u64::from(self.shared.settings.read().fail_skip_factor.max(1));
            if self.iteration % fail_skip_factor == 0 {
                self.execute_next(JobSource::Failed).await;
            }
            self.iteration = self.iteration.wrapping_add(1);
        }

        let flushed = self.flush_in_background().await.unwrap_or(0);
        info!(flushed, "Upload worker stopped");
    }

    /// Sleep half an iteration; true when cancelled
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        let half_rate = self.shared.settings.read().execute_rate / 2;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(half_rate) => false,
        }
    }

    /// Run store work on the blocking pool. `None` if the task panicked.
    async fn blocking<T, F>(&self, work: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&SharedState, &JobStore) -> T + Send + 'static,
    {
        let shared = self.shared.clone();
        let store = self.store.clone();

        match tokio::task::spawn_blocking(move || work(&shared, &store)).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(error = %e, "Job store task failed");
                None
            }
        }
    }

    async fn flush_in_background(&self) -> Option<usize> {
        self.blocking(flush_to_store).await
    }

    /// Move every in-memory job to the pending directory.
    ///
    /// Returns the number of jobs written. Jobs that could not be written stay
    /// in memory, in order, ahead of anything added meanwhile.
    pub fn flush_pending(&self) -> usize {
        flush_to_store(&self.shared, &self.store)
    }

    /// Execute one job from the given directory.
    ///
    /// The pending directory yields its oldest job, the failed directory a
    /// random one. Returns `None` when nothing was executed.
    pub async fn execute_next(&self, source: JobSource) -> Option<JobExecutionResult> {
        let (path, loaded) = self.blocking(move |shared, store| load_next(shared, store, source)).await??;
        let Loaded::Job(job) = loaded else {
            return None;
        };

        let (timeout, verbose, max_retries) = {
            let settings = self.shared.settings.read();
            (settings.timeout, settings.verbose, settings.max_retries)
        };

        let execution = self.executor.execute(&job, timeout, verbose).await;
        let job_id = job.job_id.clone();
        let retry_later = execution.retry_later();
        let delivered = execution.response.is_success();
        let outcome = self
            .blocking(move |shared, store| {
                resolve(shared, store, job, &path, source, retry_later, delivered, max_retries)
            })
            .await?;

        let result = JobExecutionResult {
            job_id,
            ok: !retry_later,
            is_fresh_attempt: source == JobSource::Pending,
            outcome,
            server_response_body: execution.response.body,
            server_status_code: execution.response.status,
            error_description: execution.error_description,
        };

        self.shared.results.lock().push(result.clone());
        Some(result)
    }
}

fn flush_to_store(shared: &SharedState, store: &JobStore) -> usize {
    let mut written = 0;
    let mut kept = Vec::new();

    loop {
        let Some(job) = shared.pending.lock().pop_front() else {
            break;
        };

        match store.write(&job, JobSource::Pending) {
            Ok(path) => {
                written += 1;
                debug!(job_id = %job.job_id, file = %path.display(), "Job persisted");
            }
            Err(StoreError::InvalidJob(e)) => {
                error!(job_id = %job.job_id, error = %e, "Dropping invalid job");
                metrics::counter!("uploader.jobs.invalid").increment(1);
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Failed to persist job, keeping it in memory");
                metrics::counter!("uploader.jobs.persist_failed").increment(1);
                kept.push(job);
            }
        }
    }

    if !kept.is_empty() {
        let mut pending = shared.pending.lock();
        for job in kept.into_iter().rev() {
            pending.push_front(job);
        }
    }

    written
}

/// List `source`, pick a file and read it. `None` when there is nothing to run.
fn load_next(shared: &SharedState, store: &JobStore, source: JobSource) -> Option<(PathBuf, Loaded)> {
    let files = match store.list(source) {
        Ok(files) => files,
        Err(e) => {
            error!(source = source.as_str(), error = %e, "Failed to list job files");
            return None;
        }
    };
    shared.record_disk_count(source, files.len());

    let path = pick_file(&files, source)?;
    let loaded = load_job(store, &path);
    Some((path, loaded))
}

fn load_job(store: &JobStore, path: &Path) -> Loaded {
    match store.read(path) {
        Ok(job) => Loaded::Job(job),
        Err(e) if e.is_corrupt() => {
            error!(file = %path.display(), error = %e, "Dropping corrupt job file");
            metrics::counter!("uploader.jobs.corrupt").increment(1);
            store.remove(path);
            Loaded::Dropped
        }
        Err(e) => {
            error!(file = %path.display(), error = %e, "Failed to load job file, leaving it for the next cycle");
            metrics::counter!("uploader.jobs.load_failed").increment(1);
            Loaded::Unavailable
        }
    }
}

/// Apply the state transition for an executed job
#[allow(clippy::too_many_arguments)]
fn resolve(
    shared: &SharedState,
    store: &JobStore,
    mut job: JobRecord,
    path: &Path,
    source: JobSource,
    retry_later: bool,
    delivered: bool,
    max_retries: u32,
) -> JobOutcome {
    let file = path.display();

    if !retry_later {
        info!(job_id = %job.job_id, file = %file, "Deleting job");
        store.remove(path);
        delete_attachments(&job);
        shared.executed_ok.fetch_add(1, Ordering::Relaxed);

        return if delivered {
            metrics::counter!("uploader.jobs.delivered").increment(1);
            JobOutcome::Delivered
        } else {
            metrics::counter!("uploader.jobs.rejected").increment(1);
            JobOutcome::Rejected
        };
    }

    shared.executed_failed.fetch_add(1, Ordering::Relaxed);

    match source {
        JobSource::Pending => {
            error!(job_id = %job.job_id, file = %file, "Job failed, moving it to the failed store");
            store.move_to_failed(path);
            metrics::counter!("uploader.jobs.retry_scheduled").increment(1);
            JobOutcome::RetryScheduled
        }
        JobSource::Failed => {
            job.num_tries += 1;

            if job.num_tries > max_retries {
                error!(
                    job_id = %job.job_id,
                    file = %file,
                    num_tries = job.num_tries,
                    max_retries,
                    "Job failed for the last time, abandoning it"
                );
                store.remove(path);
                delete_attachments(&job);
                metrics::counter!("uploader.jobs.abandoned").increment(1);
                return JobOutcome::Abandoned;
            }

            error!(
                job_id = %job.job_id,
                file = %file,
                num_tries = job.num_tries,
                max_retries,
                "Job failed again, keeping it for another retry"
            );
            match store.write(&job, JobSource::Failed) {
                Ok(_) => {
                    store.remove(path);
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "Failed to rewrite job, previous record kept");
                }
            }
            metrics::counter!("uploader.jobs.retry_scheduled").increment(1);
            JobOutcome::RetryScheduled
        }
    }
}

fn pick_file(files: &[PathBuf], source: JobSource) -> Option<PathBuf> {
    match source {
        JobSource::Pending => files.first().cloned(),
        JobSource::Failed => files.choose(&mut rand::thread_rng()).cloned(),
    }
}

/// Remove the user files attached to a job that will not be retried
fn delete_attachments(job: &JobRecord) {
    for path in job.attachment_paths().filter(|p| !p.is_empty()) {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(job_id = %job.job_id, path, "Removed user content file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(job_id = %job.job_id, path, "User content file already gone");
            }
            Err(e) => {
                warn!(job_id = %job.job_id, path, error = %e, "Failed to remove user content file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MockFormSubmitter, SubmitResponse};
    use crate::policy::RetryPolicy;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        shared: Arc<SharedState>,
        store: JobStore,
        engine: QueueEngine,
    }

    fn harness(statuses: Vec<Option<u16>>, expected_calls: usize, settings: QueueSettings) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("store")).unwrap();

        let mut submitter = MockFormSubmitter::new();
        let mut statuses = statuses.into_iter();
        submitter
            .expect_submit()
            .times(expected_calls)
            .returning(move |_, _| {
                let status = statuses.next().flatten();
                SubmitResponse {
                    status,
                    body: format!("status {status:?}"),
                    reason: if status.is_some() { "reason".into() } else { "connection refused".into() },
                    elapsed: Duration::from_millis(3),
                    url: "https://api.example.com/".to_string(),
                }
            });

        let shared = Arc::new(SharedState::new(settings));
        let executor = UploadExecutor::new(Arc::new(submitter), RetryPolicy::default());
        let engine = QueueEngine::new(shared.clone(), store.clone(), executor);

        Harness {
            dir,
            shared,
            store,
            engine,
        }
    }

    impl Harness {
        fn attachment(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, "0123456789").unwrap();
            path
        }

        fn job(&self, job_id: &str, attachment: &Path) -> JobRecord {
            JobRecord::builder("api.example.com", 443, job_id)
                .field("lang", "en")
                .unwrap()
                .file_with_mime("photo", attachment.to_string_lossy(), "image/jpeg")
                .unwrap()
                .build()
                .unwrap()
        }

        fn enqueue(&self, job: JobRecord) {
            self.shared.pending.lock().push_back(job);
        }
    }

    fn settings(max_retries: u32) -> QueueSettings {
        QueueSettings {
            max_retries,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_flush_writes_one_file_per_job() {
        let h = harness(vec![], 0, settings(3));
        let attachment = h.attachment("a.bin");
        let jobs: Vec<JobRecord> = (0..3).map(|i| h.job(&format!("job-{i}"), &attachment)).collect();
        for job in &jobs {
            h.enqueue(job.clone());
        }

        assert_eq!(h.engine.flush_pending(), 3);
        assert!(h.shared.pending.lock().is_empty());

        let files = h.store.list_pending().unwrap();
        assert_eq!(files.len(), 3);
        let mut loaded: Vec<JobRecord> = files.iter().map(|f| h.store.read(f).unwrap()).collect();
        loaded.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        assert_eq!(loaded, jobs);
    }

    #[tokio::test]
    async fn test_flush_drops_invalid_jobs() {
        let h = harness(vec![], 0, settings(3));
        let mut job = JobRecord::builder("h", 80, "broken").build().unwrap();
        job.host.clear();
        h.enqueue(job);

        assert_eq!(h.engine.flush_pending(), 0);
        assert!(h.shared.pending.lock().is_empty());
        assert!(h.store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivered_job_is_removed_with_its_files() {
        let h = harness(vec![Some(200)], 1, settings(3));
        let attachment = h.attachment("photo.jpg");
        h.enqueue(h.job("portrait", &attachment));
        h.engine.flush_pending();

        let result = h.engine.execute_next(JobSource::Pending).await.unwrap();

        assert!(result.ok);
        assert!(result.is_fresh_attempt);
        assert_eq!(result.outcome, JobOutcome::Delivered);
        assert_eq!(result.server_status_code, Some(200));
        assert!(h.store.list_pending().unwrap().is_empty());
        assert!(h.store.list_failed().unwrap().is_empty());
        assert!(!attachment.exists());
        assert_eq!(h.shared.results.lock().len(), 1);
        assert_eq!(h.shared.stats().executed_ok, 1);
    }

    #[tokio::test]
    async fn test_server_error_moves_job_to_failed_store() {
        let h = harness(vec![Some(503)], 1, settings(3));
        let attachment = h.attachment("photo.jpg");
        h.enqueue(h.job("portrait", &attachment));
        h.engine.flush_pending();

        let result = h.engine.execute_next(JobSource::Pending).await.unwrap();

        assert!(!result.ok);
        assert_eq!(result.outcome, JobOutcome::RetryScheduled);
        assert!(h.store.list_pending().unwrap().is_empty());
        let failed = h.store.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(h.store.read(&failed[0]).unwrap().num_tries, 0);
        assert!(attachment.exists());
        assert_eq!(h.shared.stats().executed_failed, 1);
    }

    #[tokio::test]
    async fn test_rejected_job_is_deleted_without_retry() {
        let h = harness(vec![Some(400)], 1, settings(3));
        let attachment = h.attachment("photo.jpg");
        h.enqueue(h.job("bad-request", &attachment));
        h.engine.flush_pending();

        let result = h.engine.execute_next(JobSource::Pending).await.unwrap();

        assert!(result.ok);
        assert_eq!(result.outcome, JobOutcome::Rejected);
        assert_eq!(result.server_status_code, Some(400));
        assert!(h.store.list_pending().unwrap().is_empty());
        assert!(h.store.list_failed().unwrap().is_empty());
        assert!(!attachment.exists());
        assert_eq!(h.shared.stats().executed_ok, 1);
        assert_eq!(h.shared.stats().executed_failed, 0);
    }

    #[tokio::test]
    async fn test_failed_retry_increments_num_tries() {
        let h = harness(vec![None], 1, settings(3));
        let attachment = h.attachment("photo.jpg");
        let mut job = h.job("retry", &attachment);
        job.num_tries = 1;
        let original = h.store.write(&job, JobSource::Failed).unwrap();

        let result = h.engine.execute_next(JobSource::Failed).await.unwrap();

        assert!(!result.is_fresh_attempt);
        assert_eq!(result.outcome, JobOutcome::RetryScheduled);
        assert_eq!(result.server_status_code, None);
        assert!(!original.exists());
        let failed = h.store.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(h.store.read(&failed[0]).unwrap().num_tries, 2);
        assert!(attachment.exists());
    }

    #[tokio::test]
    async fn test_exhausted_job_is_abandoned() {
        let h = harness(vec![Some(500)], 1, settings(3));
        let attachment = h.attachment("photo.jpg");
        let mut job = h.job("hopeless", &attachment);
        job.num_tries = 3;
        h.store.write(&job, JobSource::Failed).unwrap();

        let result = h.engine.execute_next(JobSource::Failed).await.unwrap();

        assert!(!result.ok);
        assert_eq!(result.outcome, JobOutcome::Abandoned);
        assert!(h.store.list_failed().unwrap().is_empty());
        assert!(h.store.list_pending().unwrap().is_empty());
        assert!(!attachment.exists());
    }

    #[tokio::test]
    async fn test_failed_job_can_still_succeed() {
        let h = harness(vec![Some(200)], 1, settings(3));
        let attachment = h.attachment("photo.jpg");
        let mut job = h.job("late-success", &attachment);
        job.num_tries = 2;
        h.store.write(&job, JobSource::Failed).unwrap();

        let result = h.engine.execute_next(JobSource::Failed).await.unwrap();

        assert!(result.ok);
        assert!(!result.is_fresh_attempt);
        assert!(h.store.list_failed().unwrap().is_empty());
        assert!(!attachment.exists());
    }

    #[tokio::test]
    async fn test_pending_jobs_run_oldest_first() {
        let h = harness(vec![Some(200), Some(200)], 2, settings(3));
        let attachment = h.attachment("shared.txt");
        let newer = JobRecord { timestamp: 1_700_000_500, ..h.job("newer", &attachment) };
        let older = JobRecord { timestamp: 1_700_000_100, ..h.job("older", &attachment) };
        h.store.write(&newer, JobSource::Pending).unwrap();
        h.store.write(&older, JobSource::Pending).unwrap();

        let first = h.engine.execute_next(JobSource::Pending).await.unwrap();
        let second = h.engine.execute_next(JobSource::Pending).await.unwrap();

        assert_eq!(first.job_id, "older");
        assert_eq!(second.job_id, "newer");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_dropped_without_execution() {
        let h = harness(vec![Some(200)], 1, settings(3));
        let corrupt = h.store.dir(JobSource::Pending).join("t0000000001_corrupt_x.job");
        fs::write(&corrupt, r#"{"config": {"host": ""}}"#).unwrap();
        let attachment = h.attachment("photo.jpg");
        h.store.write(&h.job("valid", &attachment), JobSource::Pending).unwrap();

        assert!(h.engine.execute_next(JobSource::Pending).await.is_none());
        assert!(!corrupt.exists());
        assert!(h.shared.results.lock().is_empty());

        let result = h.engine.execute_next(JobSource::Pending).await.unwrap();
        assert_eq!(result.job_id, "valid");
    }

    #[tokio::test]
    async fn test_empty_store_executes_nothing() {
        let h = harness(vec![], 0, settings(3));

        assert!(h.engine.execute_next(JobSource::Pending).await.is_none());
        assert!(h.engine.execute_next(JobSource::Failed).await.is_none());
    }

    #[tokio::test]
    async fn test_long_job_id_does_not_hold_back_later_jobs() {
        let h = harness(vec![], 0, settings(3));
        let long = JobRecord::builder("h", 80, "x".repeat(300)).build().unwrap();
        let normal = JobRecord::builder("h", 80, "normal").build().unwrap();
        h.enqueue(long.clone());
        h.enqueue(normal.clone());

        assert_eq!(h.engine.flush_pending(), 2);
        assert!(h.shared.pending.lock().is_empty());

        let mut ids: Vec<String> = h
            .store
            .list_pending()
            .unwrap()
            .iter()
            .map(|f| h.store.read(f).unwrap().job_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["normal".to_string(), long.job_id]);
    }

    #[tokio::test]
    async fn test_unwritable_jobs_stay_in_memory_in_order() {
        let h = harness(vec![], 0, settings(3));
        fs::remove_dir_all(h.store.dir(JobSource::Pending)).unwrap();
        for id in ["first", "second", "third"] {
            h.enqueue(JobRecord::builder("h", 80, id).build().unwrap());
        }

        assert_eq!(h.engine.flush_pending(), 0);

        let kept: Vec<String> = h.shared.pending.lock().iter().map(|j| j.job_id.clone()).collect();
        assert_eq!(kept, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unreadable_job_file_is_left_in_place() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let stuck = store.dir(JobSource::Pending).join("t0000000001_stuck_x.job");
        fs::create_dir(&stuck).unwrap();

        assert!(matches!(load_job(&store, &stuck), Loaded::Unavailable));
        assert!(stuck.exists());
    }

    #[test]
    fn test_failed_pick_is_not_always_the_first_file() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("t{i}_job.job"))).collect();

        let picked: std::collections::HashSet<PathBuf> = (0..200)
            .filter_map(|_| pick_file(&files, JobSource::Failed))
            .collect();

        assert!(picked.len() > 1);
        assert!(picked.iter().all(|p| files.contains(p)));
        assert_eq!(pick_file(&files, JobSource::Pending), Some(files[0].clone()));
    }

    #[tokio::test]
    async fn test_failed_store_is_visited_every_fail_skip_factor_iterations() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let mut submitter = MockFormSubmitter::new();
        submitter.expect_submit().returning(|job, _| {
            let status = if job.job_id == "retry-me" { 503 } else { 200 };
            SubmitResponse {
                status: Some(status),
                body: String::new(),
                reason: "reason".to_string(),
                elapsed: Duration::from_millis(1),
                url: "https://api.example.com/".to_string(),
            }
        });

        for i in 0..9 {
            let job = JobRecord::builder("api.example.com", 443, format!("fresh-{i}"))
                .timestamp(1_700_000_000 + i)
                .build()
                .unwrap();
            store.write(&job, JobSource::Pending).unwrap();
        }
        let retry = JobRecord::builder("api.example.com", 443, "retry-me").build().unwrap();
        store.write(&retry, JobSource::Failed).unwrap();

        let shared = Arc::new(SharedState::new(QueueSettings {
            execute_rate: Duration::from_millis(10),
            fail_skip_factor: 3,
            max_retries: 100,
            ..Default::default()
        }));
        let executor = UploadExecutor::new(Arc::new(submitter), RetryPolicy::default());
        let engine = QueueEngine::new(shared.clone(), store.clone(), executor);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(engine.run(cancel.clone()));

        for _ in 0..500 {
            if shared.results.lock().iter().filter(|r| r.is_fresh_attempt).count() >= 9 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        worker.await.unwrap();

        let results = shared.results.lock().clone();
        let mut fresh_seen = 0;
        let attempts: Vec<bool> = results
            .iter()
            .map(|r| r.is_fresh_attempt)
            .take_while(|fresh| {
                let more = fresh_seen < 9;
                if *fresh {
                    fresh_seen += 1;
                }
                more
            })
            .collect();

        // pending first, then failed on iterations 0, 3 and 6
        let (p, f) = (true, false);
        assert_eq!(attempts, vec![p, f, p, p, p, f, p, p, p, f, p, p]);

        let failed = store.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert!(store.read(&failed[0]).unwrap().num_tries >= 3);
    }

    #[test]
    fn test_stats_display() {
        let stats = QueueStats {
            pending_in_memory: 1,
            pending_on_disk: 2,
            failed_on_disk: 3,
            executed_ok: 4,
            executed_failed: 5,
        };
        let text = stats.to_string();

        assert!(text.contains("Num Pending: 3"));
        assert!(text.contains("Num Pending Retry: 3"));
        assert!(text.contains("Num Executed OK so far: 4"));
        assert!(text.contains("Num Executed & Failed so far: 5"));
    }
}
