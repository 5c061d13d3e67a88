//! Upload Queue
//!
//! Durable, at-least-once background queue for multipart HTTP uploads.
//! Callers enqueue jobs (string fields plus attached files); a single
//! background worker persists each job to disk, posts it, and decides from the
//! server's status code whether the job is done or should be retried later.
//!
//! ## Features
//!
//! - **Crash-safe persistence**: one file per job, jobs survive restarts
//! - **Status-driven retries**: a [`RetryPolicy`] maps status codes to
//!   delete / retry-later; unknown codes and transport failures are retried
//! - **Bounded retries**: jobs failing more than `max_retries` times are
//!   abandoned together with their attached files
//! - **Pull-based results**: the owning application drains
//!   [`JobExecutionResult`]s whenever it wants
//!
//! ## Architecture
//!
//! ```text
//! Application thread            Worker task                    Server
//! ┌──────────────┐  add_job    ┌──────────────┐               ┌──────────┐
//! │ UploadQueue  │────────────▶│ QueueEngine  │──multipart───▶│ HTTP     │
//! │              │◀────────────│              │◀──status──────│ endpoint │
//! └──────────────┘  drain      └──────────────┘               └──────────┘
//!                                 │        ▲
//!                                 ▼        │
//!                            ┌──────────────────┐
//!                            │ JobStore         │
//!                            │  pending/ failed/│
//!                            └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use upload_queue::{JobRecord, QueueSettings, RetryPolicy, UploadQueue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue = UploadQueue::setup("uploads", RetryPolicy::default(), QueueSettings::default())?;
//!
//!     let job = JobRecord::builder("http://example.com/portrait/submit", 80, "portrait-1")
//!         .field("language", "en")?
//!         .file_with_mime("file", "portrait.jpg", "image/jpeg")?
//!         .build()?;
//!     queue.add_job(job);
//!
//!     for result in queue.drain_results() {
//!         println!("{} ok={}", result.job_id, result.ok);
//!     }
//!
//!     queue.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod executor;
pub mod job;
pub mod policy;
pub mod queue;
pub mod store;

pub use config::{Config, ConfigError, QueueConfig, ServiceConfig};
pub use engine::{QueueEngine, QueueSettings, QueueStats};
pub use executor::{FormSubmitter, HttpFormSubmitter, SubmitResponse, UploadExecutor};
pub use job::{FileAttachment, JobBuilder, JobError, JobExecutionResult, JobOutcome, JobRecord};
pub use policy::{RetryPolicy, StatusAction};
pub use queue::{QueueError, UploadQueue};
pub use store::{JobSource, JobStore, StoreError};
