//! Upload Queue service
//!
//! Runs the background upload worker, or writes a job straight into the
//! pending store for a running worker to pick up.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upload_queue::{Config, JobExecutionResult, JobRecord, JobSource, JobStore, UploadQueue};

const USAGE: &str = "\
Usage: upload-queue [run|enqueue|status]

Modes:
  run                                   Start the upload worker (default)
  enqueue <url> <port> <job-id> [part]  Write a job into the pending store
  status                                Print the number of stored jobs

Parts:
  name=value                            String form field
  @name=path[;type=mime]                File field (default type text/plain)

Environment variables:
  UPLOADER__QUEUE__STORAGE_DIR          Job store directory (default: upload-queue)
  UPLOADER__QUEUE__TIMEOUT_SECS         HTTP timeout per upload (default: 20)
  UPLOADER__QUEUE__MAX_RETRIES          Retries before a job is abandoned (default: 50)
  RUST_LOG                              Log filter, overrides service.log_level";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = args.first().map(|s| s.as_str()).unwrap_or("run");

    match mode {
        "run" => run_queue(config).await,
        "enqueue" => enqueue_job(&config, &args[1..]),
        "status" => print_status(&config),
        _ => {
            println!("{USAGE}");
            Ok(())
        }
    }
}

/// Start the worker and log results until a shutdown signal arrives
async fn run_queue(config: Config) -> Result<()> {
    info!(
        service = %config.service.name,
        storage_dir = %config.queue.storage_dir.display(),
        "Starting upload queue service"
    );

    init_metrics(config.service.metrics_port)?;

    let queue = UploadQueue::setup(
        &config.queue.storage_dir,
        config.queue.retry_policy(),
        config.queue.settings(),
    )
    .context("Failed to start upload queue")?;

    let mut drain_interval = tokio::time::interval(Duration::from_secs(1));
    let mut status_interval = tokio::time::interval(Duration::from_secs(30));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = drain_interval.tick() => {
                for result in queue.drain_results() {
                    log_result(&result);
                }
            }
            _ = status_interval.tick() => {
                let stats = queue.stats();
                info!(
                    pending = stats.pending_in_memory + stats.pending_on_disk,
                    pending_retry = stats.failed_on_disk,
                    executed_ok = stats.executed_ok,
                    executed_failed = stats.executed_failed,
                    "Queue status"
                );
            }
        }
    }

    info!("Shutting down upload queue service");
    queue.shutdown().await;
    info!("Upload queue service stopped");

    Ok(())
}

fn log_result(result: &JobExecutionResult) {
    if result.ok {
        info!(
            job_id = %result.job_id,
            fresh = result.is_fresh_attempt,
            response = %result.server_response_body,
            "Job executed"
        );
    } else {
        warn!(
            job_id = %result.job_id,
            fresh = result.is_fresh_attempt,
            outcome = ?result.outcome,
            status = result.server_status_code,
            error = %result.error_description,
            "Job execution failed"
        );
    }
}

/// Write a job described on the command line into the pending store
fn enqueue_job(config: &Config, args: &[String]) -> Result<()> {
    let job = parse_job(args)?;
    let store = JobStore::open(&config.queue.storage_dir).context("Failed to open job store")?;
    let path = store
        .write(&job, JobSource::Pending)
        .context("Failed to write job")?;

    info!(job_id = %job.job_id, file = %path.display(), "Job enqueued");
    Ok(())
}

fn parse_job(args: &[String]) -> Result<JobRecord> {
    let [host, port, job_id, parts @ ..] = args else {
        bail!("enqueue needs <url> <port> <job-id>\n\n{USAGE}");
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port '{port}'"))?;

    let mut builder = JobRecord::builder(host.as_str(), port, job_id.as_str());
    for part in parts {
        if let Some(file) = part.strip_prefix('@') {
            let (name, spec) = file
                .split_once('=')
                .with_context(|| format!("File part '{part}' must look like @name=path"))?;
            builder = match spec.split_once(";type=") {
                Some((path, mime)) => builder.file_with_mime(name, path, mime)?,
                None => builder.file(name, spec)?,
            };
        } else {
            let (name, value) = part
                .split_once('=')
                .with_context(|| format!("Field part '{part}' must look like name=value"))?;
            builder = builder.field(name, value)?;
        }
    }

    Ok(builder.build()?)
}

fn print_status(config: &Config) -> Result<()> {
    let store = JobStore::open(&config.queue.storage_dir).context("Failed to open job store")?;
    println!("Pending: {}", store.list_pending()?.len());
    println!("Pending retry: {}", store.list_failed()?.len());
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
