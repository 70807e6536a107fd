// crates/cli/src/main.rs
//! Spendlens command-line client.
//!
//! Uploads statement PDFs and tracks their ingestion jobs to completion,
//! with a live progress bar fed by the tracker's event stream. Results go
//! to stdout; progress and status lines go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use spendlens_api::{
    api_url_from_env, default_chain, ApiClient, StaticTokenProvider, TokenProvider,
};
use spendlens_tracker::{IngestTracker, JobRegistry, TrackerEvent};
use spendlens_types::{Job, JobStatus, SubmitResponse, UsageSummary};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "spendlens",
    version,
    about = "Upload bank statements and track their ingestion"
)]
struct Cli {
    /// API base URL. Defaults to $SPENDLENS_API_URL, then production.
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Access token. Overrides $SPENDLENS_TOKEN and stored credentials.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a statement PDF and follow it to completion
    Upload {
        /// Path to the statement PDF
        file: PathBuf,

        /// Password for an encrypted document
        #[arg(long)]
        password: Option<String>,

        /// Submit and exit without waiting for processing
        #[arg(long)]
        no_follow: bool,
    },

    /// List ingestion jobs
    Jobs {
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Re-attach to unfinished jobs and watch them finish
        #[arg(long)]
        follow: bool,
    },

    /// Show one job
    Status {
        /// Job id from a previous upload
        job_id: String,
    },

    /// Show statement usage for the current billing period
    Usage,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let tokens: Arc<dyn TokenProvider> = match &cli.token {
        Some(token) => Arc::new(StaticTokenProvider::new(token.clone())),
        None => default_chain(),
    };
    let base_url = cli.api_url.clone().unwrap_or_else(api_url_from_env);
    let api = Arc::new(ApiClient::new(base_url, tokens));

    let code = match cli.command {
        Command::Upload {
            file,
            password,
            no_follow,
        } => upload(api, &file, password.as_deref(), no_follow).await?,
        Command::Jobs { json, follow } => jobs(api, json, follow).await?,
        Command::Status { job_id } => status(api, &job_id).await?,
        Command::Usage => usage(api).await?,
    };
    std::process::exit(code);
}

// ── Commands ────────────────────────────────────────────────────────────

async fn upload(
    api: Arc<ApiClient>,
    file: &Path,
    password: Option<&str>,
    no_follow: bool,
) -> Result<i32> {
    let tracker = IngestTracker::new(api, Arc::new(JobRegistry::new()));
    let mut events = tracker.subscribe();

    let outcome = match password {
        Some(password) => tracker.submit_with_password(file, password).await,
        None => tracker.submit(file).await,
    }
    .with_context(|| format!("submitting {}", file.display()))?;

    match outcome {
        SubmitResponse::Completed(receipt) => {
            eprintln!(
                "  \u{2713} Imported {} \u{2014} {} transactions (statement {})",
                file_label(file),
                receipt.transaction_count,
                receipt.statement_id,
            );
            Ok(0)
        }
        SubmitResponse::PasswordRequired => {
            eprintln!("  \u{2717} This document is password-protected. Retry with --password.");
            Ok(2)
        }
        SubmitResponse::Accepted { job_id } => {
            if no_follow {
                eprintln!("  \u{2713} Accepted \u{2014} job {job_id}");
                return Ok(0);
            }
            let code = follow_job(&tracker, &mut events, &job_id).await;
            tracker.shutdown();
            code
        }
    }
}

async fn jobs(api: Arc<ApiClient>, json: bool, follow: bool) -> Result<i32> {
    if follow {
        return follow_pending(api).await;
    }
    let jobs = api.jobs().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(0);
    }
    if jobs.is_empty() {
        eprintln!("No ingestion jobs.");
        return Ok(0);
    }
    println!("{:<14} {:<11} {:>8}  {}", "JOB", "STATUS", "PROGRESS", "FILE");
    for job in &jobs {
        println!(
            "{:<14} {:<11} {:>7}%  {}",
            job.id, job.status, job.progress_percent, job.original_filename,
        );
    }
    Ok(0)
}

async fn status(api: Arc<ApiClient>, job_id: &str) -> Result<i32> {
    match api.job(job_id).await {
        Ok(job) => {
            println!(
                "{:<14} {:<11} {:>7}%  {}",
                job.id, job.status, job.progress_percent, job.original_filename,
            );
            if let Some(error) = &job.error_message {
                println!("  error: {error}");
            }
            Ok(0)
        }
        Err(e) if e.is_not_found() => {
            eprintln!("  \u{2717} No job with id {job_id}");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

async fn usage(api: Arc<ApiClient>) -> Result<i32> {
    let usage = api.usage().await?;
    println!(
        "Statements: {} of {} used this period ({} left)",
        usage.statements_used,
        usage.statement_limit,
        usage.remaining(),
    );
    println!("Resets: {}", usage.period_end.format("%Y-%m-%d"));
    Ok(0)
}

// ── Follow loops ────────────────────────────────────────────────────────

/// Watch one job's events until it finishes or its driver stops. The
/// periodic claim check catches drivers that end without a terminal
/// status (job deleted server-side, or polling gave up).
async fn follow_job(
    tracker: &Arc<IngestTracker>,
    events: &mut broadcast::Receiver<TrackerEvent>,
    job_id: &str,
) -> Result<i32> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner} {msg} [{bar:30}] {pos}%")
            .expect("valid progress template"),
    );
    pb.set_message("Processing");
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let finished = 'wait: loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TrackerEvent::JobUpdated { job }) if job.id == job_id => {
                    pb.set_position(u64::from(job.progress));
                }
                Ok(TrackerEvent::JobFinished { job }) if job.id == job_id => {
                    break 'wait Some(job);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress display lagged behind the tracker");
                }
                Err(RecvError::Closed) => break 'wait None,
            },
            _ = ticker.tick() => {
                if !tracker.active_jobs().iter().any(|id| id == job_id) {
                    // The driver is gone; drain anything it emitted before
                    // concluding that no terminal state arrived.
                    while let Ok(event) = events.try_recv() {
                        if let TrackerEvent::JobFinished { job } = event {
                            if job.id == job_id {
                                break 'wait Some(job);
                            }
                        }
                    }
                    break 'wait None;
                }
            }
        }
    };
    pb.finish_and_clear();

    let Some(job) = finished else {
        eprintln!(
            "  \u{2717} Tracking stopped \u{2014} the job may still be processing. \
             Check later with `spendlens status {job_id}`."
        );
        return Ok(3);
    };
    match job.status {
        JobStatus::Completed => {
            match wait_for_usage(events).await {
                Some(usage) => eprintln!(
                    "  \u{2713} Import complete \u{2014} {} of {} statements used this period",
                    usage.statements_used, usage.statement_limit,
                ),
                None => eprintln!("  \u{2713} Import complete"),
            }
            Ok(0)
        }
        JobStatus::Failed => {
            eprintln!(
                "  \u{2717} Import failed: {}",
                job.error.as_deref().unwrap_or("unknown error"),
            );
            Ok(1)
        }
        // JobFinished only carries terminal states.
        JobStatus::Pending | JobStatus::Running => Ok(0),
    }
}

/// Re-attach to unfinished jobs and report each as it finishes.
async fn follow_pending(api: Arc<ApiClient>) -> Result<i32> {
    let tracker = IngestTracker::new(api, Arc::new(JobRegistry::new()));
    let mut events = tracker.subscribe();
    let resumed = tracker.resume_pending().await?;
    if resumed == 0 {
        eprintln!("No unfinished jobs to follow.");
        return Ok(0);
    }
    eprintln!("  \u{2192} Following {resumed} unfinished job(s)");

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut failed = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TrackerEvent::JobFinished { job }) => report_finished(&job, &mut failed),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "follow display lagged behind the tracker");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if tracker.active_jobs().is_empty() {
                    // A driver emits its finish notice just before it
                    // releases the claim; anything still queued must be
                    // reported before the exit code is decided.
                    drain_finished(&mut events, &mut failed);
                    break;
                }
            }
        }
    }
    tracker.shutdown();
    Ok(if failed > 0 { 1 } else { 0 })
}

/// One ✓/✗ line per finished job; failures count toward the exit code.
fn report_finished(job: &Job, failed: &mut usize) {
    match job.status {
        JobStatus::Completed => {
            eprintln!("  \u{2713} {} \u{2014} complete", job.filename);
        }
        JobStatus::Failed => {
            *failed += 1;
            eprintln!(
                "  \u{2717} {} \u{2014} {}",
                job.filename,
                job.error.as_deref().unwrap_or("failed"),
            );
        }
        JobStatus::Pending | JobStatus::Running => {}
    }
}

/// Report every `JobFinished` still queued on the channel.
fn drain_finished(events: &mut broadcast::Receiver<TrackerEvent>, failed: &mut usize) {
    loop {
        match events.try_recv() {
            Ok(TrackerEvent::JobFinished { job }) => report_finished(&job, failed),
            Ok(_) => {}
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
}

/// The usage refresh lands right after a completed import; give it a
/// moment rather than racing it to the exit.
async fn wait_for_usage(events: &mut broadcast::Receiver<TrackerEvent>) -> Option<UsageSummary> {
    let refresh = async {
        loop {
            match events.recv().await {
                Ok(TrackerEvent::UsageRefreshed { usage }) => break Some(usage),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), refresh)
        .await
        .ok()
        .flatten()
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
