// crates/tracker/src/poller.rs
//! Adaptive-backoff status polling, the fallback when a job's event
//! stream cannot be established or dies before a terminal status.

use std::time::Duration;

use spendlens_api::ApiClient;
use spendlens_types::JobDetails;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Schedule knobs. The defaults give roughly nine minutes of tracking:
/// delays start at 1s, grow 1.5× per poll, cap at 15s, 40 attempts total.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(15),
            max_attempts: 40,
        }
    }
}

/// The delay sequence between polls: `initial, initial×f, initial×f², …`,
/// capped at `max_delay`. Infinite; the attempt cap lives in [`run`].
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    next: Duration,
    factor: f64,
    cap: Duration,
}

impl BackoffSchedule {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            factor: config.backoff_factor,
            cap: config.max_delay,
        }
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.mul_f64(self.factor).min(self.cap);
        Some(current)
    }
}

/// Why a poll loop stopped.
#[derive(Debug)]
pub enum PollOutcome {
    /// The job reported a terminal status.
    Terminal(JobDetails),
    /// The server no longer knows the job (404). Benign; tracking simply
    /// stops.
    Gone,
    /// Attempt cap reached without a terminal status. The last recorded
    /// state stays visible, stale or not.
    Exhausted,
    Cancelled,
}

/// Poll one job until it finishes, disappears, exhausts the attempt cap
/// or is cancelled.
///
/// The first request goes out immediately; only subsequent attempts wait
/// on the backoff schedule. Every observed state is handed to `observe`
/// in arrival order. A transport error on a single attempt is absorbed;
/// the next tick retries.
pub async fn run<F>(
    api: &ApiClient,
    job_id: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
    mut observe: F,
) -> PollOutcome
where
    F: FnMut(&JobDetails),
{
    let mut schedule = BackoffSchedule::new(config);
    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            let delay = schedule.next().unwrap_or(config.max_delay);
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        match api.job(job_id).await {
            Ok(details) => {
                observe(&details);
                if details.status.is_terminal() {
                    return PollOutcome::Terminal(details);
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(job_id = %job_id, "job gone server-side, polling stops");
                return PollOutcome::Gone;
            }
            Err(e) => {
                debug!(job_id = %job_id, attempt, error = %e, "poll attempt failed, will retry");
            }
        }
    }
    debug!(job_id = %job_id, attempts = config.max_attempts, "poll attempts exhausted");
    PollOutcome::Exhausted
}
