// crates/tracker/src/tracker.rs
//! The lifecycle controller: one driver per job id, from submit response
//! to terminal state.
//!
//! A driver owns its job's whole tracked life: stream phase first, then a
//! hard cutover to polling if the stream dies early (the stream is fully
//! closed before the first poll; the poller's immediate first request
//! covers the gap). The claim map guarantees a job id never has two live
//! update sources, whichever phase each driver is in.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use spendlens_api::{ApiClient, ApiError};
use spendlens_types::{Job, JobStatus, JobUpdate, SubmitResponse, UsageSummary};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::poller::{self, PollConfig, PollOutcome};
use crate::registry::JobRegistry;
use crate::stream::{JobStream, StreamEvent};

/// Notifications broadcast to observers (e.g. a progress display).
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    JobRegistered { job: Job },
    JobUpdated { job: Job },
    /// The job reached a terminal status; its final record stays in the
    /// registry until cleared.
    JobFinished { job: Job },
    /// Usage was re-fetched after a completed import.
    UsageRefreshed { usage: UsageSummary },
}

/// How the stream phase of a driver ended.
enum StreamPhase {
    /// Terminal status observed on the stream.
    Terminal(JobStatus),
    /// The stream failed or closed before a terminal status.
    Fallback,
    Cancelled,
}

/// A driver's hold on its job id. The generation pins a release to the
/// claim it took: a cancelled driver can outlive `shutdown()` inside an
/// in-flight request, and its late exit must not strip a replacement
/// driver's entry for the same id.
struct Claim {
    token: CancellationToken,
    generation: u64,
}

pub struct IngestTracker {
    api: Arc<ApiClient>,
    registry: Arc<JobRegistry>,
    poll_config: PollConfig,
    /// One claim per job id. Holding the token here is what makes a
    /// driver the id's single update source, stream and poll phases
    /// alike; it is released only when the driver ends.
    claims: Mutex<HashMap<String, Claim>>,
    claim_seq: AtomicU64,
    events: broadcast::Sender<TrackerEvent>,
}

impl IngestTracker {
    pub fn new(api: Arc<ApiClient>, registry: Arc<JobRegistry>) -> Arc<Self> {
        Self::with_poll_config(api, registry, PollConfig::default())
    }

    pub fn with_poll_config(
        api: Arc<ApiClient>,
        registry: Arc<JobRegistry>,
        poll_config: PollConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            api,
            registry,
            poll_config,
            claims: Mutex::new(HashMap::new()),
            claim_seq: AtomicU64::new(0),
            events,
        })
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Ids with a live driver.
    pub fn active_jobs(&self) -> Vec<String> {
        match self.claims.lock() {
            Ok(claims) => claims.keys().cloned().collect(),
            Err(e) => {
                tracing::error!("claims lock poisoned: {e}");
                Vec::new()
            }
        }
    }

    /// Submit a statement. On `Accepted` the job is registered and its
    /// driver starts before this returns; the other outcomes leave no
    /// trace here.
    pub async fn submit(self: &Arc<Self>, file: &Path) -> Result<SubmitResponse, ApiError> {
        self.submit_inner(file, None).await
    }

    /// Submit with the document password. This is a fresh submission in
    /// its own right, not a resume of the attempt that reported
    /// `PasswordRequired`.
    pub async fn submit_with_password(
        self: &Arc<Self>,
        file: &Path,
        password: &str,
    ) -> Result<SubmitResponse, ApiError> {
        self.submit_inner(file, Some(password)).await
    }

    async fn submit_inner(
        self: &Arc<Self>,
        file: &Path,
        password: Option<&str>,
    ) -> Result<SubmitResponse, ApiError> {
        let response = self.api.submit_statement(file, password).await?;
        match &response {
            SubmitResponse::Accepted { job_id } => {
                let filename = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.display().to_string());
                info!(job_id = %job_id, filename = %filename, "statement accepted for processing");
                self.track(Job::pending(job_id.clone(), filename));
            }
            SubmitResponse::Completed(receipt) => {
                info!(
                    statement_id = %receipt.statement_id,
                    transactions = receipt.transaction_count,
                    "statement processed synchronously"
                );
            }
            SubmitResponse::PasswordRequired => {
                debug!("statement is password-protected; caller must resubmit with credentials");
            }
        }
        Ok(response)
    }

    /// Re-attach drivers to jobs still running server-side. Safe to call
    /// repeatedly: ids that already have a driver are left untouched.
    /// Returns the number of drivers started.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, ApiError> {
        let jobs = self.api.jobs().await?;
        let mut resumed = 0;
        for details in jobs.into_iter().filter(|d| !d.status.is_terminal()) {
            if self.is_claimed(&details.id) {
                debug!(job_id = %details.id, "already driven, leaving as is");
                continue;
            }
            if self.track(Job::from(details)) {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Cancel every active driver. Idempotent; final registry entries
    /// stay readable afterwards.
    pub fn shutdown(&self) {
        let claims: Vec<Claim> = match self.claims.lock() {
            Ok(mut claims) => claims.drain().map(|(_, claim)| claim).collect(),
            Err(e) => {
                tracing::error!("claims lock poisoned: {e}");
                return;
            }
        };
        for claim in &claims {
            claim.token.cancel();
        }
        if !claims.is_empty() {
            info!(drivers = claims.len(), "tracker shut down");
        }
    }

    // ── Driver internals ────────────────────────────────────────────────

    /// Register `job` and start its driver. Returns false when the id is
    /// already claimed. Callers that checked first hitting this anyway
    /// means two paths raced for one id, which is worth a loud log and
    /// nothing else (the incumbent driver keeps the job).
    fn track(self: &Arc<Self>, job: Job) -> bool {
        let Some((cancel, generation)) = self.try_claim(&job.id) else {
            warn!(job_id = %job.id, "id already claimed by a live driver; not starting another");
            return false;
        };
        self.registry.upsert(job.clone());
        self.emit(TrackerEvent::JobRegistered { job: job.clone() });

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracker.drive(&job.id, &cancel).await;
            tracker.release_claim(&job.id, generation);
        });
        true
    }

    fn is_claimed(&self, job_id: &str) -> bool {
        match self.claims.lock() {
            Ok(claims) => claims.contains_key(job_id),
            Err(e) => {
                tracing::error!("claims lock poisoned: {e}");
                false
            }
        }
    }

    fn try_claim(&self, job_id: &str) -> Option<(CancellationToken, u64)> {
        let mut claims = match self.claims.lock() {
            Ok(claims) => claims,
            Err(e) => {
                tracing::error!("claims lock poisoned: {e}");
                return None;
            }
        };
        if claims.contains_key(job_id) {
            return None;
        }
        let token = CancellationToken::new();
        let generation = self.claim_seq.fetch_add(1, Ordering::Relaxed);
        claims.insert(
            job_id.to_string(),
            Claim {
                token: token.clone(),
                generation,
            },
        );
        Some((token, generation))
    }

    /// Remove exactly the claim `generation` refers to. By the time a
    /// driver cancelled by `shutdown()` gets here, `resume_pending` may
    /// already have handed its id to a new driver; that claim stays.
    fn release_claim(&self, job_id: &str, generation: u64) {
        match self.claims.lock() {
            Ok(mut claims) => {
                if claims.get(job_id).is_some_and(|c| c.generation == generation) {
                    claims.remove(job_id);
                }
            }
            Err(e) => tracing::error!("claims lock poisoned: {e}"),
        }
    }

    /// One job's single update source, start to finish.
    async fn drive(&self, job_id: &str, cancel: &CancellationToken) {
        match self.stream_phase(job_id, cancel).await {
            StreamPhase::Terminal(status) => self.finish(job_id, status).await,
            StreamPhase::Cancelled => {}
            StreamPhase::Fallback => {
                debug!(job_id = %job_id, "falling back to polling");
                let outcome =
                    poller::run(&self.api, job_id, &self.poll_config, cancel, |details| {
                        self.apply(&JobUpdate::from(details.clone()));
                    })
                    .await;
                match outcome {
                    PollOutcome::Terminal(details) => self.finish(job_id, details.status).await,
                    PollOutcome::Gone => {
                        debug!(job_id = %job_id, "job gone server-side; tracking stopped")
                    }
                    PollOutcome::Exhausted => {
                        debug!(job_id = %job_id, "tracking stopped at the attempt cap")
                    }
                    PollOutcome::Cancelled => {}
                }
            }
        }
    }

    async fn stream_phase(&self, job_id: &str, cancel: &CancellationToken) -> StreamPhase {
        let mut stream = JobStream::connect(Arc::clone(&self.api), job_id);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    stream.close();
                    return StreamPhase::Cancelled;
                }
                event = stream.next_event() => event,
            };
            match event {
                Some(StreamEvent::Update { update, .. }) => {
                    if update.id != job_id {
                        warn!(
                            job_id = %job_id,
                            update_id = %update.id,
                            "per-job stream delivered an update for another id; ignoring"
                        );
                        continue;
                    }
                    let status = update.status;
                    self.apply(&update);
                    if status.is_terminal() {
                        stream.close();
                        return StreamPhase::Terminal(status);
                    }
                }
                Some(StreamEvent::Raw { event, data }) => {
                    debug!(job_id = %job_id, event = %event, bytes = data.len(), "unparsed stream record");
                }
                Some(StreamEvent::Error(e)) => {
                    debug!(job_id = %job_id, error = %e, "stream failed before a terminal status");
                    stream.close();
                    return StreamPhase::Fallback;
                }
                Some(StreamEvent::Closed) => {
                    debug!(job_id = %job_id, "stream closed before a terminal status");
                    stream.close();
                    return StreamPhase::Fallback;
                }
                None => {
                    stream.close();
                    return StreamPhase::Fallback;
                }
            }
        }
    }

    /// Apply an update to the registry and announce it if it changed the
    /// entry. Unknown ids and terminal-frozen entries drop silently.
    fn apply(&self, update: &JobUpdate) {
        if let Some(job) = self.registry.apply(update) {
            self.emit(TrackerEvent::JobUpdated { job });
        }
    }

    /// Terminal bookkeeping. Runs exactly once per driven job: the stream
    /// and poll phases both funnel their terminal observation here, and a
    /// driver ends right after.
    async fn finish(&self, job_id: &str, status: JobStatus) {
        if let Some(job) = self.registry.find(job_id) {
            self.emit(TrackerEvent::JobFinished { job });
        }
        if status == JobStatus::Completed {
            match self.api.usage().await {
                Ok(usage) => {
                    info!(
                        job_id = %job_id,
                        used = usage.statements_used,
                        limit = usage.statement_limit,
                        "import complete; usage refreshed"
                    );
                    self.emit(TrackerEvent::UsageRefreshed { usage });
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "usage refresh failed"),
            }
        }
    }

    /// No receivers is normal (headless use); send errors are ignored.
    fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }
}
