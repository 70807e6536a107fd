// crates/types/src/job.rs
//! The client-side job record and its status machine.

use serde::{Deserialize, Serialize};

use crate::wire::{JobDetails, JobUpdate};

/// Server-assigned job identifier. Opaque to the client.
pub type JobId = String;

/// Processing state of a statement-ingestion job.
///
/// Transitions are driven entirely by server-reported updates; the only
/// locally inferred value is the initial `Pending` recorded when a submit
/// is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states accept no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One tracked statement-processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Display name of the uploaded document. Immutable.
    pub filename: String,
    pub status: JobStatus,
    /// Latest reported percent in `[0, 100]`. Not monotonic; the client
    /// keeps whatever the server said last.
    pub progress: u8,
    /// Human-readable failure message, present only for failed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Fresh entry for a just-accepted submission.
    pub fn pending(id: impl Into<JobId>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            status: JobStatus::Pending,
            progress: 0,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Overwrite status and progress from a streamed update; the error
    /// message is replaced only when the update carries one.
    pub fn apply(&mut self, update: &JobUpdate) {
        self.status = update.status;
        self.progress = update.progress.min(100);
        if update.error.is_some() {
            self.error = update.error.clone();
        }
    }
}

impl From<JobDetails> for Job {
    fn from(details: JobDetails) -> Self {
        Self {
            id: details.id,
            filename: details.original_filename,
            status: details.status,
            progress: details.progress_percent.min(100),
            error: details.error_message,
        }
    }
}
