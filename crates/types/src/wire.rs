// crates/types/src/wire.rs
//! DTOs for the ingestion API. Field names follow the server's camelCase
//! JSON; see the endpoint list in spendlens-api.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobStatus};

/// Payload of one streamed job event:
/// `{"id": "...", "status": "RUNNING", "progress": 42, "error": null}`.
///
/// Anything that fails to deserialize into this shape is delivered as an
/// opaque raw event instead, never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobUpdate {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default)]
    pub error: Option<String>,
}

/// Job body returned by `GET /api/statements/jobs/{id}` and, element-wise,
/// by the job list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub id: JobId,
    pub status: JobStatus,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub original_filename: String,
}

/// A polled job body carries the same trackable state as a streamed
/// update; converting lets both feed one merge path.
impl From<JobDetails> for JobUpdate {
    fn from(details: JobDetails) -> Self {
        Self {
            id: details.id,
            status: details.status,
            progress: details.progress_percent,
            error: details.error_message,
        }
    }
}

/// Body of a `200` submit response: the statement was small enough to
/// process inline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReceipt {
    pub statement_id: String,
    pub transaction_count: u32,
}

/// Body of a `202` submit response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: JobId,
}

/// Error envelope used by 4xx responses, e.g. `{"error": "password_required"}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Typed outcome of a statement submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    /// Processed synchronously; no job to track.
    Completed(ImportReceipt),
    /// Queued server-side; track the job by id.
    Accepted { job_id: JobId },
    /// The PDF is password-protected. Collect credentials and submit
    /// again; the retry is a fresh submission, not a resume.
    PasswordRequired,
}

/// Body of `GET /api/usage`, fetched after each completed import.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub statements_used: u32,
    pub statement_limit: u32,
    pub period_end: DateTime<Utc>,
}

impl UsageSummary {
    pub fn remaining(&self) -> u32 {
        self.statement_limit.saturating_sub(self.statements_used)
    }
}
