// crates/api/src/client.rs
//! Typed client for the ingestion endpoints.

use std::path::Path;
use std::sync::Arc;

use reqwest::multipart;
use reqwest::StatusCode;
use spendlens_types::{
    ErrorBody, ImportReceipt, JobAccepted, JobDetails, SubmitResponse, UsageSummary,
};

use crate::auth::TokenProvider;
use crate::error::ApiError;

// ── Constants ───────────────────────────────────────────────────────────

pub const API_URL_ENV: &str = "SPENDLENS_API_URL";
pub const DEFAULT_API_URL: &str = "https://api.spendlens.app";

/// 422 body marker for an encrypted PDF submitted without a password.
const PASSWORD_REQUIRED: &str = "password_required";

/// Base URL from `SPENDLENS_API_URL`, falling back to production.
pub fn api_url_from_env() -> String {
    std::env::var(API_URL_ENV)
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

// ── Client ──────────────────────────────────────────────────────────────

/// One client per process; cheap to clone via `Arc`. Holds no token; the
/// provider is consulted per request.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Attach the bearer token when one is available. Requests without a
    /// token still go out; protected routes answer 401.
    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Upload a statement PDF. Set `password` only when retrying after a
    /// `PasswordRequired` outcome; the retry is a fresh submission.
    pub async fn submit_statement(
        &self,
        file: &Path,
        password: Option<&str>,
    ) -> Result<SubmitResponse, ApiError> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| ApiError::file(file, e))?;
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "statement.pdf".to_string());

        let part = multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/pdf")?;
        let mut form = multipart::Form::new().part("file", part);
        if let Some(password) = password {
            form = form.text("password", password.to_string());
        }

        let resp = self
            .authed(self.http.post(format!("{}/api/statements", self.base_url)))
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::OK => {
                let receipt: ImportReceipt = serde_json::from_str(&body)?;
                Ok(SubmitResponse::Completed(receipt))
            }
            StatusCode::ACCEPTED => {
                let accepted: JobAccepted = serde_json::from_str(&body)?;
                Ok(SubmitResponse::Accepted {
                    job_id: accepted.job_id,
                })
            }
            StatusCode::UNPROCESSABLE_ENTITY => match serde_json::from_str::<ErrorBody>(&body) {
                Ok(e) if e.error == PASSWORD_REQUIRED => Ok(SubmitResponse::PasswordRequired),
                _ => Err(ApiError::status(status, body)),
            },
            s => Err(ApiError::status(s, body)),
        }
    }

    /// Current state of one job. A 404 maps to `ApiError::JobNotFound`.
    pub async fn job(&self, id: &str) -> Result<JobDetails, ApiError> {
        let resp = self
            .authed(
                self.http
                    .get(format!("{}/api/statements/jobs/{id}", self.base_url)),
            )
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ApiError::JobNotFound { id: id.to_string() }),
            s if s.is_success() => Ok(resp.json::<JobDetails>().await?),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(ApiError::status(s, body))
            }
        }
    }

    /// All jobs for the authenticated user, terminal ones included.
    pub async fn jobs(&self) -> Result<Vec<JobDetails>, ApiError> {
        let resp = self
            .authed(
                self.http
                    .get(format!("{}/api/statements/jobs", self.base_url)),
            )
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::status(status, body));
        }
        Ok(resp.json::<Vec<JobDetails>>().await?)
    }

    /// Current period usage; fetched after each completed import.
    pub async fn usage(&self) -> Result<UsageSummary, ApiError> {
        let resp = self
            .authed(self.http.get(format!("{}/api/usage", self.base_url)))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::status(status, body));
        }
        Ok(resp.json::<UsageSummary>().await?)
    }

    /// Open the per-job event stream. The returned response is checked for
    /// a success status; reading and parsing the body is the caller's job.
    pub async fn open_job_events(&self, id: &str) -> Result<reqwest::Response, ApiError> {
        let resp = self
            .authed(
                self.http
                    .get(format!("{}/api/statements/jobs/{id}/events", self.base_url)),
            )
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::status(status, body));
        }
        Ok(resp)
    }
}
