// crates/api/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the ingestion API client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("job {id} not found")]
    JobNotFound { id: String },

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("cannot read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Classify a non-success response by status code.
    pub fn status(status: reqwest::StatusCode, body: String) -> Self {
        match status {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Self::Auth {
                status: status.as_u16(),
            },
            s => Self::Http {
                status: s.as_u16(),
                body,
            },
        }
    }

    /// The benign "job no longer exists server-side" case. Callers stop
    /// tracking on it instead of reporting an error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound { .. })
    }
}
