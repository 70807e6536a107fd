// crates/api/src/lib.rs
//! HTTP client for the spendlens ingestion API: statement submission, job
//! status, the per-job event stream, and usage/quota.
//!
//! The client is deliberately thin: it types the wire contracts and maps
//! status codes, while all tracking policy (fallback, backoff, claims)
//! lives in spendlens-tracker.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::*;
pub use client::*;
pub use error::*;
