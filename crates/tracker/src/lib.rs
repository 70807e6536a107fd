// crates/tracker/src/lib.rs
//! Client-side tracking for asynchronous statement-ingestion jobs.
//!
//! A submitted statement is processed out-of-band; this crate follows the
//! server-side job to completion without blocking the caller. The pieces:
//!
//! - [`registry::JobRegistry`]: shared table of tracked jobs.
//! - [`stream::JobStream`]: per-job `text/event-stream` consumer.
//! - [`poller`]: adaptive-backoff status polling, the fallback when
//!   streaming is unavailable.
//! - [`tracker::IngestTracker`]: the controller tying it together. One
//!   driver per job id (stream phase, then a hard cutover to polling),
//!   terminal side effects, rehydration.

pub mod poller;
pub mod registry;
pub mod sse;
pub mod stream;
pub mod tracker;

pub use poller::{BackoffSchedule, PollConfig, PollOutcome};
pub use registry::*;
pub use sse::*;
pub use stream::*;
pub use tracker::*;
