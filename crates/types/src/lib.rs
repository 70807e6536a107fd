// crates/types/src/lib.rs
//! Shared types for the spendlens client: the tracked `Job` record, its
//! status enum, and the wire DTOs exchanged with the ingestion API.

pub mod job;
pub mod wire;

pub use job::*;
pub use wire::*;
