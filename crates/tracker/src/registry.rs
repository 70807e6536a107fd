// crates/tracker/src/registry.rs
//! Shared table of tracked jobs.

use std::sync::RwLock;

use spendlens_types::{Job, JobUpdate};

/// In-memory table of tracked jobs, in insertion order.
///
/// The registry is plain storage with a single policy of its own: a
/// terminal entry is frozen (see [`JobRegistry::apply`]). Claims, fallback
/// and side effects all belong to the tracker. Inject as
/// `Arc<JobRegistry>`; tests substitute their own instance.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<Vec<Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries in insertion order.
    pub fn get(&self) -> Vec<Job> {
        match self.jobs.read() {
            Ok(jobs) => jobs.clone(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading job registry: {e}");
                Vec::new()
            }
        }
    }

    pub fn find(&self, id: &str) -> Option<Job> {
        match self.jobs.read() {
            Ok(jobs) => jobs.iter().find(|j| j.id == id).cloned(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading job registry: {e}");
                None
            }
        }
    }

    /// Replace the whole table.
    pub fn set(&self, new_jobs: Vec<Job>) {
        match self.jobs.write() {
            Ok(mut jobs) => *jobs = new_jobs,
            Err(e) => tracing::error!("RwLock poisoned writing job registry: {e}"),
        }
    }

    /// Insert or replace by id. A replaced entry keeps its position; new
    /// ids append.
    pub fn upsert(&self, job: Job) {
        match self.jobs.write() {
            Ok(mut jobs) => match jobs.iter_mut().find(|j| j.id == job.id) {
                Some(slot) => *slot = job,
                None => jobs.push(job),
            },
            Err(e) => tracing::error!("RwLock poisoned writing job registry: {e}"),
        }
    }

    /// Merge a reported state into the entry it names. Returns the updated
    /// entry, or `None` when the id is unknown or the entry is already
    /// terminal; a stale update from an already-closed source must not
    /// reopen a finished job.
    pub fn apply(&self, update: &JobUpdate) -> Option<Job> {
        match self.jobs.write() {
            Ok(mut jobs) => {
                let slot = jobs.iter_mut().find(|j| j.id == update.id)?;
                if slot.is_terminal() {
                    return None;
                }
                slot.apply(update);
                Some(slot.clone())
            }
            Err(e) => {
                tracing::error!("RwLock poisoned writing job registry: {e}");
                None
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.jobs.write() {
            Ok(mut jobs) => {
                let before = jobs.len();
                jobs.retain(|j| j.id != id);
                jobs.len() != before
            }
            Err(e) => {
                tracing::error!("RwLock poisoned writing job registry: {e}");
                false
            }
        }
    }

    pub fn clear(&self) {
        match self.jobs.write() {
            Ok(mut jobs) => jobs.clear(),
            Err(e) => tracing::error!("RwLock poisoned writing job registry: {e}"),
        }
    }

    pub fn len(&self) -> usize {
        match self.jobs.read() {
            Ok(jobs) => jobs.len(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading job registry: {e}");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
