mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use crate::models::{Feedback, GeneratedResult, Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// Terminal write for a job: status, results and an optional error message.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub results: Vec<GeneratedResult>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Created/completed timestamps of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTiming {
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persistence for jobs, results and feedback.
///
/// Every status change is conditional on the row's current state: claims need
/// `pending`, terminal writes need `processing` under the writer's claim.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Job with its results attached, if any.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Moves a `pending` job to `processing` under a lease. Returns `false`
    /// when the row was not pending.
    async fn claim_job(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Extends the lease if `worker` still holds it.
    async fn renew_lease(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Writes the terminal state if `worker` still holds the claim. Returns
    /// `false` and writes nothing once the claim has moved on.
    async fn complete_job(
        &self,
        id: Uuid,
        worker: &str,
        outcome: JobOutcome,
    ) -> Result<bool, StoreError>;

    /// Oldest pending jobs by creation time.
    async fn oldest_pending(&self, limit: usize) -> Result<Vec<Uuid>, StoreError>;

    /// Resets `processing` jobs whose lease expired back to `pending`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    async fn count_jobs_since(&self, user_id: &str, since: DateTime<Utc>)
    -> Result<u64, StoreError>;

    async fn list_results(&self, job_id: Uuid) -> Result<Vec<GeneratedResult>, StoreError>;

    async fn get_result(&self, id: Uuid) -> Result<Option<GeneratedResult>, StoreError>;

    /// Stores the feedback row and sets it as the result's current feedback.
    async fn record_feedback(&self, feedback: &Feedback) -> Result<(), StoreError>;

    async fn recent_feedback(&self, limit: usize) -> Result<Vec<Feedback>, StoreError>;

    async fn count_jobs(&self) -> Result<u64, StoreError>;

    async fn finished_job_timings(&self) -> Result<Vec<JobTiming>, StoreError>;
}
