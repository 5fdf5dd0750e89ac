use super::{JobOutcome, JobStore, JobTiming, StoreError};
use crate::models::{Feedback, GeneratedResult, Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local store used when no Supabase project is configured.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
    failing_claims: Arc<AtomicBool>,
    claim_attempts: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    job_order: Vec<Uuid>,
    results: Vec<GeneratedResult>,
    feedback: Vec<Feedback>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, simulating an unreachable backend.
    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes `claim_job` fail while everything else keeps working.
    #[cfg(test)]
    pub fn set_claims_failing(&self, failing: bool) {
        self.failing_claims.store(failing, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn claim_attempts(&self) -> usize {
        self.claim_attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Request("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.check()?;
        let mut guard = self.inner.lock().await;
        let mut stored = job.clone();
        stored.results = None;
        if guard.jobs.insert(job.id, stored).is_none() {
            guard.job_order.push(job.id);
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.check()?;
        let guard = self.inner.lock().await;
        Ok(guard.jobs.get(&id).cloned().map(|mut job| {
            let results: Vec<_> = guard
                .results
                .iter()
                .filter(|r| r.job_id == id)
                .cloned()
                .collect();
            if !results.is_empty() {
                job.results = Some(results);
            }
            job
        }))
    }

    async fn claim_job(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.claim_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing_claims.load(Ordering::SeqCst) {
            return Err(StoreError::Request("claim rejected".into()));
        }
        let mut guard = self.inner.lock().await;
        let Some(job) = guard.jobs.get_mut(&id) else {
            return Err(StoreError::NotFound("job"));
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::Processing;
        job.claimed_by = Some(worker.to_string());
        job.lease_expires_at = Some(lease_until);
        job.attempts += 1;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut guard = self.inner.lock().await;
        match guard.jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.claimed_by.as_deref() == Some(worker) =>
            {
                job.lease_expires_at = Some(lease_until);
                job.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound("job")),
        }
    }

    async fn complete_job(
        &self,
        id: Uuid,
        worker: &str,
        outcome: JobOutcome,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut guard = self.inner.lock().await;
        let Some(job) = guard.jobs.get_mut(&id) else {
            return Err(StoreError::NotFound("job"));
        };
        if job.status != JobStatus::Processing || job.claimed_by.as_deref() != Some(worker) {
            return Ok(false);
        }
        job.status = outcome.status;
        job.error_message = outcome.error_message;
        job.completed_at = Some(outcome.completed_at);
        job.updated_at = outcome.completed_at;
        job.claimed_by = None;
        job.lease_expires_at = None;
        guard.results.extend(outcome.results);
        Ok(true)
    }

    async fn oldest_pending(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        self.check()?;
        let guard = self.inner.lock().await;
        let mut pending: Vec<&Job> = guard
            .job_order
            .iter()
            .filter_map(|id| guard.jobs.get(id))
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|job| job.created_at);
        Ok(pending.into_iter().take(limit).map(|job| job.id).collect())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        self.check()?;
        let mut guard = self.inner.lock().await;
        let mut reclaimed = Vec::new();
        for job in guard.jobs.values_mut() {
            let expired = job.lease_expires_at.is_some_and(|lease| lease <= now);
            if job.status == JobStatus::Processing && expired {
                job.status = JobStatus::Pending;
                job.claimed_by = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                reclaimed.push(job.id);
            }
        }
        Ok(reclaimed)
    }

    async fn count_jobs_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let guard = self.inner.lock().await;
        Ok(guard
            .jobs
            .values()
            .filter(|job| job.user_id == user_id && job.created_at > since)
            .count() as u64)
    }

    async fn list_results(&self, job_id: Uuid) -> Result<Vec<GeneratedResult>, StoreError> {
        self.check()?;
        let guard = self.inner.lock().await;
        Ok(guard
            .results
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<GeneratedResult>, StoreError> {
        self.check()?;
        let guard = self.inner.lock().await;
        Ok(guard.results.iter().find(|r| r.id == id).cloned())
    }

    async fn record_feedback(&self, feedback: &Feedback) -> Result<(), StoreError> {
        self.check()?;
        let mut guard = self.inner.lock().await;
        let Some(result) = guard.results.iter_mut().find(|r| r.id == feedback.result_id) else {
            return Err(StoreError::NotFound("result"));
        };
        result.feedback = Some(feedback.clone());
        guard.feedback.push(feedback.clone());
        Ok(())
    }

    async fn recent_feedback(&self, limit: usize) -> Result<Vec<Feedback>, StoreError> {
        self.check()?;
        let guard = self.inner.lock().await;
        let mut rows = guard.feedback.clone();
        rows.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_jobs(&self) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.inner.lock().await.jobs.len() as u64)
    }

    async fn finished_job_timings(&self) -> Result<Vec<JobTiming>, StoreError> {
        self.check()?;
        let guard = self.inner.lock().await;
        Ok(guard
            .jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .map(|job| JobTiming {
                status: job.status,
                created_at: job.created_at,
                completed_at: job.completed_at,
            })
            .collect())
    }
}
