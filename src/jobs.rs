use crate::gate::{Admission, ConcurrencyGate, SlotGuard};
use crate::models::{CreateJobRequest, Job, QuotaDecision, RequestError};
use crate::processor::{JobProcessor, ProcessOutcome};
use crate::quota::QuotaChecker;
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use rand::Rng;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CreateJobError {
    #[error(transparent)]
    Invalid(#[from] RequestError),
    #[error("{}", .0.message)]
    QuotaExceeded(QuotaDecision),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job: Job,
    pub admission: Admission,
    pub quota: QuotaDecision,
}

/// Accepts jobs, admits them through the gate and backfills free slots from
/// the pending backlog.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    gate: ConcurrencyGate,
    processor: JobProcessor,
    quota: QuotaChecker,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        gate: ConcurrencyGate,
        processor: JobProcessor,
        quota: QuotaChecker,
    ) -> Self {
        Self {
            store,
            gate,
            processor,
            quota,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub async fn create_job(
        &self,
        user_id: &str,
        request: CreateJobRequest,
    ) -> Result<CreatedJob, CreateJobError> {
        request.validate()?;
        let quota = self.quota.check(user_id).await;
        if !quota.allowed {
            info!(target = "listro.quota", user_id = %user_id, used = quota.used, "quota exceeded");
            return Err(CreateJobError::QuotaExceeded(quota));
        }

        let job = Job::new(user_id, request);
        self.store.insert_job(&job).await?;
        let admission = self.submit(job.id);
        info!(
            target = "listro.jobs",
            job_id = %job.id,
            user_id = %user_id,
            prompts = job.prompts.len(),
            admission = ?admission,
            "job created"
        );
        Ok(CreatedJob {
            job,
            admission,
            quota,
        })
    }

    /// Starts the job if the gate has room; otherwise it stays pending in the
    /// store until a slot frees up or the sweeper picks it up.
    pub fn submit(&self, id: Uuid) -> Admission {
        let admission = self.gate.admit(id);
        if admission == Admission::Admitted {
            self.spawn(id);
        }
        admission
    }

    fn spawn(&self, id: Uuid) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let backfill = {
                let _slot = SlotGuard::new(runner.gate.clone(), id);
                match runner.processor.process(id).await {
                    Ok(ProcessOutcome::Skipped) => {
                        debug!(target = "listro.jobs", job_id = %id, "job not claimable; skipped");
                        true
                    }
                    Ok(ProcessOutcome::LeaseLost) => {
                        warn!(target = "listro.jobs", job_id = %id, "job handed to another worker");
                        true
                    }
                    Ok(ProcessOutcome::Finished { .. }) => true,
                    Err(err) => {
                        error!(target = "listro.jobs", job_id = %id, error = %err, "job processing error");
                        false
                    }
                }
            };
            // after a store error the next pull returns the same ids; the sweeper retries them
            if backfill {
                runner.pull_pending().await;
            }
        })
    }

    /// Admits the oldest pending jobs into free slots. Returns how many started.
    pub async fn pull_pending(&self) -> usize {
        let free = self.gate.available();
        if free == 0 {
            return 0;
        }
        // ask for a few extra: some pending rows may already hold a slot here
        let candidates = match self.store.oldest_pending(free + self.gate.in_flight()).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(target = "listro.jobs", error = %err, "could not load pending jobs");
                return 0;
            }
        };
        let mut started = 0;
        for id in candidates {
            match self.submit(id) {
                Admission::Admitted => started += 1,
                Admission::AlreadyRunning => continue,
                Admission::AtCapacity => break,
            }
        }
        if started > 0 {
            debug!(target = "listro.jobs", started, "pulled pending jobs");
        }
        started
    }

    /// Returns expired leases to `pending`, then fills free slots.
    pub async fn sweep_once(&self) -> usize {
        match self.store.reclaim_expired(Utc::now()).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                warn!(
                    target = "listro.jobs",
                    count = reclaimed.len(),
                    jobs = ?reclaimed,
                    "reclaimed jobs with expired leases"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target = "listro.jobs", error = %err, "lease sweep failed");
            }
        }
        self.pull_pending().await
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                let jitter_ms = rand::rng().random_range(0..=interval.as_millis() as u64 / 10);
                tokio::time::sleep(interval + Duration::from_millis(jitter_ms)).await;
                runner.sweep_once().await;
            }
        })
    }
}
