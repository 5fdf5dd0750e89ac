use crate::generator::{ContentGenerator, GenerationError};
use crate::llm::LlmError;
use crate::models::{GeneratedResult, Job, JobStatus, ResultMetadata};
use crate::store::{JobOutcome, JobStore, StoreError};
use chrono::Utc;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("job {0} disappeared after claim")]
    Missing(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another worker owns the job or it is no longer pending.
    Skipped,
    /// The claim moved to another worker mid-run; nothing was written.
    LeaseLost,
    Finished {
        status: JobStatus,
        results: usize,
        failed_prompts: usize,
    },
}

#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    generator: ContentGenerator,
    worker_id: String,
    lease: Duration,
    prompt_timeout: Option<Duration>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        generator: ContentGenerator,
        worker_id: impl Into<String>,
        lease: Duration,
        prompt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            generator,
            worker_id: worker_id.into(),
            lease,
            prompt_timeout,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lease_deadline(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::minutes(5))
    }

    /// Claims and runs one job to a terminal state.
    pub async fn process(&self, id: Uuid) -> Result<ProcessOutcome, JobError> {
        if !self
            .store
            .claim_job(id, &self.worker_id, self.lease_deadline())
            .await?
        {
            return Ok(ProcessOutcome::Skipped);
        }

        let started = Instant::now();
        let (lost_tx, lost_rx) = watch::channel(false);
        let _heartbeat = HeartbeatGuard(self.spawn_heartbeat(id, lost_tx));
        info!(target = "listro.jobs", job_id = %id, worker = %self.worker_id, "job claimed");

        match self.run_claimed(id, lost_rx).await {
            Ok(outcome) => {
                if let ProcessOutcome::Finished { status, results, .. } = outcome {
                    crate::metrics::job_finished(status, results, started.elapsed().as_millis());
                }
                Ok(outcome)
            }
            Err(err) => {
                warn!(target = "listro.jobs", job_id = %id, error = %err, "job failed outside prompt loop");
                let failed = JobOutcome {
                    status: JobStatus::Failed,
                    results: Vec::new(),
                    error_message: Some(err.to_string()),
                    completed_at: Utc::now(),
                };
                match self.store.complete_job(id, &self.worker_id, failed).await {
                    Ok(true) => {
                        crate::metrics::job_finished(JobStatus::Failed, 0, started.elapsed().as_millis());
                    }
                    Ok(false) => {
                        warn!(target = "listro.jobs", job_id = %id, "claim lost before job could be marked failed");
                    }
                    Err(store_err) => {
                        warn!(target = "listro.jobs", job_id = %id, error = %store_err, "could not mark job failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn run_claimed(
        &self,
        id: Uuid,
        mut lost: watch::Receiver<bool>,
    ) -> Result<ProcessOutcome, JobError> {
        let job = self.store.get_job(id).await?.ok_or(JobError::Missing(id))?;

        let mut results = Vec::with_capacity(job.prompts.len());
        let mut failures = Vec::new();
        for (idx, prompt) in job.prompts.iter().enumerate() {
            let prompt_started = Instant::now();
            let generated = tokio::select! {
                generated = self.generate_one(&job, prompt) => generated,
                _ = lease_lost(&mut lost) => {
                    warn!(target = "listro.jobs", job_id = %id, prompt_index = idx, "lease lost; abandoning job");
                    return Ok(ProcessOutcome::LeaseLost);
                }
            };
            match generated {
                Ok(text) => results.push(build_result(&job, prompt, text)),
                Err(err) => {
                    warn!(
                        target = "listro.jobs",
                        job_id = %id,
                        prompt_index = idx,
                        error = %err,
                        "prompt generation failed"
                    );
                    failures.push(err.to_string());
                }
            }
            crate::metrics::prompt_elapsed(prompt_started.elapsed().as_millis());
        }

        let (status, error_message) = terminal_state(job.prompts.len(), &failures);
        let produced = results.len();
        let written = self
            .store
            .complete_job(
                id,
                &self.worker_id,
                JobOutcome {
                    status,
                    results,
                    error_message,
                    completed_at: Utc::now(),
                },
            )
            .await?;
        if !written {
            warn!(target = "listro.jobs", job_id = %id, "claim moved on before completion; results dropped");
            return Ok(ProcessOutcome::LeaseLost);
        }

        info!(
            target = "listro.jobs",
            job_id = %id,
            status = %status,
            results = produced,
            failed_prompts = failures.len(),
            "job finished"
        );
        Ok(ProcessOutcome::Finished {
            status,
            results: produced,
            failed_prompts: failures.len(),
        })
    }

    async fn generate_one(&self, job: &Job, prompt: &str) -> Result<String, GenerationError> {
        let fut = self.generator.generate(prompt, job.kind, &job.options);
        let content = match self.prompt_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| GenerationError::Primary(LlmError::Timeout(limit.as_secs())))??,
            None => fut.await?,
        };
        Ok(content.render())
    }

    fn spawn_heartbeat(&self, id: Uuid, lost: watch::Sender<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let worker = self.worker_id.clone();
        let lease = self.lease;
        tokio::spawn(async move {
            let every = (lease / 3).max(Duration::from_millis(10));
            loop {
                tokio::time::sleep(every).await;
                let until =
                    Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::minutes(5));
                match store.renew_lease(id, &worker, until).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(target = "listro.jobs", job_id = %id, "lease lost");
                        let _ = lost.send(true);
                        break;
                    }
                    Err(err) => {
                        warn!(target = "listro.jobs", job_id = %id, error = %err, "lease renewal failed");
                    }
                }
            }
        })
    }
}

/// Resolves once the heartbeat reports the lease gone. Never resolves if the
/// heartbeat stopped without reporting.
async fn lease_lost(lost: &mut watch::Receiver<bool>) {
    if lost.wait_for(|gone| *gone).await.is_err() {
        std::future::pending::<()>().await;
    }
}

struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn build_result(job: &Job, prompt: &str, generated_text: String) -> GeneratedResult {
    let metadata = ResultMetadata {
        duration: job.options.duration.map(|d| d.seconds()),
        size: Some(generated_text.len() as u64),
        format: job.options.format,
    };
    GeneratedResult {
        id: Uuid::new_v4(),
        job_id: job.id,
        prompt: prompt.to_string(),
        generated_text,
        kind: job.kind,
        media_url: None,
        thumbnail_url: None,
        metadata: Some(metadata),
        feedback: None,
        created_at: Utc::now(),
    }
}

/// All prompts ok → completed, some → partially completed, none → failed.
fn terminal_state(total: usize, failures: &[String]) -> (JobStatus, Option<String>) {
    let last = failures.last().cloned().unwrap_or_default();
    match failures.len() {
        0 => (JobStatus::Completed, None),
        n if n >= total => (
            JobStatus::Failed,
            Some(format!("all {total} prompts failed; last error: {last}")),
        ),
        n => (
            JobStatus::PartiallyCompleted,
            Some(format!("{n} of {total} prompts failed; last error: {last}")),
        ),
    }
}
