use crate::models::{AnalyticsReport, RATING_RANGE};
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use std::{collections::BTreeMap, sync::Arc};

/// On-demand aggregates over job and feedback history. Nothing is cached.
#[derive(Clone)]
pub struct AnalyticsAggregator {
    store: Arc<dyn JobStore>,
    feedback_limit: usize,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn JobStore>, feedback_limit: usize) -> Self {
        Self {
            store,
            feedback_limit,
        }
    }

    pub async fn report(&self) -> Result<AnalyticsReport, StoreError> {
        let total_jobs = self.store.count_jobs().await?;
        let timings = self.store.finished_job_timings().await?;

        let successful: Vec<_> = timings.iter().filter(|t| t.status.is_success()).collect();
        let completed_jobs = successful.len() as u64;
        let success_rate = if total_jobs == 0 {
            0.0
        } else {
            completed_jobs as f64 / total_jobs as f64
        };

        let durations: Vec<f64> = successful
            .iter()
            .filter_map(|t| t.completed_at.map(|done| done - t.created_at))
            .map(|delta| delta.num_milliseconds().max(0) as f64 / 1000.0)
            .collect();
        let average_duration_secs = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        let feedback = self.store.recent_feedback(self.feedback_limit).await?;
        let mut rating_distribution: BTreeMap<u8, u64> =
            RATING_RANGE.map(|rating| (rating, 0)).collect();
        for row in &feedback {
            if let Some(count) = rating_distribution.get_mut(&row.rating) {
                *count += 1;
            }
        }

        Ok(AnalyticsReport {
            total_jobs,
            completed_jobs,
            success_rate,
            average_duration_secs,
            rating_distribution,
            feedback_sampled: feedback.len(),
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ContentKind, CreateJobRequest, Feedback, GeneratedResult, GenerationOptions, Job, JobStatus,
    };
    use crate::store::{JobOutcome, MemoryStore};
    use chrono::Duration;
    use uuid::Uuid;

    fn new_job() -> Job {
        Job::new(
            "u1",
            CreateJobRequest {
                kind: ContentKind::SocialPost,
                prompts: vec!["p".into()],
                options: GenerationOptions::default(),
            },
        )
    }

    async fn finish(store: &MemoryStore, status: JobStatus, secs: i64) -> Vec<GeneratedResult> {
        let job = new_job();
        store.insert_job(&job).await.unwrap();
        let results = if status.is_success() {
            vec![GeneratedResult {
                id: Uuid::new_v4(),
                job_id: job.id,
                prompt: "p".into(),
                generated_text: "t".into(),
                kind: job.kind,
                media_url: None,
                thumbnail_url: None,
                metadata: None,
                feedback: None,
                created_at: job.created_at,
            }]
        } else {
            Vec::new()
        };
        store
            .claim_job(job.id, "w1", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        store
            .complete_job(
                job.id,
                "w1",
                JobOutcome {
                    status,
                    results: results.clone(),
                    error_message: None,
                    completed_at: job.created_at + Duration::seconds(secs),
                },
            )
            .await
            .unwrap();
        results
    }

    #[tokio::test]
    async fn empty_history() {
        let aggregator = AnalyticsAggregator::new(Arc::new(MemoryStore::new()), 10);
        let report = aggregator.report().await.unwrap();
        assert_eq!(report.total_jobs, 0);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.average_duration_secs, None);
        assert_eq!(report.rating_distribution.len(), 5);
        assert!(report.rating_distribution.values().all(|c| *c == 0));
    }

    #[tokio::test]
    async fn ratios_durations_and_ratings() {
        let store = MemoryStore::new();
        let done = finish(&store, JobStatus::Completed, 10).await;
        finish(&store, JobStatus::PartiallyCompleted, 30).await;
        finish(&store, JobStatus::Failed, 100).await;
        store.insert_job(&new_job()).await.unwrap();

        for rating in [5, 5, 3] {
            store
                .record_feedback(&Feedback {
                    id: Uuid::new_v4(),
                    result_id: done[0].id,
                    user_id: "u1".into(),
                    rating,
                    comment: None,
                    submitted_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let report = AnalyticsAggregator::new(Arc::new(store), 2)
            .report()
            .await
            .unwrap();
        assert_eq!(report.total_jobs, 4);
        assert_eq!(report.completed_jobs, 2);
        assert_eq!(report.success_rate, 0.5);
        assert_eq!(report.average_duration_secs, Some(20.0));
        assert_eq!(report.feedback_sampled, 2);
        assert_eq!(report.rating_distribution.values().sum::<u64>(), 2);
    }
}
