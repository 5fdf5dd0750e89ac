use crate::models::{Feedback, FeedbackRequest, RequestError};
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error(transparent)]
    Invalid(#[from] RequestError),
    #[error("result not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct FeedbackService {
    store: Arc<dyn JobStore>,
}

impl FeedbackService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Rates a result owned by `user_id`. A later submission replaces the
    /// result's current feedback; earlier rows stay in the feedback history.
    pub async fn submit(
        &self,
        result_id: Uuid,
        user_id: &str,
        request: FeedbackRequest,
    ) -> Result<Feedback, FeedbackError> {
        request.validate()?;

        let result = self
            .store
            .get_result(result_id)
            .await?
            .ok_or(FeedbackError::NotFound)?;
        let owner = self
            .store
            .get_job(result.job_id)
            .await?
            .map(|job| job.user_id);
        if owner.as_deref() != Some(user_id) {
            return Err(FeedbackError::NotFound);
        }

        let feedback = Feedback {
            id: Uuid::new_v4(),
            result_id,
            user_id: user_id.to_string(),
            rating: request.rating,
            comment: request
                .comment
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            submitted_at: Utc::now(),
        };
        self.store.record_feedback(&feedback).await?;
        info!(
            target = "listro.feedback",
            result_id = %result_id,
            rating = feedback.rating,
            "feedback recorded"
        );
        Ok(feedback)
    }
}
