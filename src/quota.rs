use crate::models::QuotaDecision;
use crate::store::JobStore;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::warn;

const WINDOW_HOURS: i64 = 24;

/// Rolling 24-hour cap on job creation per user.
#[derive(Clone)]
pub struct QuotaChecker {
    store: Arc<dyn JobStore>,
    limit: u64,
}

impl QuotaChecker {
    pub fn new(store: Arc<dyn JobStore>, limit: u64) -> Self {
        Self { store, limit }
    }

    /// Fails open: when the count cannot be read the request is allowed and
    /// the decision is flagged `degraded`.
    pub async fn check(&self, user_id: &str) -> QuotaDecision {
        let since = Utc::now() - Duration::hours(WINDOW_HOURS);
        match self.store.count_jobs_since(user_id, since).await {
            Ok(used) => decide(used, self.limit),
            Err(err) => {
                warn!(
                    target = "listro.quota",
                    user_id = %user_id,
                    error = %err,
                    "quota count unavailable; allowing request"
                );
                QuotaDecision {
                    allowed: true,
                    used: 0,
                    limit: self.limit,
                    remaining: self.limit,
                    degraded: true,
                    message: "Quota could not be verified; request allowed".into(),
                }
            }
        }
    }
}

fn decide(used: u64, limit: u64) -> QuotaDecision {
    let remaining = limit.saturating_sub(used);
    let allowed = used < limit;
    let message = if allowed {
        format!("{remaining} of {limit} jobs remaining in the last 24 hours")
    } else {
        format!("Daily limit of {limit} jobs reached; try again later")
    };
    QuotaDecision {
        allowed,
        used,
        limit,
        remaining,
        degraded: false,
        message,
    }
}
