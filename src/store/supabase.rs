use super::{JobOutcome, JobStore, JobTiming, StoreError};
use crate::config::HttpSettings;
use crate::http::build_client;
use crate::models::{Feedback, GeneratedResult, Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, header::CONTENT_RANGE};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use urlencoding::encode;
use uuid::Uuid;

/// PostgREST-backed store over the `jobs`, `results` and `feedback` tables.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: Uuid,
}

/// Only the columns a claim needs; a row with a broken payload can still be claimed.
#[derive(Debug, Deserialize)]
struct ClaimRow {
    status: JobStatus,
    #[serde(default)]
    attempts: u32,
}

impl SupabaseStore {
    pub fn from_env(http: HttpSettings) -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(http),
        })
    }

    fn url(&self, table: &str, query: &str) -> String {
        format!("{}/rest/v1/{table}?{query}", self.base_url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Vec<T>, StoreError> {
        self.send(self.http.get(self.url(table, query)))
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    /// PATCH returning the ids of the rows it touched.
    async fn patch(
        &self,
        table: &str,
        query: &str,
        body: serde_json::Value,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<IdRow> = self
            .send(
                self.http
                    .patch(self.url(table, &format!("{query}&select=id")))
                    .header("Prefer", "return=representation")
                    .json(&body),
            )
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    async fn insert<T: Serialize + ?Sized>(&self, table: &str, body: &T) -> Result<(), StoreError> {
        self.send(
            self.http
                .post(self.url(table, ""))
                .header("Prefer", "return=minimal")
                .json(body),
        )
        .await?;
        Ok(())
    }

    async fn count(&self, table: &str, query: &str) -> Result<u64, StoreError> {
        let response = self
            .send(
                self.http
                    .get(self.url(table, &format!("{query}&select=id")))
                    .header("Prefer", "count=exact")
                    .header("Range-Unit", "items")
                    .header("Range", "0-0"),
            )
            .await?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Deserialize("missing Content-Range total".into()))
    }
}

/// Filter matching a job that is still processing under `worker`'s claim.
fn held_by(id: Uuid, worker: &str) -> String {
    format!(
        "id=eq.{id}&status=eq.processing&claimed_by=eq.{}",
        encode(worker)
    )
}

fn timestamp(value: DateTime<Utc>) -> String {
    encode(&value.to_rfc3339_opts(SecondsFormat::Micros, true)).into_owned()
}

/// Total from a PostgREST `Content-Range` header such as `0-0/42` or `*/0`.
fn parse_content_range_total(raw: &str) -> Option<u64> {
    raw.rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse::<u64>().ok())
}

#[async_trait]
impl JobStore for SupabaseStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut row = job.clone();
        row.results = None;
        self.insert("jobs", &row).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut rows: Vec<Job> = self
            .fetch("jobs", &format!("id=eq.{id}&select=*&limit=1"))
            .await?;
        let Some(mut job) = rows.pop() else {
            return Ok(None);
        };
        let results = self.list_results(id).await?;
        if !results.is_empty() {
            job.results = Some(results);
        }
        Ok(Some(job))
    }

    async fn claim_job(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(current) = self
            .fetch::<ClaimRow>("jobs", &format!("id=eq.{id}&select=status,attempts&limit=1"))
            .await?
            .pop()
        else {
            return Err(StoreError::NotFound("job"));
        };
        if current.status != JobStatus::Pending {
            return Ok(false);
        }
        // The attempts filter makes the update lose against a concurrent claim.
        let touched = self
            .patch(
                "jobs",
                &format!(
                    "id=eq.{id}&status=eq.pending&attempts=eq.{}",
                    current.attempts
                ),
                json!({
                    "status": JobStatus::Processing,
                    "claimed_by": worker,
                    "lease_expires_at": lease_until,
                    "attempts": current.attempts + 1,
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        Ok(!touched.is_empty())
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let touched = self
            .patch(
                "jobs",
                &held_by(id, worker),
                json!({ "lease_expires_at": lease_until, "updated_at": Utc::now() }),
            )
            .await?;
        Ok(!touched.is_empty())
    }

    async fn complete_job(
        &self,
        id: Uuid,
        worker: &str,
        outcome: JobOutcome,
    ) -> Result<bool, StoreError> {
        // the status flip decides ownership; results follow only for the winner
        let touched = self
            .patch(
                "jobs",
                &held_by(id, worker),
                json!({
                    "status": outcome.status,
                    "error_message": outcome.error_message,
                    "completed_at": outcome.completed_at,
                    "updated_at": outcome.completed_at,
                    "claimed_by": null,
                    "lease_expires_at": null,
                }),
            )
            .await?;
        if touched.is_empty() {
            return Ok(false);
        }
        if !outcome.results.is_empty() {
            self.insert("results", &outcome.results).await?;
        }
        Ok(true)
    }

    async fn oldest_pending(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<IdRow> = self
            .fetch(
                "jobs",
                &format!("status=eq.pending&select=id&order=created_at.asc&limit={limit}"),
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        self.patch(
            "jobs",
            &format!(
                "status=eq.processing&lease_expires_at=lt.{}",
                timestamp(now)
            ),
            json!({
                "status": JobStatus::Pending,
                "claimed_by": null,
                "lease_expires_at": null,
                "updated_at": now,
            }),
        )
        .await
    }

    async fn count_jobs_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.count(
            "jobs",
            &format!(
                "user_id=eq.{}&created_at=gt.{}",
                encode(user_id),
                timestamp(since)
            ),
        )
        .await
    }

    async fn list_results(&self, job_id: Uuid) -> Result<Vec<GeneratedResult>, StoreError> {
        self.fetch(
            "results",
            &format!("job_id=eq.{job_id}&select=*&order=created_at.asc"),
        )
        .await
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<GeneratedResult>, StoreError> {
        let mut rows: Vec<GeneratedResult> = self
            .fetch("results", &format!("id=eq.{id}&select=*&limit=1"))
            .await?;
        Ok(rows.pop())
    }

    async fn record_feedback(&self, feedback: &Feedback) -> Result<(), StoreError> {
        let touched = self
            .patch(
                "results",
                &format!("id=eq.{}", feedback.result_id),
                json!({ "feedback": feedback }),
            )
            .await?;
        if touched.is_empty() {
            return Err(StoreError::NotFound("result"));
        }
        self.insert("feedback", feedback).await
    }

    async fn recent_feedback(&self, limit: usize) -> Result<Vec<Feedback>, StoreError> {
        self.fetch(
            "feedback",
            &format!("select=*&order=submitted_at.desc&limit={limit}"),
        )
        .await
    }

    async fn count_jobs(&self) -> Result<u64, StoreError> {
        self.count("jobs", "id=not.is.null").await
    }

    async fn finished_job_timings(&self) -> Result<Vec<JobTiming>, StoreError> {
        #[derive(Deserialize)]
        struct TimingRow {
            status: JobStatus,
            created_at: DateTime<Utc>,
            completed_at: Option<DateTime<Utc>>,
        }

        let rows: Vec<TimingRow> = self
            .fetch(
                "jobs",
                "status=in.(completed,partially_completed,failed)&select=status,created_at,completed_at",
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| JobTiming {
                status: row.status,
                created_at: row.created_at,
                completed_at: row.completed_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("0-0/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
    }

    #[test]
    fn claim_filters_pin_the_worker() {
        let id = Uuid::nil();
        assert_eq!(
            held_by(id, "listro-a b"),
            format!("id=eq.{id}&status=eq.processing&claimed_by=eq.listro-a%20b")
        );
    }

    #[test]
    fn claim_row_reads_partial_columns() {
        let row: ClaimRow = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.attempts, 0);
    }

    #[test]
    fn timestamps_are_query_safe() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamp(ts), "2026-01-02T03%3A04%3A05.123456Z");
    }
}
