use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_PROMPTS_PER_JOB: usize = 10;
pub const MAX_PROMPT_CHARS: usize = 4000;
pub const MAX_COMMENT_CHARS: usize = 2000;
pub const RATING_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    VideoScript,
    AdCopy,
    ProductDescription,
    SocialPost,
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            ContentKind::VideoScript => "short-form video script",
            ContentKind::AdCopy => "ad copy",
            ContentKind::ProductDescription => "product description",
            ContentKind::SocialPost => "social media post",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    Cinematic,
    Lifestyle,
    Minimal,
    Energetic,
    Luxury,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Professional,
    Casual,
    Playful,
    Inspirational,
    Urgent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Tiktok,
    Instagram,
    Facebook,
    Youtube,
    Shopify,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape,
    #[default]
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:5")]
    Feed,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Square => "1:1",
            AspectRatio::Feed => "4:5",
        }
    }
}

/// Clip length in seconds; only a few lengths are accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u32", into = "u32")]
pub enum ClipDuration {
    Short,
    Medium,
    Long,
}

impl ClipDuration {
    pub fn seconds(&self) -> u32 {
        match self {
            ClipDuration::Short => 15,
            ClipDuration::Medium => 30,
            ClipDuration::Long => 60,
        }
    }
}

impl TryFrom<u32> for ClipDuration {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            15 => Ok(ClipDuration::Short),
            30 => Ok(ClipDuration::Medium),
            60 => Ok(ClipDuration::Long),
            other => Err(format!("unsupported duration {other}s (expected 15, 30 or 60)")),
        }
    }
}

impl From<ClipDuration> for u32 {
    fn from(value: ClipDuration) -> Self {
        value.seconds()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Resolution {
    #[serde(rename = "720p")]
    Hd,
    #[serde(rename = "1080p")]
    FullHd,
    #[serde(rename = "4k")]
    Uhd,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Mov,
    Webm,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GenerationOptions {
    #[serde(default)]
    pub style: Option<Style>,
    #[serde(default)]
    pub tone: Option<Tone>,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub aspect_ratio: Option<AspectRatio>,
    #[serde(default)]
    pub duration: Option<ClipDuration>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyCompleted => "partially_completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PartiallyCompleted | JobStatus::Failed
        )
    }

    /// Terminal states that produced at least one result.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::PartiallyCompleted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub kind: ContentKind,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub options: GenerationOptions,
    pub status: JobStatus,
    #[serde(default)]
    pub results: Option<Vec<GeneratedResult>>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    pub fn new(user_id: impl Into<String>, request: CreateJobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind: request.kind,
            prompts: request.prompts.into_iter().map(|p| p.trim().to_string()).collect(),
            options: request.options,
            status: JobStatus::Pending,
            results: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            claimed_by: None,
            lease_expires_at: None,
            attempts: 0,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub prompt: String,
    pub generated_text: String,
    pub kind: ContentKind,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<ResultMetadata>,
    #[serde(default)]
    pub feedback: Option<Feedback>,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feedback {
    pub id: Uuid,
    pub result_id: Uuid,
    pub user_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    pub kind: ContentKind,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub options: GenerationOptions,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("at least one prompt is required")]
    NoPrompts,
    #[error("at most 10 prompts are allowed per job")]
    TooManyPrompts,
    #[error("prompt {0} is empty")]
    BlankPrompt(usize),
    #[error("prompt {0} exceeds 4000 characters")]
    PromptTooLong(usize),
    #[error("rating must be between 1 and 5")]
    RatingOutOfRange,
    #[error("comment exceeds 2000 characters")]
    CommentTooLong,
}

impl CreateJobRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.prompts.is_empty() {
            return Err(RequestError::NoPrompts);
        }
        if self.prompts.len() > MAX_PROMPTS_PER_JOB {
            return Err(RequestError::TooManyPrompts);
        }
        for (idx, prompt) in self.prompts.iter().enumerate() {
            let trimmed = prompt.trim();
            if trimmed.is_empty() {
                return Err(RequestError::BlankPrompt(idx));
            }
            if trimmed.chars().count() > MAX_PROMPT_CHARS {
                return Err(RequestError::PromptTooLong(idx));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedbackRequest {
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

impl FeedbackRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        if !RATING_RANGE.contains(&self.rating) {
            return Err(RequestError::RatingOutOfRange);
        }
        if let Some(comment) = &self.comment
            && comment.chars().count() > MAX_COMMENT_CHARS
        {
            return Err(RequestError::CommentTooLong);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Set when the count could not be read and the request was let through.
    pub degraded: bool,
    pub message: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsReport {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub success_rate: f64,
    pub average_duration_secs: Option<f64>,
    pub rating_distribution: BTreeMap<u8, u64>,
    pub feedback_sampled: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
