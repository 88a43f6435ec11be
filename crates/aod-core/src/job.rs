//! Crawl job queue entities.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Identifies which source executor handles a job.
///
/// Open-ended on purpose: a new platform only needs a new upper-case identifier in
/// `sources.yaml`, the well-known ones are provided as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(Cow<'static, str>);

impl JobType {
    pub const STEAM_GAME: JobType = JobType(Cow::Borrowed("STEAM_GAME"));
    pub const TMDB_MOVIE: JobType = JobType(Cow::Borrowed("TMDB_MOVIE"));
    pub const TMDB_TV: JobType = JobType(Cow::Borrowed("TMDB_TV"));
    pub const NAVER_WEBTOON: JobType = JobType(Cow::Borrowed("NAVER_WEBTOON"));
    pub const NAVER_WEBTOON_FINISHED: JobType = JobType(Cow::Borrowed("NAVER_WEBTOON_FINISHED"));
    pub const NAVER_SERIES_NOVEL: JobType = JobType(Cow::Borrowed("NAVER_SERIES_NOVEL"));
    pub const KAKAO_PAGE_NOVEL: JobType = JobType(Cow::Borrowed("KAKAO_PAGE_NOVEL"));
    pub const KAKAO_PAGE_WEBTOON: JobType = JobType(Cow::Borrowed("KAKAO_PAGE_WEBTOON"));

    /// Builds a job type, upper-casing the identifier.
    pub fn new(name: impl AsRef<str>) -> Self {
        JobType(Cow::Owned(name.as_ref().trim().to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        JobType::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Retry,
    Failed,
    Skipped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Retry,
        JobStatus::Failed,
        JobStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Retry => "retry",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    /// Statuses a poller may claim.
    pub fn is_pollable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retry)
    }

    /// Statuses that block creation of another job for the same target.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Retry
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown job status `{0}`")]
pub struct UnknownJobStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == lower)
            .ok_or_else(|| UnknownJobStatus(s.to_string()))
    }
}

/// Producer-side request for a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub target_id: String,
    pub priority: i32,
    pub max_retries: i32,
    pub metadata: Option<JsonValue>,
}

impl NewJob {
    pub fn new(job_type: JobType, target_id: impl Into<String>) -> Self {
        Self {
            job_type,
            target_id: target_id.into(),
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub target_id: String,
    pub metadata: Option<JsonValue>,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_new(id: i64, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new.job_type,
            target_id: new.target_id,
            metadata: new.metadata,
            status: JobStatus::Pending,
            priority: new.priority,
            retry_count: 0,
            max_retries: new.max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Records one failed attempt; the job becomes terminal once retries are exhausted.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.status = if self.retry_count >= self.max_retries {
            JobStatus::Failed
        } else {
            JobStatus::Retry
        };
        self.updated_at = now;
    }

    pub fn apply_outcome(&mut self, outcome: &JobOutcome, now: DateTime<Utc>) {
        match outcome {
            JobOutcome::Succeeded => self.mark_completed(now),
            JobOutcome::Failed(error) => self.mark_failed(error.clone(), now),
        }
    }

    /// True while this job is still Processing under the claim stamped at `claimed_at`.
    /// A reaped or re-claimed job no longer holds that claim.
    pub fn holds_claim(&self, claimed_at: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.started_at == Some(claimed_at)
    }
}

/// Result of one executor invocation as seen by the job store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(i64),
    /// An active job already exists for the same `(job_type, target_id)`.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Option<i64> {
        match self {
            EnqueueOutcome::Created(id) => Some(*id),
            EnqueueOutcome::Duplicate => None,
        }
    }
}
