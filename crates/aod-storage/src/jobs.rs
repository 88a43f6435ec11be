//! Crawl job queue.

use std::collections::{BTreeMap, HashMap};

use aod_core::{EnqueueOutcome, Job, JobOutcome, JobStatus, JobType, NewJob};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

pub const STALE_CLAIM_ERROR: &str = "stale claim reclaimed";

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a Pending job unless an active job exists for the same type and target.
    async fn create_job(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome>;

    /// Claims up to `limit` pollable jobs of one type, in `(priority, created_at)` order,
    /// moving them to Processing. Rows claimed by a concurrent caller are skipped.
    async fn claim_jobs(&self, job_type: &JobType, limit: usize) -> anyhow::Result<Vec<Job>>;

    /// Records the result of the attempt started by `claimed`; returns the updated job.
    ///
    /// Returns `None` and leaves the row untouched when the job no longer holds that claim
    /// (reaped as stale, re-claimed, or deleted).
    async fn finish_job(
        &self,
        claimed: &Job,
        outcome: &JobOutcome,
    ) -> anyhow::Result<Option<Job>>;

    /// Fails the attempt of every job that has been Processing longer than `ttl`.
    async fn reap_stale(&self, ttl: Duration) -> anyhow::Result<usize>;

    async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>>;

    async fn status_counts(&self) -> anyhow::Result<BTreeMap<JobStatus, i64>>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryJobs>,
}

#[derive(Debug, Default)]
struct MemoryJobs {
    next_id: i64,
    jobs: HashMap<i64, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        let duplicate = state.jobs.values().any(|existing| {
            existing.job_type == job.job_type
                && existing.target_id == job.target_id
                && existing.status.is_active()
        });
        if duplicate {
            return Ok(EnqueueOutcome::Duplicate);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(id, Job::from_new(id, job, Utc::now()));
        Ok(EnqueueOutcome::Created(id))
    }

    async fn claim_jobs(&self, job_type: &JobType, limit: usize) -> anyhow::Result<Vec<Job>> {
        let mut state = self.state.lock().await;
        let mut eligible: Vec<(i32, chrono::DateTime<Utc>, i64)> = state
            .jobs
            .values()
            .filter(|job| &job.job_type == job_type && job.status.is_pollable())
            .map(|job| (job.priority, job.created_at, job.id))
            .collect();
        eligible.sort();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(limit.min(eligible.len()));
        for (_, _, id) in eligible.into_iter().take(limit) {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.mark_processing(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn finish_job(
        &self,
        claimed: &Job,
        outcome: &JobOutcome,
    ) -> anyhow::Result<Option<Job>> {
        let Some(claimed_at) = claimed.started_at else {
            return Ok(None);
        };
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&claimed.id) {
            Some(job) if job.holds_claim(claimed_at) => {
                job.apply_outcome(outcome, Utc::now());
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reap_stale(&self, ttl: Duration) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - ttl;
        let mut reaped = 0;
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.map_or(true, |started| started < cutoff);
            if stale {
                job.mark_failed(STALE_CLAIM_ERROR, now);
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn status_counts(&self) -> anyhow::Result<BTreeMap<JobStatus, i64>> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for job in state.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
