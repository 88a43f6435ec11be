//! Job producers: turn target lists into crawl jobs.

use std::sync::Arc;

use aod_core::{EnqueueOutcome, JobType, NewJob};
use aod_storage::JobStore;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

#[derive(Clone)]
pub struct JobProducer {
    jobs: Arc<dyn JobStore>,
}

impl JobProducer {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    pub async fn create_job(
        &self,
        job_type: JobType,
        target_id: &str,
        priority: i32,
        metadata: Option<JsonValue>,
    ) -> anyhow::Result<EnqueueOutcome> {
        let mut job = NewJob::new(job_type, target_id.trim()).with_priority(priority);
        if let Some(metadata) = metadata {
            job = job.with_metadata(metadata);
        }
        self.jobs.create_job(job).await
    }

    /// Enqueues every target, skipping those that already have an active job of this type.
    /// Returns how many jobs were created.
    pub async fn create_jobs<I, S>(
        &self,
        job_type: &JobType,
        targets: I,
        priority: i32,
    ) -> anyhow::Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut created = 0;
        let mut duplicates = 0;
        for target in targets {
            let target = target.as_ref().trim();
            if target.is_empty() {
                continue;
            }
            match self.create_job(job_type.clone(), target, priority, None).await? {
                EnqueueOutcome::Created(id) => {
                    debug!(%job_type, target, job_id = id, "job created");
                    created += 1;
                }
                EnqueueOutcome::Duplicate => duplicates += 1,
            }
        }
        info!(%job_type, created, duplicates, "enqueued targets");
        Ok(created)
    }
}
