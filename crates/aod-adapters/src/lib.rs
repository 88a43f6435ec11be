//! Source executor contracts and the registry the scheduler dispatches through.

use std::collections::BTreeMap;
use std::sync::Arc;

use aod_core::JobType;
use aod_storage::FetchError;
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

pub mod sources;

pub use sources::{executors_from_registry, HttpJsonExecutor, SourceConfig, SourceRegistry};

pub const CRATE_NAME: &str = "aod-adapters";

pub const DEFAULT_AVERAGE_EXECUTION_MS: u64 = 1000;
pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Fetches one target of one job type and hands the raw document to the collector.
#[async_trait]
pub trait SourceExecutor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// `Ok(true)` on success. `Ok(false)` and `Err` both count as a failed attempt.
    async fn execute(&self, target_id: &str) -> Result<bool, ExecutorError>;

    fn average_execution_time_ms(&self) -> u64 {
        DEFAULT_AVERAGE_EXECUTION_MS
    }

    /// Heavy executors share a smaller concurrency ceiling (browser-driven sources, etc).
    fn is_heavy(&self) -> bool {
        false
    }

    fn recommended_batch_size(&self, budget_ms: u64) -> usize {
        recommended_batch_size(budget_ms, self.average_execution_time_ms())
    }
}

/// How many jobs of average duration `average_ms` fit in one round of `budget_ms`.
pub fn recommended_batch_size(budget_ms: u64, average_ms: u64) -> usize {
    let fits = budget_ms / average_ms.max(1);
    usize::try_from(fits)
        .unwrap_or(MAX_BATCH_SIZE)
        .clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Executors keyed by job type, iterated in a stable order.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<JobType, Arc<dyn SourceExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn SourceExecutor>) {
        let job_type = executor.job_type();
        if self.executors.insert(job_type.clone(), executor).is_some() {
            warn!(%job_type, "replacing previously registered executor");
        }
    }

    pub fn with(mut self, executor: Arc<dyn SourceExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn SourceExecutor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceExecutor>> {
        self.executors.values()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.executors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
