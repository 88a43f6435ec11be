//! Wires stores, executors and runners into a long-running worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use aod_adapters::{executors_from_registry, SourceRegistry};
use aod_storage::{
    CatalogStore, Collector, HttpClientConfig, HttpFetcher, JobStore, StagingStore,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::batch::BatchTransformRunner;
use crate::config::SyncConfig;
use crate::producer::JobProducer;
use crate::rules::{RuleLoader, RuleRegistry};
use crate::scheduler::{AdmissionControl, AdmissionScheduler};

pub const SOURCES_FILE: &str = "sources.yaml";

/// Every long-lived component of the ingestion pipeline, built over one set of stores.
pub struct Pipeline {
    pub config: SyncConfig,
    pub producer: JobProducer,
    pub scheduler: Arc<AdmissionScheduler>,
    pub runner: Arc<BatchTransformRunner>,
}

impl Pipeline {
    pub async fn build(
        config: SyncConfig,
        jobs: Arc<dyn JobStore>,
        staging: Arc<dyn StagingStore>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Result<Self> {
        let sources = SourceRegistry::load(config.workspace_root.join(SOURCES_FILE))?;
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.global_concurrency.max(1),
            ..HttpClientConfig::default()
        })?);
        let executors =
            executors_from_registry(&sources, fetcher, Collector::new(staging.clone()));
        if executors.is_empty() {
            warn!("no enabled sources; the poller will have nothing to dispatch");
        }

        let scheduler = Arc::new(AdmissionScheduler::new(
            jobs.clone(),
            executors,
            AdmissionControl::new(config.global_concurrency, config.heavy_concurrency),
            config.round_budget_ms,
            config.claim_ttl_chrono(),
        ));

        let registry = RuleRegistry::load(&config.workspace_root).await?;
        let runner = Arc::new(BatchTransformRunner::new(
            staging,
            catalog,
            registry,
            Arc::new(RuleLoader::new(config.workspace_root.clone())),
            config.claim_ttl_chrono(),
        ));

        Ok(Self {
            config,
            producer: JobProducer::new(jobs),
            scheduler,
            runner,
        })
    }

    pub async fn build_cron(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let scheduler = self.scheduler.clone();
        let poll = Job::new_repeated_async(self.config.poll_interval, move |_uuid, _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                scheduler.poll_and_dispatch().await;
            })
        })
        .context("creating poll job")?;
        sched.add(poll).await.context("adding poll job")?;

        let runner = self.runner.clone();
        let batch_size = self.config.transform_batch_size;
        let cron = &self.config.transform_cron;
        let transform = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                if let Err(err) = runner.process_batch(batch_size).await {
                    error!(error = %format!("{err:#}"), "transform batch aborted");
                }
            })
        })
        .with_context(|| format!("creating transform job for cron {cron}"))?;
        sched.add(transform).await.context("adding transform job")?;

        Ok(sched)
    }

    /// Runs the poll and transform jobs until Ctrl-C, then drains in-flight work.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        if !self.config.scheduler_enabled {
            info!("scheduler disabled; worker idle until shutdown");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            return Ok(());
        }

        let mut sched = self.build_cron().await?;
        sched.start().await.context("starting scheduler")?;
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            transform_cron = %self.config.transform_cron,
            "worker started"
        );

        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("shutdown requested");
        sched.shutdown().await.context("stopping scheduler")?;
        self.scheduler.wait_idle().await;
        info!("worker stopped");
        Ok(())
    }
}
