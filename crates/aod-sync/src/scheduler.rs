//! Admission-controlled dispatch of crawl jobs to source executors.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use aod_adapters::{ExecutorRegistry, SourceExecutor};
use aod_core::{Job, JobOutcome, JobStatus};
use aod_storage::JobStore;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn, Instrument};

/// Shared in-flight counters and their ceilings.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    global_cap: usize,
    heavy_cap: usize,
    global: Arc<AtomicUsize>,
    heavy: Arc<AtomicUsize>,
}

impl AdmissionControl {
    pub fn new(global_cap: usize, heavy_cap: usize) -> Self {
        Self {
            global_cap,
            heavy_cap,
            global: Arc::new(AtomicUsize::new(0)),
            heavy: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn global_in_flight(&self) -> usize {
        self.global.load(Ordering::SeqCst)
    }

    pub fn heavy_in_flight(&self) -> usize {
        self.heavy.load(Ordering::SeqCst)
    }

    /// Free slots for one more executor of the given weight class.
    pub fn available(&self, heavy: bool) -> usize {
        let global = self.global_cap.saturating_sub(self.global_in_flight());
        if heavy {
            global.min(self.heavy_cap.saturating_sub(self.heavy_in_flight()))
        } else {
            global
        }
    }

    /// Counts one job in flight until the returned guard is dropped.
    pub fn admit(&self, heavy: bool) -> InFlightGuard {
        self.global.fetch_add(1, Ordering::SeqCst);
        let heavy = heavy.then(|| {
            self.heavy.fetch_add(1, Ordering::SeqCst);
            self.heavy.clone()
        });
        InFlightGuard {
            global: self.global.clone(),
            heavy,
        }
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    global: Arc<AtomicUsize>,
    heavy: Option<Arc<AtomicUsize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.global.fetch_sub(1, Ordering::SeqCst);
        if let Some(heavy) = &self.heavy {
            heavy.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    /// Another round was still running; nothing was done.
    pub busy: bool,
    pub reaped: usize,
    pub dispatched: usize,
    /// Job types left for a later round because no capacity was free.
    pub deferred_types: usize,
}

struct BusyFlag<'a>(&'a AtomicBool);

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct AdmissionScheduler {
    jobs: Arc<dyn JobStore>,
    executors: ExecutorRegistry,
    admission: AdmissionControl,
    round_budget_ms: u64,
    claim_ttl: chrono::Duration,
    running: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl AdmissionScheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        executors: ExecutorRegistry,
        admission: AdmissionControl,
        round_budget_ms: u64,
        claim_ttl: chrono::Duration,
    ) -> Self {
        Self {
            jobs,
            executors,
            admission,
            round_budget_ms,
            claim_ttl,
            running: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// One scheduling round. Returns immediately with `busy` set when a round is already
    /// in progress on this scheduler. Store and executor failures are logged, never raised.
    #[instrument(skip(self))]
    pub async fn poll_and_dispatch(&self) -> RoundReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("previous round still running");
            return RoundReport {
                busy: true,
                ..Default::default()
            };
        }
        let _running = BusyFlag(&self.running);
        let mut report = RoundReport::default();

        match self.jobs.reap_stale(self.claim_ttl).await {
            Ok(0) => {}
            Ok(reaped) => {
                warn!(reaped, "reclaimed stale processing jobs");
                report.reaped = reaped;
            }
            Err(err) => warn!(error = %err, "stale job reaping failed"),
        }

        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(err) = joined {
                warn!(error = %err, "job task ended abnormally");
            }
        }

        for executor in self.executors.iter() {
            let job_type = executor.job_type();
            let heavy = executor.is_heavy();
            let recommended = executor.recommended_batch_size(self.round_budget_ms);
            let available = self.admission.available(heavy);
            let limit = recommended.min(available);
            if limit == 0 {
                debug!(%job_type, heavy, "no capacity; deferring job type");
                report.deferred_types += 1;
                continue;
            }

            let claimed = match self.jobs.claim_jobs(&job_type, limit).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!(%job_type, error = %format!("{err:#}"), "claiming jobs failed");
                    continue;
                }
            };
            if claimed.is_empty() {
                continue;
            }
            debug!(%job_type, claimed = claimed.len(), recommended, available, "dispatching");

            for job in claimed {
                let guard = self.admission.admit(heavy);
                let span = tracing::info_span!("job", job_id = job.id, %job_type, target = %job.target_id);
                tasks.spawn(
                    run_job(self.jobs.clone(), executor.clone(), job, guard).instrument(span),
                );
                report.dispatched += 1;
            }
        }

        if report.dispatched > 0 {
            info!(
                dispatched = report.dispatched,
                in_flight = self.admission.global_in_flight(),
                "poll round dispatched jobs"
            );
        }
        report
    }

    /// Waits for every dispatched job to finish.
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "job task ended abnormally");
            }
        }
    }
}

async fn run_job(
    jobs: Arc<dyn JobStore>,
    executor: Arc<dyn SourceExecutor>,
    job: Job,
    _guard: InFlightGuard,
) {
    let outcome = match AssertUnwindSafe(executor.execute(&job.target_id))
        .catch_unwind()
        .await
    {
        Ok(Ok(true)) => JobOutcome::Succeeded,
        Ok(Ok(false)) => JobOutcome::Failed("executor reported no result".to_string()),
        Ok(Err(err)) => JobOutcome::Failed(err.to_string()),
        Err(panic) => JobOutcome::Failed(format!("executor panicked: {}", panic_message(&*panic))),
    };

    match jobs.finish_job(&job, &outcome).await {
        Ok(Some(finished)) if finished.status == JobStatus::Completed => {
            debug!("job completed");
        }
        Ok(Some(finished)) => warn!(
            status = %finished.status,
            retry_count = finished.retry_count,
            error = finished.last_error.as_deref().unwrap_or_default(),
            "job attempt failed"
        ),
        Ok(None) => warn!("stale completion ignored; the job no longer holds this claim"),
        Err(err) => warn!(error = %format!("{err:#}"), "recording job outcome failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
