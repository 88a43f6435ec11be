//! Claims staged documents and drives them through rule lookup, transform and upsert.

use std::sync::Arc;

use anyhow::Context;
use aod_core::{Domain, NewTransformRun, StagedDocument, TransformStatus};
use aod_storage::{CatalogStore, StagingStore};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::rules::{RuleError, RuleLoader, RuleRegistry};
use crate::transform::{TransformEngine, TransformOutput, PLATFORM_ID_KEY};
use crate::upsert::{UpsertOutcome, UpsertService};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Claims handed back unprocessed so another run can retry them.
    pub released: usize,
}

#[derive(Debug, Error)]
enum ItemError {
    #[error(transparent)]
    Rule(#[from] RuleError),
    /// Failed before the transform run was written.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    /// The transform run is written; only settling the staged document failed.
    #[error("{0:#}")]
    Settle(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Succeeded,
    Failed,
}

pub struct BatchTransformRunner {
    staging: Arc<dyn StagingStore>,
    catalog: Arc<dyn CatalogStore>,
    registry: RuleRegistry,
    loader: Arc<RuleLoader>,
    engine: TransformEngine,
    upsert: UpsertService,
    claim_ttl: chrono::Duration,
}

impl BatchTransformRunner {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        catalog: Arc<dyn CatalogStore>,
        registry: RuleRegistry,
        loader: Arc<RuleLoader>,
        claim_ttl: chrono::Duration,
    ) -> Self {
        Self {
            staging,
            upsert: UpsertService::new(catalog.clone()),
            catalog,
            registry,
            loader,
            engine: TransformEngine::new(),
            claim_ttl,
        }
    }

    /// Processes up to `batch_size` staged documents. Per-item failures are recorded as
    /// failed transform runs; only a rule file that cannot be loaded aborts the run, after
    /// releasing every claim not yet processed.
    #[instrument(skip(self))]
    pub async fn process_batch(&self, batch_size: usize) -> anyhow::Result<BatchReport> {
        let claimed = self
            .staging
            .claim_batch(batch_size, self.claim_ttl)
            .await
            .context("claiming staged documents")?;
        let mut report = BatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for (index, doc) in claimed.iter().enumerate() {
            match self.process_one(doc).await {
                Ok(ItemResult::Succeeded) => report.succeeded += 1,
                Ok(ItemResult::Failed) => report.failed += 1,
                Err(ItemError::Rule(err)) => {
                    let remaining: Vec<i64> = claimed[index..].iter().map(|d| d.id).collect();
                    self.staging
                        .release(&remaining)
                        .await
                        .context("releasing claims after rule failure")?;
                    report.released += remaining.len();
                    warn!(released = remaining.len(), error = %err, "aborting transform batch");
                    return Err(anyhow::Error::new(err).context("loading mapping rule"));
                }
                Err(ItemError::Storage(err)) => {
                    warn!(staged_id = doc.id, error = %format!("{err:#}"), "transform item failed; releasing claim");
                    self.record_best_effort(doc, &format!("{err:#}")).await;
                    if let Err(release_err) = self.staging.release(&[doc.id]).await {
                        warn!(staged_id = doc.id, error = %release_err, "claim release failed; it will expire");
                    }
                    report.released += 1;
                }
                Err(ItemError::Settle(err)) => {
                    warn!(staged_id = doc.id, error = %format!("{err:#}"), "transform run recorded but document not settled; releasing claim");
                    if let Err(release_err) = self.staging.release(&[doc.id]).await {
                        warn!(staged_id = doc.id, error = %release_err, "claim release failed; it will expire");
                    }
                    report.released += 1;
                }
            }
        }

        info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            released = report.released,
            "transform batch finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, doc), fields(staged_id = doc.id, platform = %doc.platform_name, domain = %doc.domain))]
    async fn process_one(&self, doc: &StagedDocument) -> Result<ItemResult, ItemError> {
        let started = Utc::now();

        let Some(rule_path) = self.registry.resolve(doc.domain, &doc.platform_name) else {
            let reason = format!(
                "no mapping rule registered for {} / {}",
                doc.domain, doc.platform_name
            );
            return self
                .finish(doc, None, doc.domain, Err(reason), started)
                .await;
        };
        let rule = self.loader.load(rule_path).await?;
        let output = self.engine.transform(&doc.payload, &rule);

        let Some(platform_specific_id) = resolve_platform_specific_id(doc, &output) else {
            return self
                .finish(
                    doc,
                    Some(rule_path),
                    rule.domain,
                    Err("platform_specific_id is missing".to_string()),
                    started,
                )
                .await;
        };
        let url = resolve_url(doc, &output);

        let outcome = match self
            .upsert
            .upsert(rule.domain, &output, &platform_specific_id, url, &rule)
            .await?
        {
            UpsertOutcome::Upserted(content_id) => Ok(content_id),
            UpsertOutcome::Rejected(reason) => Err(reason),
        };
        self.finish(doc, Some(rule_path), rule.domain, outcome, started)
            .await
    }

    /// Writes the audit row, then marks the document processed.
    async fn finish(
        &self,
        doc: &StagedDocument,
        rule_path: Option<&str>,
        domain: Domain,
        outcome: Result<i64, String>,
        started: chrono::DateTime<Utc>,
    ) -> Result<ItemResult, ItemError> {
        let (status, error, produced_content_id, result) = match outcome {
            Ok(content_id) => (
                TransformStatus::Success,
                None,
                Some(content_id),
                ItemResult::Succeeded,
            ),
            Err(reason) => {
                warn!(staged_id = doc.id, %reason, "transform rejected");
                (
                    TransformStatus::Failed,
                    Some(reason),
                    None,
                    ItemResult::Failed,
                )
            }
        };
        self.catalog
            .record_transform_run(NewTransformRun {
                staged_document_id: doc.id,
                platform_name: doc.platform_name.clone(),
                domain,
                rule_path: rule_path.map(str::to_string),
                status,
                error,
                produced_content_id,
                created_at: started,
                finished_at: Utc::now(),
            })
            .await
            .context("recording transform run")?;
        self.staging
            .mark_processed(doc.id)
            .await
            .context("marking staged document processed")
            .map_err(ItemError::Settle)?;
        Ok(result)
    }

    async fn record_best_effort(&self, doc: &StagedDocument, error: &str) {
        let now = Utc::now();
        let run = NewTransformRun {
            staged_document_id: doc.id,
            platform_name: doc.platform_name.clone(),
            domain: doc.domain,
            rule_path: self
                .registry
                .resolve(doc.domain, &doc.platform_name)
                .map(str::to_string),
            status: TransformStatus::Failed,
            error: Some(error.to_string()),
            produced_content_id: None,
            created_at: now,
            finished_at: now,
        };
        if let Err(err) = self.catalog.record_transform_run(run).await {
            warn!(staged_id = doc.id, error = %err, "could not record failed transform run");
        }
    }
}

fn json_to_id(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Staged value, then the transformed platform record, then the raw payload.
pub fn resolve_platform_specific_id(doc: &StagedDocument, output: &TransformOutput) -> Option<String> {
    doc.platform_specific_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| json_to_id(output.platform.get(PLATFORM_ID_KEY)))
        .or_else(|| json_to_id(doc.payload.get(PLATFORM_ID_KEY)))
}

pub fn resolve_url(doc: &StagedDocument, output: &TransformOutput) -> Option<String> {
    doc.source_url
        .clone()
        .or_else(|| json_to_id(output.platform.get("url")))
        .or_else(|| json_to_id(doc.payload.get("url")))
}
