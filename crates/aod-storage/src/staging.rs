//! Content-addressed staging of raw documents, and the collector that feeds it.

use std::collections::HashMap;
use std::sync::Arc;

use aod_core::{Domain, NewStagedDocument, SaveOutcome, StagedDocument};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::debug;

use crate::hash::content_hash;

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Inserts the document unless its content hash is already staged, in which case the
    /// existing id is returned and nothing is written.
    async fn insert_if_absent(&self, doc: NewStagedDocument) -> anyhow::Result<SaveOutcome>;

    /// Claims up to `limit` unprocessed documents, oldest first. A claim older than
    /// `claim_ttl` is considered abandoned and may be taken again.
    async fn claim_batch(
        &self,
        limit: usize,
        claim_ttl: Duration,
    ) -> anyhow::Result<Vec<StagedDocument>>;

    async fn mark_processed(&self, id: i64) -> anyhow::Result<()>;

    /// Drops the claim on documents that were not processed.
    async fn release(&self, ids: &[i64]) -> anyhow::Result<()>;

    /// Number of documents still waiting for a transform.
    async fn backlog(&self) -> anyhow::Result<i64>;

    async fn get(&self, id: i64) -> anyhow::Result<Option<StagedDocument>>;
}

#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    state: Mutex<MemoryStaging>,
}

#[derive(Debug, Default)]
struct MemoryStaging {
    next_id: i64,
    docs: HashMap<i64, StagedDocument>,
    by_hash: HashMap<String, i64>,
    claims: HashMap<i64, DateTime<Utc>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.docs.len()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn insert_if_absent(&self, doc: NewStagedDocument) -> anyhow::Result<SaveOutcome> {
        let mut state = self.state.lock().await;
        if let Some(&id) = state.by_hash.get(&doc.content_hash) {
            return Ok(SaveOutcome {
                id,
                deduplicated: true,
            });
        }
        state.next_id += 1;
        let id = state.next_id;
        state.by_hash.insert(doc.content_hash.clone(), id);
        state
            .docs
            .insert(id, StagedDocument::from_new(id, doc, Utc::now()));
        Ok(SaveOutcome {
            id,
            deduplicated: false,
        })
    }

    async fn claim_batch(
        &self,
        limit: usize,
        claim_ttl: Duration,
    ) -> anyhow::Result<Vec<StagedDocument>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - claim_ttl;
        let mut candidates: Vec<(DateTime<Utc>, i64)> = state
            .docs
            .values()
            .filter(|doc| !doc.processed)
            .filter(|doc| {
                state
                    .claims
                    .get(&doc.id)
                    .map_or(true, |claimed_at| *claimed_at < cutoff)
            })
            .map(|doc| (doc.fetched_at, doc.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            state.claims.insert(id, now);
            if let Some(doc) = state.docs.get(&id) {
                claimed.push(doc.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.claims.remove(&id);
        if let Some(doc) = state.docs.get_mut(&id) {
            doc.processed = true;
            doc.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn release(&self, ids: &[i64]) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        for id in ids {
            state.claims.remove(id);
        }
        Ok(())
    }

    async fn backlog(&self) -> anyhow::Result<i64> {
        let state = self.state.lock().await;
        Ok(state.docs.values().filter(|doc| !doc.processed).count() as i64)
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<StagedDocument>> {
        Ok(self.state.lock().await.docs.get(&id).cloned())
    }
}

/// Entry point for fetchers: hashes a raw payload and stages it once.
#[derive(Clone)]
pub struct Collector {
    store: Arc<dyn StagingStore>,
}

impl Collector {
    pub fn new(store: Arc<dyn StagingStore>) -> Self {
        Self { store }
    }

    pub async fn save_raw(
        &self,
        platform_name: &str,
        domain: Domain,
        payload: JsonValue,
        platform_specific_id: Option<String>,
        source_url: Option<String>,
    ) -> anyhow::Result<SaveOutcome> {
        let content_hash = content_hash(&payload);
        let outcome = self
            .store
            .insert_if_absent(NewStagedDocument {
                platform_name: platform_name.to_string(),
                domain,
                payload,
                platform_specific_id,
                source_url,
                content_hash: content_hash.clone(),
            })
            .await?;
        debug!(
            platform_name,
            %domain,
            staged_id = outcome.id,
            deduplicated = outcome.deduplicated,
            hash = %content_hash,
            "staged raw document"
        );
        Ok(outcome)
    }
}
