//! Canonical catalog: content records, platform data, domain extensions and the
//! transform-run audit log.

use std::collections::HashMap;

use aod_core::{
    CanonicalContent, CatalogUpsert, DomainExtension, IdentityMatch, NewTransformRun,
    PlatformData, TransformRun,
};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Resolves or creates the canonical record, then writes platform data and the domain
    /// extension. All three writes commit together or not at all. Returns the content id.
    async fn upsert(&self, upsert: &CatalogUpsert) -> anyhow::Result<i64>;

    /// Appends an audit row; never updated afterwards.
    async fn record_transform_run(&self, run: NewTransformRun) -> anyhow::Result<i64>;

    /// Most recent runs first.
    async fn recent_transform_runs(&self, limit: usize) -> anyhow::Result<Vec<TransformRun>>;

    async fn content(&self, id: i64) -> anyhow::Result<Option<CanonicalContent>>;

    async fn platform_data(
        &self,
        platform_name: &str,
        platform_specific_id: &str,
    ) -> anyhow::Result<Option<PlatformData>>;

    async fn extension(&self, content_id: i64) -> anyhow::Result<Option<DomainExtension>>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryCatalog>,
}

#[derive(Debug, Default)]
struct MemoryCatalog {
    next_content_id: i64,
    next_platform_id: i64,
    contents: HashMap<i64, CanonicalContent>,
    platform_data: HashMap<(String, String), PlatformData>,
    extensions: HashMap<i64, DomainExtension>,
    transform_runs: Vec<TransformRun>,
}

impl MemoryCatalog {
    fn resolve(&self, upsert: &CatalogUpsert) -> Option<i64> {
        let year = upsert.master.release_year;
        let mut wildcard: Option<i64> = None;
        for content in self.contents.values() {
            match content.identity_match(upsert.domain, &upsert.master_title, year) {
                IdentityMatch::Exact => return Some(content.id),
                IdentityMatch::UnknownYear => {
                    wildcard = Some(wildcard.map_or(content.id, |id| id.min(content.id)));
                }
                IdentityMatch::None => {}
            }
        }
        wildcard
    }

    /// Validates the extension write first so a failure leaves every map untouched.
    fn apply(&mut self, upsert: &CatalogUpsert) -> anyhow::Result<i64> {
        let now = Utc::now();
        let resolved = self.resolve(upsert);

        let mut extension = resolved
            .and_then(|id| self.extensions.get(&id).cloned())
            .unwrap_or_else(|| DomainExtension::empty(upsert.domain));
        extension.apply(&upsert.extension)?;

        let content_id = match resolved {
            Some(id) => {
                if let Some(content) = self.contents.get_mut(&id) {
                    content.merge_missing(&upsert.master, now);
                }
                id
            }
            None => {
                self.next_content_id += 1;
                let id = self.next_content_id;
                let content = CanonicalContent::create(
                    id,
                    upsert.domain,
                    &upsert.master_title,
                    &upsert.master,
                    now,
                );
                self.contents.insert(id, content);
                id
            }
        };

        let key = (
            upsert.platform.platform_name.clone(),
            upsert.platform.platform_specific_id.clone(),
        );
        match self.platform_data.get_mut(&key) {
            Some(existing) => existing.overwrite_from(content_id, &upsert.platform, now),
            None => {
                self.next_platform_id += 1;
                let data =
                    PlatformData::create(self.next_platform_id, content_id, &upsert.platform, now);
                self.platform_data.insert(key, data);
            }
        }

        self.extensions.insert(content_id, extension);
        Ok(content_id)
    }
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn content_count(&self) -> usize {
        self.state.lock().await.contents.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert(&self, upsert: &CatalogUpsert) -> anyhow::Result<i64> {
        self.state.lock().await.apply(upsert)
    }

    async fn record_transform_run(&self, run: NewTransformRun) -> anyhow::Result<i64> {
        let mut state = self.state.lock().await;
        let id = state.transform_runs.len() as i64 + 1;
        state.transform_runs.push(TransformRun::from_new(id, run));
        Ok(id)
    }

    async fn recent_transform_runs(&self, limit: usize) -> anyhow::Result<Vec<TransformRun>> {
        let state = self.state.lock().await;
        Ok(state.transform_runs.iter().rev().take(limit).cloned().collect())
    }

    async fn content(&self, id: i64) -> anyhow::Result<Option<CanonicalContent>> {
        Ok(self.state.lock().await.contents.get(&id).cloned())
    }

    async fn platform_data(
        &self,
        platform_name: &str,
        platform_specific_id: &str,
    ) -> anyhow::Result<Option<PlatformData>> {
        let state = self.state.lock().await;
        Ok(state
            .platform_data
            .get(&(platform_name.to_string(), platform_specific_id.to_string()))
            .cloned())
    }

    async fn extension(&self, content_id: i64) -> anyhow::Result<Option<DomainExtension>> {
        Ok(self.state.lock().await.extensions.get(&content_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use aod_core::{Domain, DomainPatch, FieldValue, MasterRecord, PlatformRecord};
    use serde_json::{json, Map};

    use super::*;

    fn upsert(
        title: &str,
        year: Option<i32>,
        synopsis: &str,
        psid: &str,
        rating: f64,
    ) -> CatalogUpsert {
        CatalogUpsert {
            domain: Domain::Game,
            master_title: title.to_string(),
            master: MasterRecord {
                master_title: Some(title.to_string()),
                release_year: year,
                synopsis: Some(synopsis.to_string()),
                ..Default::default()
            },
            platform: PlatformRecord {
                platform_name: "Steam".into(),
                platform_specific_id: psid.into(),
                rating: Some(rating),
                ..Default::default()
            },
            extension: DomainPatch::new(Domain::Game),
        }
    }

    #[tokio::test]
    async fn first_writer_wins_and_null_year_is_filled() {
        let store = MemoryCatalogStore::new();
        let first = store
            .upsert(&upsert("Half-Life", None, "A", "70", 4.0))
            .await
            .unwrap();
        let second = store
            .upsert(&upsert("Half-Life", Some(2020), "B", "70", 3.5))
            .await
            .unwrap();

        assert_eq!(first, second);
        let content = store.content(first).await.unwrap().unwrap();
        assert_eq!(content.synopsis.as_deref(), Some("A"));
        assert_eq!(content.release_year, Some(2020));

        let platform = store.platform_data("Steam", "70").await.unwrap().unwrap();
        assert_eq!(platform.rating, Some(3.5));
        assert_eq!(store.content_count().await, 1);
    }

    #[tokio::test]
    async fn different_known_years_are_different_records() {
        let store = MemoryCatalogStore::new();
        let a = store
            .upsert(&upsert("Dune", Some(1984), "old", "1", 3.0))
            .await
            .unwrap();
        let b = store
            .upsert(&upsert("Dune", Some(2021), "new", "2", 4.0))
            .await
            .unwrap();
        let unknown = store
            .upsert(&upsert("Dune", None, "?", "3", 4.0))
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(unknown, a);
    }

    #[tokio::test]
    async fn failed_extension_write_rolls_back_everything() {
        let store = MemoryCatalogStore::new();
        let mut bad = upsert("Portal", Some(2007), "A", "400", 5.0);
        bad.extension
            .fields
            .push(("runtime_min".into(), FieldValue::Integer(90)));

        assert!(store.upsert(&bad).await.is_err());
        assert_eq!(store.content_count().await, 0);
        assert!(store.platform_data("Steam", "400").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extension_is_created_with_the_domain_shape() {
        let store = MemoryCatalogStore::new();
        let mut good = upsert("Portal", Some(2007), "A", "400", 5.0);
        good.extension.push_json("developer", &json!("Valve")).unwrap();
        good.platform.attributes = Map::from_iter([("price".to_string(), json!(9.99))]);
        let id = store.upsert(&good).await.unwrap();

        match store.extension(id).await.unwrap() {
            Some(DomainExtension::Game(game)) => {
                assert_eq!(game.developer.as_deref(), Some("Valve"))
            }
            other => panic!("unexpected extension {other:?}"),
        }
    }
}
