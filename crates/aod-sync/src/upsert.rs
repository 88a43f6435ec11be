//! Merges a transform output into the canonical catalog.

use std::sync::Arc;

use aod_core::{CatalogUpsert, Domain, MasterRecord, PlatformRecord};
use aod_storage::CatalogStore;
use tracing::{debug, instrument};

use crate::domain_upsert::GenericDomainUpserter;
use crate::rules::MappingRule;
use crate::transform::TransformOutput;

pub const MISSING_TITLE: &str = "master_title is blank";

/// Result of a single upsert. A rejection is a data-quality outcome, not a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Upserted(i64),
    Rejected(String),
}

#[derive(Clone)]
pub struct UpsertService {
    catalog: Arc<dyn CatalogStore>,
    domain_upserter: GenericDomainUpserter,
}

impl UpsertService {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            catalog,
            domain_upserter: GenericDomainUpserter,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    /// Builds the full write set up front so a rejection writes nothing, then hands it to
    /// the catalog as one atomic unit. `Err` is reserved for storage failures.
    #[instrument(skip(self, output, rule), fields(platform = %rule.platform_name))]
    pub async fn upsert(
        &self,
        domain: Domain,
        output: &TransformOutput,
        platform_specific_id: &str,
        url: Option<String>,
        rule: &MappingRule,
    ) -> anyhow::Result<UpsertOutcome> {
        let master = MasterRecord::from_doc(&output.master);
        let Some(master_title) = master.title().map(str::to_string) else {
            return Ok(UpsertOutcome::Rejected(MISSING_TITLE.to_string()));
        };

        let extension = match self.domain_upserter.build_patch(
            domain,
            &output.domain,
            &rule.domain_object_mappings,
        ) {
            Ok(patch) => patch,
            Err(err) => return Ok(UpsertOutcome::Rejected(err.to_string())),
        };

        let platform = PlatformRecord::from_doc(
            &rule.platform_name,
            platform_specific_id.to_string(),
            url,
            &output.platform,
        );

        let content_id = self
            .catalog
            .upsert(&CatalogUpsert {
                domain,
                master_title,
                master,
                platform,
                extension,
            })
            .await?;
        debug!(content_id, "catalog upsert committed");
        Ok(UpsertOutcome::Upserted(content_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aod_core::DomainExtension;
    use aod_storage::MemoryCatalogStore;
    use serde_json::json;

    use crate::transform::TransformEngine;

    fn steam_rule() -> MappingRule {
        MappingRule::from_yaml_str(
            r#"
platform_name: Steam
domain: GAME
field_mappings:
  name: master_title
  about: synopsis
  year: release_year
  score: platform.rating
  price: platform.attributes.price
  dev: domain.dev
  release: domain.release
domain_object_mappings:
  dev:
    target_field: developer
    type: string
  release:
    target_field: release_date
    type: date
"#,
        )
        .unwrap()
    }

    fn service() -> (Arc<MemoryCatalogStore>, UpsertService) {
        let store = Arc::new(MemoryCatalogStore::new());
        (store.clone(), UpsertService::new(store))
    }

    #[tokio::test]
    async fn second_source_only_fills_gaps_but_overwrites_platform() {
        let (store, service) = service();
        let rule = steam_rule();
        let engine = TransformEngine::new();

        let first = engine.transform(
            &json!({"name": "Half-Life", "about": "A", "score": 4.0, "dev": "Valve"}),
            &rule,
        );
        let second = engine.transform(
            &json!({"name": "Half-Life", "about": "B", "year": 2020, "score": 3.5, "release": "Nov 19, 1998"}),
            &rule,
        );

        let a = service
            .upsert(Domain::Game, &first, "70", None, &rule)
            .await
            .unwrap();
        let b = service
            .upsert(Domain::Game, &second, "70", Some("https://store.example/70".into()), &rule)
            .await
            .unwrap();
        assert_eq!(a, b);
        let UpsertOutcome::Upserted(id) = a else {
            panic!("expected upsert, got {a:?}");
        };

        let content = store.content(id).await.unwrap().unwrap();
        assert_eq!(content.synopsis.as_deref(), Some("A"));
        assert_eq!(content.release_year, Some(2020));

        let platform = store.platform_data("Steam", "70").await.unwrap().unwrap();
        assert_eq!(platform.rating, Some(3.5));
        assert_eq!(platform.url.as_deref(), Some("https://store.example/70"));

        let Some(DomainExtension::Game(game)) = store.extension(id).await.unwrap() else {
            panic!("expected game extension");
        };
        assert_eq!(game.developer.as_deref(), Some("Valve"));
        assert!(game.release_date.is_some());
    }

    #[tokio::test]
    async fn blank_title_is_rejected_without_writes() {
        let (store, service) = service();
        let rule = steam_rule();
        let output = TransformEngine::new().transform(&json!({"name": "   ", "score": 1}), &rule);

        let outcome = service
            .upsert(Domain::Game, &output, "1", None, &rule)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Rejected(MISSING_TITLE.to_string()));
        assert_eq!(store.content_count().await, 0);
        assert!(store.platform_data("Steam", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn coercion_failure_is_rejected_without_writes() {
        let (store, service) = service();
        let rule = steam_rule();
        let output = TransformEngine::new()
            .transform(&json!({"name": "Portal", "release": "someday"}), &rule);

        let outcome = service
            .upsert(Domain::Game, &output, "400", None, &rule)
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Rejected(ref reason) if reason.contains("release")));
        assert_eq!(store.content_count().await, 0);
    }
}
