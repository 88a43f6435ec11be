//! Declarative mapping rules and the registry that picks one per staged document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use aod_core::Domain;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
    pub platform_name: String,
    pub domain: Domain,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Source path to destination, applied in document order.
    #[serde(default)]
    pub field_mappings: IndexMap<String, String>,
    #[serde(default)]
    pub normalizers: Vec<NormalizerStep>,
    /// Domain document key to extension field.
    #[serde(default)]
    pub domain_object_mappings: IndexMap<String, DomainObjectMapping>,
}

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerStep {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainObjectMapping {
    pub target_field: String,
    #[serde(rename = "type", default)]
    pub type_hint: Option<String>,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading rule file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl MappingRule {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// Loads rule files relative to the workspace root, caching each parsed rule.
#[derive(Debug)]
pub struct RuleLoader {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<MappingRule>>>,
}

impl RuleLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(&self, rule_path: &str) -> Result<Arc<MappingRule>, RuleError> {
        if let Some(rule) = self.cache.read().await.get(rule_path) {
            return Ok(rule.clone());
        }

        let path = self.root.join(rule_path);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| RuleError::Read {
                path: path.clone(),
                source,
            })?;
        let rule = Arc::new(
            MappingRule::from_yaml_str(&text).map_err(|source| RuleError::Parse {
                path: path.clone(),
                source,
            })?,
        );
        debug!(rule_path, platform = %rule.platform_name, "loaded mapping rule");

        let mut cache = self.cache.write().await;
        Ok(cache
            .entry(rule_path.to_string())
            .or_insert(rule)
            .clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    rules: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub domain: Domain,
    pub platform_name: String,
    pub path: String,
}

/// Maps `(domain, platform)` to a rule path. Platform names match case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    entries: Vec<RegistryEntry>,
}

impl RuleRegistry {
    pub const FILE: &'static str = "rules/registry.yaml";

    pub fn new(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(text)?;
        Ok(Self::new(file.rules))
    }

    pub async fn load(workspace_root: &Path) -> anyhow::Result<Self> {
        let path = workspace_root.join(Self::FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn resolve(&self, domain: Domain, platform_name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.domain == domain && e.platform_name.eq_ignore_ascii_case(platform_name))
            .map(|e| e.path.as_str())
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[tokio::test]
    async fn every_registered_rule_loads_and_matches_its_entry() {
        let root = workspace_root();
        let registry = RuleRegistry::load(&root).await.unwrap();
        let loader = RuleLoader::new(&root);
        assert!(!registry.entries().is_empty());

        for entry in registry.entries() {
            let rule = loader.load(&entry.path).await.unwrap();
            assert_eq!(rule.domain, entry.domain, "{}", entry.path);
            assert!(
                rule.platform_name.eq_ignore_ascii_case(&entry.platform_name),
                "{}",
                entry.path
            );
            assert!(!rule.field_mappings.is_empty(), "{}", entry.path);
        }
        assert_eq!(
            registry.resolve(Domain::Game, "steam"),
            Some("rules/game/steam.yml")
        );
        assert_eq!(registry.resolve(Domain::Movie, "Steam"), None);
    }

    #[tokio::test]
    async fn field_mappings_keep_document_order_and_cache() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/test.yml"),
            r#"
platform_name: Test
domain: MOVIE
field_mappings:
  z.last: master_title
  a.first: synopsis
  m.middle: platform.url
normalizers:
  - type: collapse_spaces
    fields: [master_title]
domain_object_mappings:
  runtime:
    target_field: runtime_min
    type: integer
"#,
        )
        .unwrap();

        let loader = RuleLoader::new(dir.path());
        let rule = loader.load("rules/test.yml").await.unwrap();
        let keys: Vec<&str> = rule.field_mappings.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z.last", "a.first", "m.middle"]);
        assert_eq!(rule.schema_version, 1);
        assert_eq!(
            rule.domain_object_mappings["runtime"].type_hint.as_deref(),
            Some("integer")
        );

        std::fs::remove_file(dir.path().join("rules/test.yml")).unwrap();
        let cached = loader.load("rules/test.yml").await.unwrap();
        assert!(Arc::ptr_eq(&rule, &cached));
    }

    #[tokio::test]
    async fn malformed_rule_is_a_parse_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yml"), "platform_name: [unclosed").unwrap();
        let loader = RuleLoader::new(dir.path());
        assert!(matches!(
            loader.load("bad.yml").await,
            Err(RuleError::Parse { .. })
        ));
        assert!(matches!(
            loader.load("missing.yml").await,
            Err(RuleError::Read { .. })
        ));
    }
}
