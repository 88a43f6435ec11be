//! `sources.yaml` registry and the generic JSON-API executor built from it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use aod_core::{Domain, JobType};
use aod_storage::{Collector, FetchError, HttpFetcher};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{ExecutorError, ExecutorRegistry, SourceExecutor, DEFAULT_AVERAGE_EXECUTION_MS};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub job_type: JobType,
    pub platform_name: String,
    pub domain: Domain,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Request URL; `{target_id}` is replaced by the job's target.
    pub endpoint: String,
    /// JSON pointer selecting the document inside the response, e.g. `/{target_id}/data`.
    #[serde(default)]
    pub payload_pointer: Option<String>,
    /// JSON pointer (relative to the document) holding the platform's own id.
    #[serde(default)]
    pub platform_id_pointer: Option<String>,
    #[serde(default = "default_average_execution_ms")]
    pub average_execution_ms: u64,
    #[serde(default)]
    pub heavy: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_average_execution_ms() -> u64 {
    DEFAULT_AVERAGE_EXECUTION_MS
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut registry: SourceRegistry = serde_yaml::from_str(text)?;
        for source in &mut registry.sources {
            source.job_type = JobType::new(source.job_type.as_str());
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

impl SourceConfig {
    pub fn request_url(&self, target_id: &str) -> String {
        self.endpoint.replace("{target_id}", target_id)
    }

    pub fn payload_pointer(&self, target_id: &str) -> Option<String> {
        self.payload_pointer
            .as_ref()
            .map(|pointer| pointer.replace("{target_id}", target_id))
    }
}

/// Narrows a response body to the document to stage. `None` when nothing usable is there.
pub fn extract_payload(body: JsonValue, pointer: Option<&str>) -> Option<JsonValue> {
    let payload = match pointer {
        Some(pointer) => body.pointer(pointer).cloned(),
        None => Some(body),
    };
    payload.filter(|value| !value.is_null())
}

pub fn extract_platform_id(payload: &JsonValue, pointer: Option<&str>) -> Option<String> {
    match payload.pointer(pointer?)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Fetches a JSON endpoint per target and stages the selected document.
pub struct HttpJsonExecutor {
    source: SourceConfig,
    fetcher: Arc<HttpFetcher>,
    collector: Collector,
}

impl HttpJsonExecutor {
    pub fn new(source: SourceConfig, fetcher: Arc<HttpFetcher>, collector: Collector) -> Self {
        Self {
            source,
            fetcher,
            collector,
        }
    }
}

#[async_trait]
impl SourceExecutor for HttpJsonExecutor {
    fn job_type(&self) -> JobType {
        self.source.job_type.clone()
    }

    async fn execute(&self, target_id: &str) -> Result<bool, ExecutorError> {
        let url = self.source.request_url(target_id);
        let body = match self
            .fetcher
            .fetch_json(&self.source.platform_name, &url)
            .await
        {
            Ok(body) => body,
            Err(FetchError::Gone { status, .. }) => {
                warn!(target_id, %url, status, "target no longer listed at source");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        let pointer = self.source.payload_pointer(target_id);
        let Some(payload) = extract_payload(body, pointer.as_deref()) else {
            debug!(target_id, %url, "response carried no document");
            return Ok(false);
        };
        let platform_specific_id =
            extract_platform_id(&payload, self.source.platform_id_pointer.as_deref())
                .unwrap_or_else(|| target_id.to_string());

        let outcome = self
            .collector
            .save_raw(
                &self.source.platform_name,
                self.source.domain,
                payload,
                Some(platform_specific_id),
                Some(url),
            )
            .await?;
        debug!(target_id, staged_id = outcome.id, deduplicated = outcome.deduplicated, "executed");
        Ok(true)
    }

    fn average_execution_time_ms(&self) -> u64 {
        self.source.average_execution_ms.max(1)
    }

    fn is_heavy(&self) -> bool {
        self.source.heavy
    }
}

/// One [`HttpJsonExecutor`] per enabled source.
pub fn executors_from_registry(
    registry: &SourceRegistry,
    fetcher: Arc<HttpFetcher>,
    collector: Collector,
) -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    for source in registry.enabled() {
        info!(job_type = %source.job_type, platform = %source.platform_name, "registering source executor");
        executors.register(Arc::new(HttpJsonExecutor::new(
            source.clone(),
            fetcher.clone(),
            collector.clone(),
        )));
    }
    executors
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use aod_storage::{BackoffPolicy, HttpClientConfig, MemoryStagingStore, StagingStore};
    use axum::extract::{Path as UrlPath, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn workspace_sources_yaml_parses() {
        let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
        assert!(!registry.sources.is_empty());
        let steam = registry
            .sources
            .iter()
            .find(|s| s.job_type == JobType::STEAM_GAME)
            .expect("steam source");
        assert_eq!(steam.domain, Domain::Game);
        assert!(steam.request_url("70").contains("70"));
        assert_eq!(steam.payload_pointer("70").as_deref(), Some("/70/data"));
    }

    #[test]
    fn job_types_are_normalized_and_defaults_applied() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - job_type: tmdb_movie
    platform_name: TMDB
    domain: MOVIE
    endpoint: "https://api.example/movie/{target_id}"
  - job_type: NAVER_WEBTOON
    platform_name: NaverWebtoon
    domain: WEBTOON
    enabled: false
    heavy: true
    endpoint: "https://api.example/webtoon/{target_id}"
"#,
        )
        .unwrap();

        let movie = &registry.sources[0];
        assert_eq!(movie.job_type, JobType::TMDB_MOVIE);
        assert!(movie.enabled);
        assert_eq!(movie.average_execution_ms, DEFAULT_AVERAGE_EXECUTION_MS);
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn payload_and_platform_id_extraction() {
        let body = json!({"70": {"success": true, "data": {"steam_appid": 70, "name": "Half-Life"}}});
        let payload = extract_payload(body.clone(), Some("/70/data")).unwrap();
        assert_eq!(extract_platform_id(&payload, Some("/steam_appid")).as_deref(), Some("70"));
        assert_eq!(extract_platform_id(&payload, None), None);
        assert!(extract_payload(body, Some("/71/data")).is_none());
        assert!(extract_payload(JsonValue::Null, None).is_none());
    }

    #[tokio::test]
    async fn registry_builds_one_executor_per_enabled_source() {
        let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let collector = Collector::new(Arc::new(MemoryStagingStore::new()));

        let executors = executors_from_registry(&registry, fetcher, collector);
        assert_eq!(executors.len(), registry.enabled().count());
        let steam = executors.get(&JobType::STEAM_GAME).unwrap();
        assert!(!steam.is_heavy());
    }

    #[derive(Clone, Default)]
    struct FakeSource {
        flaky_hits: Arc<AtomicUsize>,
        delisted_hits: Arc<AtomicUsize>,
    }

    async fn appdetails(UrlPath(appid): UrlPath<String>) -> Json<JsonValue> {
        if appid == "70" {
            Json(json!({"70": {"success": true, "data": {"steam_appid": 70, "name": "Half-Life"}}}))
        } else {
            let mut body = serde_json::Map::new();
            body.insert(appid, json!({"success": false}));
            Json(JsonValue::Object(body))
        }
    }

    async fn flaky_movie(
        State(source): State<FakeSource>,
        UrlPath(id): UrlPath<String>,
    ) -> Response {
        if source.flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Json(json!({"id": id.parse::<i64>().unwrap_or_default(), "title": "The Matrix"}))
            .into_response()
    }

    async fn delisted(State(source): State<FakeSource>) -> StatusCode {
        source.delisted_hits.fetch_add(1, Ordering::SeqCst);
        StatusCode::NOT_FOUND
    }

    async fn serve_fake_source(source: FakeSource) -> String {
        let app = Router::new()
            .route("/api/appdetails/{appid}", get(appdetails))
            .route("/3/movie/{id}", get(flaky_movie))
            .route("/delisted/{id}", get(delisted))
            .with_state(source);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn source(job_type: JobType, domain: Domain, endpoint: String) -> SourceConfig {
        SourceConfig {
            job_type,
            platform_name: "Fake".to_string(),
            domain,
            enabled: true,
            endpoint,
            payload_pointer: None,
            platform_id_pointer: None,
            average_execution_ms: DEFAULT_AVERAGE_EXECUTION_MS,
            heavy: false,
        }
    }

    fn quick_fetcher() -> Arc<HttpFetcher> {
        let config = HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
                jitter: 0.0,
            },
            ..HttpClientConfig::default()
        };
        Arc::new(HttpFetcher::new(config).unwrap())
    }

    #[tokio::test]
    async fn execute_stages_the_selected_document() {
        let base = serve_fake_source(FakeSource::default()).await;
        let mut steam = source(
            JobType::STEAM_GAME,
            Domain::Game,
            format!("{base}/api/appdetails/{{target_id}}"),
        );
        steam.payload_pointer = Some("/{target_id}/data".to_string());
        steam.platform_id_pointer = Some("/steam_appid".to_string());
        let store = Arc::new(MemoryStagingStore::new());
        let executor = HttpJsonExecutor::new(steam, quick_fetcher(), Collector::new(store.clone()));

        assert!(executor.execute("70").await.unwrap());

        assert_eq!(store.len().await, 1);
        let staged = store.get(1).await.unwrap().expect("staged document");
        assert_eq!(staged.platform_name, "Fake");
        assert_eq!(staged.domain, Domain::Game);
        assert_eq!(staged.platform_specific_id.as_deref(), Some("70"));
        assert_eq!(staged.payload["name"], "Half-Life");
        assert_eq!(
            staged.source_url.as_deref(),
            Some(format!("{base}/api/appdetails/70").as_str())
        );
    }

    #[tokio::test]
    async fn execute_reports_false_when_the_document_is_absent() {
        let base = serve_fake_source(FakeSource::default()).await;
        let mut steam = source(
            JobType::STEAM_GAME,
            Domain::Game,
            format!("{base}/api/appdetails/{{target_id}}"),
        );
        steam.payload_pointer = Some("/{target_id}/data".to_string());
        let store = Arc::new(MemoryStagingStore::new());
        let executor = HttpJsonExecutor::new(steam, quick_fetcher(), Collector::new(store.clone()));

        assert!(!executor.execute("71").await.unwrap());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn execute_retries_a_throttled_source_then_stages() {
        let fake = FakeSource::default();
        let base = serve_fake_source(fake.clone()).await;
        let tmdb = source(
            JobType::TMDB_MOVIE,
            Domain::Movie,
            format!("{base}/3/movie/{{target_id}}"),
        );
        let store = Arc::new(MemoryStagingStore::new());
        let executor = HttpJsonExecutor::new(tmdb, quick_fetcher(), Collector::new(store.clone()));

        assert!(executor.execute("603").await.unwrap());

        assert_eq!(fake.flaky_hits.load(Ordering::SeqCst), 2);
        let staged = store.get(1).await.unwrap().expect("staged document");
        assert_eq!(staged.platform_specific_id.as_deref(), Some("603"));
        assert_eq!(staged.payload["title"], "The Matrix");
    }

    #[tokio::test]
    async fn execute_gives_up_on_a_delisted_target_without_retrying() {
        let fake = FakeSource::default();
        let base = serve_fake_source(fake.clone()).await;
        let tmdb = source(
            JobType::TMDB_MOVIE,
            Domain::Movie,
            format!("{base}/delisted/{{target_id}}"),
        );
        let store = Arc::new(MemoryStagingStore::new());
        let executor = HttpJsonExecutor::new(tmdb, quick_fetcher(), Collector::new(store.clone()));

        assert!(!executor.execute("1").await.unwrap());
        assert_eq!(fake.delisted_hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.len().await, 0);
    }
}
