//! Read-only operator endpoints over the job queue, staging backlog and transform log.

use std::collections::BTreeMap;
use std::sync::Arc;

use aod_core::{JobStatus, TransformRun};
use aod_storage::{CatalogStore, JobStore, StagingStore};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "aod-web";

pub const DEFAULT_RUN_LIMIT: usize = 50;
pub const MAX_RUN_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub staging: Arc<dyn StagingStore>,
    pub catalog: Arc<dyn CatalogStore>,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        staging: Arc<dyn StagingStore>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            jobs,
            staging,
            catalog,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StagingBacklog {
    pub unprocessed: i64,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/jobs/stats", get(job_stats_handler))
        .route("/api/staging/backlog", get(staging_backlog_handler))
        .route("/api/transform-runs", get(transform_runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving operator endpoints");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn job_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.jobs.status_counts().await {
        Ok(counts) => {
            let mut by_status: BTreeMap<String, i64> = JobStatus::ALL
                .iter()
                .map(|status| (status.as_str().to_string(), 0))
                .collect();
            for (status, count) in counts {
                by_status.insert(status.as_str().to_string(), count);
            }
            Json(JobStats {
                total: by_status.values().sum(),
                by_status,
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn staging_backlog_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.staging.backlog().await {
        Ok(unprocessed) => Json(StagingBacklog { unprocessed }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn transform_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);
    match state.catalog.recent_transform_runs(limit).await {
        Ok(runs) => Json::<Vec<TransformRun>>(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aod_core::{Domain, JobType, NewJob, NewTransformRun, TransformStatus};
    use aod_storage::{Collector, MemoryCatalogStore, MemoryJobStore, MemoryStagingStore};
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        jobs: Arc<MemoryJobStore>,
        staging: Arc<MemoryStagingStore>,
        catalog: Arc<MemoryCatalogStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                jobs: Arc::new(MemoryJobStore::new()),
                staging: Arc::new(MemoryStagingStore::new()),
                catalog: Arc::new(MemoryCatalogStore::new()),
            }
        }

        fn app(&self) -> Router {
            app(AppState::new(
                self.jobs.clone(),
                self.staging.clone(),
                self.catalog.clone(),
            ))
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let (status, body) = get_json(Fixture::new().app(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn job_stats_report_every_status() {
        let fixture = Fixture::new();
        for target in ["1", "2", "3"] {
            fixture
                .jobs
                .create_job(NewJob::new(JobType::TMDB_MOVIE, target))
                .await
                .unwrap();
        }
        fixture
            .jobs
            .claim_jobs(&JobType::TMDB_MOVIE, 1)
            .await
            .unwrap();

        let (status, body) = get_json(fixture.app(), "/api/jobs/stats").await;
        assert_eq!(status, StatusCode::OK);
        let stats: JobStats = serde_json::from_value(body).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["pending"], 2);
        assert_eq!(stats.by_status["processing"], 1);
        assert_eq!(stats.by_status["failed"], 0);
    }

    #[tokio::test]
    async fn staging_backlog_counts_unprocessed_documents() {
        let fixture = Fixture::new();
        let collector = Collector::new(fixture.staging.clone());
        for appid in [70, 220] {
            collector
                .save_raw(
                    "Steam",
                    Domain::Game,
                    serde_json::json!({ "steam_appid": appid }),
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        let (_, body) = get_json(fixture.app(), "/api/staging/backlog").await;
        assert_eq!(body["unprocessed"], 2);
    }

    #[tokio::test]
    async fn transform_runs_are_newest_first_and_limited() {
        let fixture = Fixture::new();
        for staged_document_id in 1..=3 {
            let now = Utc::now();
            fixture
                .catalog
                .record_transform_run(NewTransformRun {
                    staged_document_id,
                    platform_name: "Steam".into(),
                    domain: Domain::Game,
                    rule_path: Some("rules/game/steam.yml".into()),
                    status: TransformStatus::Success,
                    error: None,
                    produced_content_id: Some(staged_document_id),
                    created_at: now,
                    finished_at: now,
                })
                .await
                .unwrap();
        }

        let (status, body) = get_json(fixture.app(), "/api/transform-runs?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let runs = body.as_array().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0]["staged_document_id"], 3);
        assert_eq!(runs[0]["status"], "SUCCESS");

        let (_, body) = get_json(fixture.app(), "/api/transform-runs").await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }
}
