//! Postgres implementation of every store.
//!
//! Claims use `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)` so selecting
//! and hiding rows happens in one statement; concurrent claimants simply see fewer rows.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use aod_core::{
    CanonicalContent, CatalogUpsert, Domain, DomainExtension, EnqueueOutcome, GameExtension,
    Job, JobOutcome, JobStatus, JobType, MovieExtension, NewJob, NewStagedDocument,
    NewTransformRun, PlatformData, SaveOutcome, StagedDocument, TransformRun, TransformStatus,
    TvExtension, WebnovelExtension, WebtoonExtension,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::jobs::{JobStore, STALE_CLAIM_ERROR};
use crate::staging::StagingStore;

const JOB_COLUMNS: &str = "id, job_type, target_id, metadata, status, priority, retry_count, \
     max_retries, last_error, created_at, updated_at, started_at, completed_at";

const STAGED_COLUMNS: &str = "id, platform_name, domain, payload, platform_specific_id, \
     source_url, content_hash, processed, fetched_at, processed_at";

const CONTENT_COLUMNS: &str = "id, domain, master_title, original_title, release_year, \
     poster_url, synopsis, created_at, updated_at";

const RUN_COLUMNS: &str = "id, staged_document_id, platform_name, domain, rule_path, status, \
     error, produced_content_id, created_at, finished_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    claimant: String,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claimant: format!("aod-{}", Uuid::new_v4()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> anyhow::Result<Job> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        job_type: JobType::new(job_type),
        target_id: row.try_get("target_id")?,
        metadata: row.try_get("metadata")?,
        status: status.parse()?,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn staged_from_row(row: &PgRow) -> anyhow::Result<StagedDocument> {
    let domain: String = row.try_get("domain")?;
    Ok(StagedDocument {
        id: row.try_get("id")?,
        platform_name: row.try_get("platform_name")?,
        domain: domain.parse()?,
        payload: row.try_get("payload")?,
        platform_specific_id: row.try_get("platform_specific_id")?,
        source_url: row.try_get("source_url")?,
        content_hash: row.try_get("content_hash")?,
        processed: row.try_get("processed")?,
        fetched_at: row.try_get("fetched_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn content_from_row(row: &PgRow) -> anyhow::Result<CanonicalContent> {
    let domain: String = row.try_get("domain")?;
    Ok(CanonicalContent {
        id: row.try_get("id")?,
        domain: domain.parse()?,
        master_title: row.try_get("master_title")?,
        original_title: row.try_get("original_title")?,
        release_year: row.try_get("release_year")?,
        poster_url: row.try_get("poster_url")?,
        synopsis: row.try_get("synopsis")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> anyhow::Result<TransformRun> {
    let domain: String = row.try_get("domain")?;
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "SUCCESS" => TransformStatus::Success,
        "FAILED" => TransformStatus::Failed,
        other => return Err(anyhow!("unknown transform status `{other}`")),
    };
    Ok(TransformRun {
        id: row.try_get("id")?,
        staged_document_id: row.try_get("staged_document_id")?,
        platform_name: row.try_get("platform_name")?,
        domain: domain.parse()?,
        rule_path: row.try_get("rule_path")?,
        status,
        error: row.try_get("error")?,
        produced_content_id: row.try_get("produced_content_id")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

async fn store_job_state(conn: &mut PgConnection, job: &Job) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
           SET status = $2,
               retry_count = $3,
               last_error = $4,
               updated_at = $5,
               started_at = $6,
               completed_at = $7
         WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.status.as_str())
    .bind(job.retry_count)
    .bind(&job.last_error)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(conn)
    .await
    .with_context(|| format!("updating job {}", job.id))?;
    Ok(())
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (job_type, target_id, metadata, priority, max_retries)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_type, target_id) WHERE status IN ('pending', 'processing', 'retry')
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.job_type.as_str())
        .bind(&job.target_id)
        .bind(&job.metadata)
        .bind(job.priority)
        .bind(job.max_retries)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("creating job {} {}", job.job_type, job.target_id))?;

        Ok(match id {
            Some(id) => EnqueueOutcome::Created(id),
            None => EnqueueOutcome::Duplicate,
        })
    }

    #[instrument(skip(self, job_type), fields(job_type = %job_type))]
    async fn claim_jobs(&self, job_type: &JobType, limit: usize) -> anyhow::Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            UPDATE jobs
               SET status = 'processing',
                   started_at = NOW(),
                   updated_at = NOW()
             WHERE id IN (
                   SELECT id
                     FROM jobs
                    WHERE job_type = $1
                      AND status IN ('pending', 'retry')
                    ORDER BY priority ASC, created_at ASC, id ASC
                    LIMIT $2
                      FOR UPDATE SKIP LOCKED
             )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(job_type.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("claiming jobs")?;

        let mut jobs = rows.iter().map(job_from_row).collect::<anyhow::Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| (a.priority, a.created_at, a.id).cmp(&(b.priority, b.created_at, b.id)));
        debug!(claimed = jobs.len(), "claimed jobs");
        Ok(jobs)
    }

    async fn finish_job(
        &self,
        claimed: &Job,
        outcome: &JobOutcome,
    ) -> anyhow::Result<Option<Job>> {
        let Some(claimed_at) = claimed.started_at else {
            return Ok(None);
        };
        let job_id = claimed.id;
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM jobs
             WHERE id = $1
               AND status = 'processing'
               AND started_at = $2
               FOR UPDATE
            "#
        );
        let Some(row) = sqlx::query(&sql)
            .bind(job_id)
            .bind(claimed_at)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("locking job {job_id}"))?
        else {
            return Ok(None);
        };

        let mut job = job_from_row(&row)?;
        job.apply_outcome(outcome, Utc::now());
        store_job_state(&mut tx, &job).await?;
        tx.commit().await.context("committing job outcome")?;
        Ok(Some(job))
    }

    async fn reap_stale(&self, ttl: Duration) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM jobs
             WHERE status = 'processing'
               AND (started_at IS NULL OR started_at < $1)
               FOR UPDATE SKIP LOCKED
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now - ttl)
            .fetch_all(&mut *tx)
            .await
            .context("selecting stale jobs")?;

        for row in &rows {
            let mut job = job_from_row(row)?;
            job.mark_failed(STALE_CLAIM_ERROR, now);
            store_job_state(&mut tx, &job).await?;
        }
        tx.commit().await.context("committing stale job reap")?;
        Ok(rows.len())
    }

    async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading job {job_id}"))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn status_counts(&self) -> anyhow::Result<BTreeMap<JobStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("counting jobs")?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            counts.insert(status.parse::<JobStatus>()?, row.try_get::<i64, _>("n")?);
        }
        Ok(counts)
    }
}

#[async_trait]
impl StagingStore for PgStore {
    async fn insert_if_absent(&self, doc: NewStagedDocument) -> anyhow::Result<SaveOutcome> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO staged_documents
                (platform_name, domain, payload, platform_specific_id, source_url, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (content_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&doc.platform_name)
        .bind(doc.domain.as_str())
        .bind(&doc.payload)
        .bind(&doc.platform_specific_id)
        .bind(&doc.source_url)
        .bind(&doc.content_hash)
        .fetch_optional(&self.pool)
        .await
        .context("inserting staged document")?;

        if let Some(id) = inserted {
            return Ok(SaveOutcome {
                id,
                deduplicated: false,
            });
        }

        let id: i64 = sqlx::query_scalar("SELECT id FROM staged_documents WHERE content_hash = $1")
            .bind(&doc.content_hash)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("loading staged document by hash {}", doc.content_hash))?;
        Ok(SaveOutcome {
            id,
            deduplicated: true,
        })
    }

    async fn claim_batch(
        &self,
        limit: usize,
        claim_ttl: Duration,
    ) -> anyhow::Result<Vec<StagedDocument>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            UPDATE staged_documents
               SET claimed_at = NOW(),
                   claimed_by = $1
             WHERE id IN (
                   SELECT id
                     FROM staged_documents
                    WHERE processed = FALSE
                      AND (claimed_at IS NULL OR claimed_at < $2)
                    ORDER BY fetched_at ASC, id ASC
                    LIMIT $3
                      FOR UPDATE SKIP LOCKED
             )
            RETURNING {STAGED_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&self.claimant)
            .bind(Utc::now() - claim_ttl)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("claiming staged documents")?;

        let mut docs = rows
            .iter()
            .map(staged_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        docs.sort_by(|a, b| (a.fetched_at, a.id).cmp(&(b.fetched_at, b.id)));
        Ok(docs)
    }

    async fn mark_processed(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE staged_documents
               SET processed = TRUE,
                   processed_at = NOW(),
                   claimed_at = NULL,
                   claimed_by = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking staged document {id} processed"))?;
        Ok(())
    }

    async fn release(&self, ids: &[i64]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE staged_documents
               SET claimed_at = NULL,
                   claimed_by = NULL
             WHERE id = ANY($1)
               AND processed = FALSE
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("releasing staged document claims")?;
        Ok(())
    }

    async fn backlog(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM staged_documents WHERE processed = FALSE")
            .fetch_one(&self.pool)
            .await
            .context("counting staging backlog")
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<StagedDocument>> {
        let sql = format!("SELECT {STAGED_COLUMNS} FROM staged_documents WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading staged document {id}"))?;
        row.as_ref().map(staged_from_row).transpose()
    }
}

async fn resolve_content(
    conn: &mut PgConnection,
    upsert: &CatalogUpsert,
) -> anyhow::Result<Option<i64>> {
    let exact: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id
          FROM contents
         WHERE domain = $1
           AND master_title = $2
           AND release_year IS NOT DISTINCT FROM $3
         LIMIT 1
        "#,
    )
    .bind(upsert.domain.as_str())
    .bind(&upsert.master_title)
    .bind(upsert.master.release_year)
    .fetch_optional(&mut *conn)
    .await
    .context("resolving content by exact identity")?;
    if exact.is_some() {
        return Ok(exact);
    }

    // A missing year on either side matches the oldest record with the same title.
    sqlx::query_scalar(
        r#"
        SELECT id
          FROM contents
         WHERE domain = $1
           AND master_title = $2
           AND ($3::INTEGER IS NULL OR release_year IS NULL)
         ORDER BY id ASC
         LIMIT 1
        "#,
    )
    .bind(upsert.domain.as_str())
    .bind(&upsert.master_title)
    .bind(upsert.master.release_year)
    .fetch_optional(&mut *conn)
    .await
    .context("resolving content with unknown year")
}

async fn load_extension(
    conn: &mut PgConnection,
    domain: Domain,
    content_id: i64,
) -> anyhow::Result<Option<DomainExtension>> {
    let sql = match domain {
        Domain::Movie => {
            "SELECT release_date, runtime_min, genres, directors, cast_members \
             FROM movie_contents WHERE content_id = $1"
        }
        Domain::Tv => {
            "SELECT first_air_date, season_count, episode_runtime, genres, cast_members \
             FROM tv_contents WHERE content_id = $1"
        }
        Domain::Game => {
            "SELECT developer, publisher, release_date, platforms, genres \
             FROM game_contents WHERE content_id = $1"
        }
        Domain::Webtoon => {
            "SELECT author, illustrator, status, started_at, weekdays, genres \
             FROM webtoon_contents WHERE content_id = $1"
        }
        Domain::Webnovel => {
            "SELECT author, translator, status, started_at, genres \
             FROM webnovel_contents WHERE content_id = $1"
        }
    };
    let Some(row) = sqlx::query(sql)
        .bind(content_id)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("loading {domain} extension for content {content_id}"))?
    else {
        return Ok(None);
    };

    let extension = match domain {
        Domain::Movie => DomainExtension::Movie(MovieExtension {
            release_date: row.try_get("release_date")?,
            runtime_min: row.try_get("runtime_min")?,
            genres: row.try_get("genres")?,
            directors: row.try_get("directors")?,
            cast_members: row.try_get("cast_members")?,
        }),
        Domain::Tv => DomainExtension::Tv(TvExtension {
            first_air_date: row.try_get("first_air_date")?,
            season_count: row.try_get("season_count")?,
            episode_runtime: row.try_get("episode_runtime")?,
            genres: row.try_get("genres")?,
            cast_members: row.try_get("cast_members")?,
        }),
        Domain::Game => DomainExtension::Game(GameExtension {
            developer: row.try_get("developer")?,
            publisher: row.try_get("publisher")?,
            release_date: row.try_get("release_date")?,
            platforms: row.try_get("platforms")?,
            genres: row.try_get("genres")?,
        }),
        Domain::Webtoon => DomainExtension::Webtoon(WebtoonExtension {
            author: row.try_get("author")?,
            illustrator: row.try_get("illustrator")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            weekdays: row.try_get("weekdays")?,
            genres: row.try_get("genres")?,
        }),
        Domain::Webnovel => DomainExtension::Webnovel(WebnovelExtension {
            author: row.try_get("author")?,
            translator: row.try_get("translator")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            genres: row.try_get("genres")?,
        }),
    };
    Ok(Some(extension))
}

async fn save_extension(
    conn: &mut PgConnection,
    content_id: i64,
    extension: &DomainExtension,
) -> anyhow::Result<()> {
    let query = match extension {
        DomainExtension::Movie(m) => sqlx::query(
            r#"
            INSERT INTO movie_contents
                (content_id, release_date, runtime_min, genres, directors, cast_members)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (content_id) DO UPDATE
               SET release_date = EXCLUDED.release_date,
                   runtime_min = EXCLUDED.runtime_min,
                   genres = EXCLUDED.genres,
                   directors = EXCLUDED.directors,
                   cast_members = EXCLUDED.cast_members
            "#,
        )
        .bind(content_id)
        .bind(m.release_date)
        .bind(m.runtime_min)
        .bind(m.genres.clone())
        .bind(m.directors.clone())
        .bind(m.cast_members.clone()),
        DomainExtension::Tv(t) => sqlx::query(
            r#"
            INSERT INTO tv_contents
                (content_id, first_air_date, season_count, episode_runtime, genres, cast_members)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (content_id) DO UPDATE
               SET first_air_date = EXCLUDED.first_air_date,
                   season_count = EXCLUDED.season_count,
                   episode_runtime = EXCLUDED.episode_runtime,
                   genres = EXCLUDED.genres,
                   cast_members = EXCLUDED.cast_members
            "#,
        )
        .bind(content_id)
        .bind(t.first_air_date)
        .bind(t.season_count)
        .bind(t.episode_runtime)
        .bind(t.genres.clone())
        .bind(t.cast_members.clone()),
        DomainExtension::Game(g) => sqlx::query(
            r#"
            INSERT INTO game_contents
                (content_id, developer, publisher, release_date, platforms, genres)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (content_id) DO UPDATE
               SET developer = EXCLUDED.developer,
                   publisher = EXCLUDED.publisher,
                   release_date = EXCLUDED.release_date,
                   platforms = EXCLUDED.platforms,
                   genres = EXCLUDED.genres
            "#,
        )
        .bind(content_id)
        .bind(g.developer.clone())
        .bind(g.publisher.clone())
        .bind(g.release_date)
        .bind(g.platforms.clone())
        .bind(g.genres.clone()),
        DomainExtension::Webtoon(w) => sqlx::query(
            r#"
            INSERT INTO webtoon_contents
                (content_id, author, illustrator, status, started_at, weekdays, genres)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (content_id) DO UPDATE
               SET author = EXCLUDED.author,
                   illustrator = EXCLUDED.illustrator,
                   status = EXCLUDED.status,
                   started_at = EXCLUDED.started_at,
                   weekdays = EXCLUDED.weekdays,
                   genres = EXCLUDED.genres
            "#,
        )
        .bind(content_id)
        .bind(w.author.clone())
        .bind(w.illustrator.clone())
        .bind(w.status.clone())
        .bind(w.started_at)
        .bind(w.weekdays.clone())
        .bind(w.genres.clone()),
        DomainExtension::Webnovel(n) => sqlx::query(
            r#"
            INSERT INTO webnovel_contents
                (content_id, author, translator, status, started_at, genres)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (content_id) DO UPDATE
               SET author = EXCLUDED.author,
                   translator = EXCLUDED.translator,
                   status = EXCLUDED.status,
                   started_at = EXCLUDED.started_at,
                   genres = EXCLUDED.genres
            "#,
        )
        .bind(content_id)
        .bind(n.author.clone())
        .bind(n.translator.clone())
        .bind(n.status.clone())
        .bind(n.started_at)
        .bind(n.genres.clone()),
    };
    query
        .execute(conn)
        .await
        .with_context(|| format!("saving {} extension for content {content_id}", extension.domain()))?;
    Ok(())
}

#[async_trait]
impl CatalogStore for PgStore {
    #[instrument(skip(self, upsert), fields(domain = %upsert.domain, title = %upsert.master_title))]
    async fn upsert(&self, upsert: &CatalogUpsert) -> anyhow::Result<i64> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        // Serializes writers of the same identity so the unknown-year lookup stays consistent.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", upsert.domain, upsert.master_title))
            .execute(&mut *tx)
            .await
            .context("taking identity lock")?;

        let master = &upsert.master;
        let content_id = match resolve_content(&mut tx, upsert).await? {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE contents
                       SET original_title = COALESCE(original_title, $2),
                           release_year = COALESCE(release_year, $3),
                           poster_url = COALESCE(poster_url, $4),
                           synopsis = COALESCE(synopsis, $5),
                           updated_at = CASE
                               WHEN (original_title IS NULL AND $2::TEXT IS NOT NULL)
                                 OR (release_year IS NULL AND $3::INTEGER IS NOT NULL)
                                 OR (poster_url IS NULL AND $4::TEXT IS NOT NULL)
                                 OR (synopsis IS NULL AND $5::TEXT IS NOT NULL)
                               THEN NOW()
                               ELSE updated_at
                           END
                     WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&master.original_title)
                .bind(master.release_year)
                .bind(&master.poster_url)
                .bind(&master.synopsis)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("merging content {id}"))?;
                id
            }
            None => sqlx::query_scalar(
                r#"
                INSERT INTO contents
                    (domain, master_title, original_title, release_year, poster_url, synopsis)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id
                "#,
            )
            .bind(upsert.domain.as_str())
            .bind(&upsert.master_title)
            .bind(&master.original_title)
            .bind(master.release_year)
            .bind(&master.poster_url)
            .bind(&master.synopsis)
            .fetch_one(&mut *tx)
            .await
            .context("creating content")?,
        };

        let platform = &upsert.platform;
        sqlx::query(
            r#"
            INSERT INTO platform_data
                (content_id, platform_name, platform_specific_id, url, rating, review_count,
                 attributes, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (platform_name, platform_specific_id) DO UPDATE
               SET content_id = EXCLUDED.content_id,
                   url = EXCLUDED.url,
                   rating = EXCLUDED.rating,
                   review_count = EXCLUDED.review_count,
                   attributes = platform_data.attributes || EXCLUDED.attributes,
                   last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(content_id)
        .bind(&platform.platform_name)
        .bind(&platform.platform_specific_id)
        .bind(&platform.url)
        .bind(platform.rating)
        .bind(platform.review_count)
        .bind(JsonValue::Object(platform.attributes.clone()))
        .execute(&mut *tx)
        .await
        .context("upserting platform data")?;

        let mut extension = load_extension(&mut tx, upsert.domain, content_id)
            .await?
            .unwrap_or_else(|| DomainExtension::empty(upsert.domain));
        extension.apply(&upsert.extension)?;
        save_extension(&mut tx, content_id, &extension).await?;

        tx.commit().await.context("committing upsert")?;
        Ok(content_id)
    }

    async fn record_transform_run(&self, run: NewTransformRun) -> anyhow::Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO transform_runs
                (staged_document_id, platform_name, domain, rule_path, status, error,
                 produced_content_id, created_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(run.staged_document_id)
        .bind(&run.platform_name)
        .bind(run.domain.as_str())
        .bind(&run.rule_path)
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(run.produced_content_id)
        .bind(run.created_at)
        .bind(run.finished_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("recording transform run for staged {}", run.staged_document_id))
    }

    async fn recent_transform_runs(&self, limit: usize) -> anyhow::Result<Vec<TransformRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM transform_runs ORDER BY id DESC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("loading transform runs")?;
        rows.iter().map(run_from_row).collect()
    }

    async fn content(&self, id: i64) -> anyhow::Result<Option<CanonicalContent>> {
        let sql = format!("SELECT {CONTENT_COLUMNS} FROM contents WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading content {id}"))?;
        row.as_ref().map(content_from_row).transpose()
    }

    async fn platform_data(
        &self,
        platform_name: &str,
        platform_specific_id: &str,
    ) -> anyhow::Result<Option<PlatformData>> {
        let row = sqlx::query(
            r#"
            SELECT id, content_id, platform_name, platform_specific_id, url, rating,
                   review_count, attributes, last_seen_at
              FROM platform_data
             WHERE platform_name = $1
               AND platform_specific_id = $2
            "#,
        )
        .bind(platform_name)
        .bind(platform_specific_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading platform data {platform_name}/{platform_specific_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let attributes = match row.try_get::<JsonValue, _>("attributes")? {
            JsonValue::Object(map) => map,
            _ => Default::default(),
        };
        Ok(Some(PlatformData {
            id: row.try_get("id")?,
            content_id: row.try_get("content_id")?,
            platform_name: row.try_get("platform_name")?,
            platform_specific_id: row.try_get("platform_specific_id")?,
            url: row.try_get("url")?,
            rating: row.try_get("rating")?,
            review_count: row.try_get("review_count")?,
            attributes,
            last_seen_at: row.try_get("last_seen_at")?,
        }))
    }

    async fn extension(&self, content_id: i64) -> anyhow::Result<Option<DomainExtension>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        let domain: Option<String> = sqlx::query_scalar("SELECT domain FROM contents WHERE id = $1")
            .bind(content_id)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("loading domain of content {content_id}"))?;
        match domain {
            Some(domain) => load_extension(&mut conn, domain.parse()?, content_id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::OnceLock;

    use aod_core::{DomainPatch, MasterRecord, PlatformRecord};
    use serde_json::json;
    use tokio::sync::{Mutex, MutexGuard};

    use super::*;
    use crate::staging::Collector;

    /// Connects and migrates when `DATABASE_URL` is set; these tests are skipped otherwise.
    /// Reaping and draining act on the whole database, so tests hold a shared lock.
    async fn connect_db_from_env() -> Option<(PgStore, MutexGuard<'static, ()>)> {
        static SERIAL: OnceLock<Mutex<()>> = OnceLock::new();
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let guard = SERIAL.get_or_init(|| Mutex::new(())).lock().await;
        let store = PgStore::connect(&database_url).await.expect("connect to DATABASE_URL");
        store.migrate().await.expect("migrate test database");
        Some((store, guard))
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}_{}", Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn pg_concurrent_job_claims_are_disjoint() {
        let Some((store, _serial)) = connect_db_from_env().await else {
            return;
        };
        let job_type = JobType::new(unique("pg_claim"));
        for n in 0..40 {
            store
                .create_job(NewJob::new(job_type.clone(), n.to_string()))
                .await
                .unwrap();
        }

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            let job_type = job_type.clone();
            tasks.spawn(async move { store.claim_jobs(&job_type, 7).await.unwrap() });
        }
        let mut seen = HashSet::new();
        while let Some(batch) = tasks.join_next().await {
            for job in batch.unwrap() {
                assert_eq!(job.status, JobStatus::Processing);
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            }
        }
        assert_eq!(seen.len(), 40);
        assert!(store.claim_jobs(&job_type, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pg_active_job_blocks_duplicate_until_finished() {
        let Some((store, _serial)) = connect_db_from_env().await else {
            return;
        };
        let job_type = JobType::new(unique("pg_dup"));
        let first = store
            .create_job(NewJob::new(job_type.clone(), "570"))
            .await
            .unwrap();
        assert!(first.job_id().is_some());
        assert_eq!(
            store
                .create_job(NewJob::new(job_type.clone(), "570"))
                .await
                .unwrap(),
            EnqueueOutcome::Duplicate
        );

        let claimed = store.claim_jobs(&job_type, 1).await.unwrap();
        let finished = store
            .finish_job(&claimed[0], &JobOutcome::Succeeded)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, JobStatus::Completed);

        let again = store
            .create_job(NewJob::new(job_type.clone(), "570"))
            .await
            .unwrap();
        assert!(again.job_id().is_some());
        assert_ne!(again.job_id(), first.job_id());
    }

    #[tokio::test]
    async fn pg_late_finish_after_reap_is_ignored() {
        let Some((store, _serial)) = connect_db_from_env().await else {
            return;
        };
        let job_type = JobType::new(unique("pg_reap"));
        store
            .create_job(NewJob::new(job_type.clone(), "603").with_max_retries(1))
            .await
            .unwrap();
        let claimed = store.claim_jobs(&job_type, 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(store.reap_stale(Duration::milliseconds(1)).await.unwrap() >= 1);

        let reaped = store.get_job(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(reaped.status, JobStatus::Failed);
        assert_eq!(reaped.retry_count, 1);

        let late = store
            .finish_job(&claimed[0], &JobOutcome::Succeeded)
            .await
            .unwrap();
        assert!(late.is_none());
        let after = store.get_job(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.retry_count, 1);
    }

    #[tokio::test]
    async fn pg_concurrent_staging_claims_are_disjoint() {
        let Some((store, _serial)) = connect_db_from_env().await else {
            return;
        };
        let batch = unique("pg_staging");
        let collector = Collector::new(std::sync::Arc::new(store.clone()));
        let mut ours = HashSet::new();
        for n in 0..30 {
            let saved = collector
                .save_raw("Steam", Domain::Game, json!({"batch": batch, "n": n}), None, None)
                .await
                .unwrap();
            ours.insert(saved.id);
        }
        let again = collector
            .save_raw("Steam", Domain::Game, json!({"n": 0, "batch": batch}), None, None)
            .await
            .unwrap();
        assert!(again.deduplicated);
        assert!(ours.contains(&again.id));

        let ttl = Duration::hours(1);
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let store = store.clone();
            tasks.spawn(async move { store.claim_batch(5, ttl).await.unwrap() });
        }
        let mut seen = HashSet::new();
        while let Some(docs) = tasks.join_next().await {
            for doc in docs.unwrap() {
                assert!(seen.insert(doc.id), "staged document {} claimed twice", doc.id);
            }
        }
        loop {
            let docs = store.claim_batch(100, ttl).await.unwrap();
            if docs.is_empty() {
                break;
            }
            for doc in docs {
                assert!(seen.insert(doc.id), "staged document {} claimed twice", doc.id);
            }
        }
        assert!(ours.is_subset(&seen));

        let claimed: Vec<i64> = seen.into_iter().collect();
        store.release(&claimed).await.unwrap();
    }

    fn game_upsert(
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
                attributes: json!({"price": "$9.99"}).as_object().cloned().unwrap_or_default(),
                ..Default::default()
            },
            extension: DomainPatch::new(Domain::Game),
        }
    }

    #[tokio::test]
    async fn pg_first_writer_wins_on_contents_and_platform_overwrites() {
        let Some((store, _serial)) = connect_db_from_env().await else {
            return;
        };
        let title = unique("Half-Life");
        let psid = unique("70");
        let first = store
            .upsert(&game_upsert(&title, None, "A", &psid, 4.0))
            .await
            .unwrap();
        let second = store
            .upsert(&game_upsert(&title, Some(2020), "B", &psid, 3.5))
            .await
            .unwrap();
        assert_eq!(first, second);

        let content = store.content(first).await.unwrap().unwrap();
        assert_eq!(content.synopsis.as_deref(), Some("A"));
        assert_eq!(content.release_year, Some(2020));

        let platform = store.platform_data("Steam", &psid).await.unwrap().unwrap();
        assert_eq!(platform.content_id, first);
        assert_eq!(platform.rating, Some(3.5));
        assert_eq!(platform.attributes["price"], json!("$9.99"));

        assert!(matches!(
            store.extension(first).await.unwrap(),
            Some(DomainExtension::Game(_))
        ));
    }
}
