use std::sync::Arc;

use anyhow::{Context, Result};
use aod_core::{JobType, DEFAULT_PRIORITY};
use aod_storage::PgStore;
use aod_sync::{Pipeline, SyncConfig};
use aod_web::AppState;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aod-cli")]
#[command(about = "AOD ingestion pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the poller and the transform cron until Ctrl-C.
    Worker,
    /// Run a single poll round and wait for its jobs.
    Poll,
    /// Transform one batch of staged documents.
    Transform {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Create crawl jobs for the given targets.
    Enqueue {
        job_type: String,
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: i32,
    },
    Migrate,
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn pipeline(config: SyncConfig, store: Arc<PgStore>) -> Result<Pipeline> {
    Pipeline::build(config, store.clone(), store.clone(), store).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to postgres")?,
    );

    match cli.command.unwrap_or(Commands::Worker) {
        Commands::Worker => {
            store.migrate().await?;
            pipeline(config, store).await?.run_until_shutdown().await?;
        }
        Commands::Poll => {
            let pipeline = pipeline(config, store).await?;
            let report = pipeline.scheduler.poll_and_dispatch().await;
            pipeline.scheduler.wait_idle().await;
            println!(
                "poll complete: dispatched={} deferred_types={} reaped={}",
                report.dispatched, report.deferred_types, report.reaped
            );
        }
        Commands::Transform { batch_size } => {
            let batch_size = batch_size.unwrap_or(config.transform_batch_size);
            let pipeline = pipeline(config, store).await?;
            let report = pipeline.runner.process_batch(batch_size).await?;
            println!(
                "transform complete: claimed={} succeeded={} failed={} released={}",
                report.claimed, report.succeeded, report.failed, report.released
            );
        }
        Commands::Enqueue {
            job_type,
            targets,
            priority,
        } => {
            let job_type = JobType::new(job_type);
            let pipeline = pipeline(config, store).await?;
            let created = pipeline
                .producer
                .create_jobs(&job_type, &targets, priority)
                .await?;
            println!(
                "enqueue complete: job_type={} created={} skipped={}",
                job_type,
                created,
                targets.len() - created
            );
        }
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let state = AppState::new(store.clone(), store.clone(), store);
            aod_web::serve(state, port).await?;
        }
    }

    Ok(())
}
