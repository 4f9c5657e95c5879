use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use seekwatch_core::ScrapeRequest;
use seekwatch_engine::{build_scheduler, AppConfig, Deduplicator, Orchestrator};
use seekwatch_scraper::{HtmlListingScraper, ScrapeExecutor};
use seekwatch_storage::JsonRecordStore;
use seekwatch_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "seekwatch")]
#[command(about = "Job listing watcher: scrape, dedup, notify, serve")]
struct Cli {
    /// Config file path; falls back to SEEKWATCH_CONFIG, then
    /// config/config.yaml, then built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API server (plus the cron scheduler when enabled).
    Serve,
    /// Run one scrape end to end without the server.
    Scrape {
        /// Override the configured headless flag.
        #[arg(long)]
        headless: Option<bool>,
        /// Override the configured page cap.
        #[arg(long)]
        max_pages: Option<u32>,
        /// Skip both dedup stages and persist everything scraped.
        #[arg(long)]
        no_dedup: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        output_format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
    Both,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Scrape {
            headless,
            max_pages,
            no_dedup,
            output_format,
        } => scrape_once(config, headless, max_pages, no_dedup, output_format).await,
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        store,
        Arc::new(HtmlListingScraper::new()),
    )?);

    if let Some(scheduler) = build_scheduler(orchestrator.clone()).await? {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %config.schedule.cron, "scrape scheduler running");
    }

    let bind = config.api.bind.clone();
    info!(%bind, "seekwatch api listening");
    seekwatch_web::serve(AppState::new(orchestrator), &bind).await
}

async fn scrape_once(
    config: AppConfig,
    headless: Option<bool>,
    max_pages: Option<u32>,
    no_dedup: bool,
    output_format: OutputFormat,
) -> Result<()> {
    let request = ScrapeRequest {
        headless,
        max_pages,
        ..Default::default()
    };
    let scrape_config = config.scrape_config(&request);
    let store = open_store(&config).await?;

    info!("starting scrape");
    let executor = HtmlListingScraper::new();
    let raw = tokio::task::spawn_blocking(move || executor.scrape(&scrape_config))
        .await
        .context("scrape task aborted")??;
    info!(scraped = raw.len(), "scrape finished");

    let jobs = if no_dedup {
        raw
    } else {
        let deduper = Deduplicator::new(config.deduplication.key_field);
        let batch = deduper.dedup_within_batch(raw);
        deduper.filter_unseen(&store, batch).await
    };

    if jobs.is_empty() {
        info!("no new jobs to save");
        return Ok(());
    }

    store.save(&jobs).await.context("persisting records")?;
    if matches!(output_format, OutputFormat::Csv | OutputFormat::Both) {
        store
            .export_csv(&config.output.csv_path)
            .await
            .context("exporting csv")?;
    }

    info!(new_jobs = jobs.len(), "scrape complete");
    if let Some(sample) = jobs.first() {
        info!(
            title = %sample.title,
            company = %sample.company,
            location = %sample.location,
            url = %sample.job_url,
            "sample job"
        );
    }
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<Arc<JsonRecordStore>> {
    let store = JsonRecordStore::open(
        config.output.records_path.clone(),
        config.output.seen_path.clone(),
        config.deduplication.retention_days,
        config.deduplication.key_field,
    )
    .await
    .context("opening record store")?;
    Ok(Arc::new(store))
}
