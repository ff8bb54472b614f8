use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use price_scraper::config::{DiscoveryStrategy, Settings};
use price_scraper::db;
use price_scraper::fetch::HttpFetcher;
use price_scraper::ledger::ProcessedFileLedger;
use price_scraper::logging;
use price_scraper::pipeline::{PipelineOrchestrator, RunOptions, RunReport};
use price_scraper::store::PriceStore;

#[derive(Parser)]
#[command(name = "price_scraper")]
#[command(about = "Retailer price transparency file ingestion pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingestion for one or all configured sources
    Ingest {
        /// Only ingest this source id
        #[arg(long)]
        source: Option<String>,
        /// Reprocess files even if the ledger already marks them done
        #[arg(long)]
        force: bool,
        /// Override the per-source discovery page cap
        #[arg(long)]
        max_pages: Option<u32>,
        /// SQLite database path (default: $PRICE_SCRAPER_DB or prices.db)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Source registry file
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// List the configured retailer sources
    Sources {
        /// Source registry file
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { source, force, max_pages, db, config, report } => {
            let settings = Settings::load(&config)?;
            let sources = settings.select_sources(source.as_deref())?;
            if sources.is_empty() {
                println!("⚠️  No sources configured in {}", config.display());
                return Ok(());
            }

            let db_path = db
                .or_else(|| std::env::var("PRICE_SCRAPER_DB").ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("prices.db"));
            let conn = db::open(&db_path)?;

            let fetcher = Arc::new(HttpFetcher::new(&settings.pipeline)?);
            let store = PriceStore::new(conn.clone(), settings.pipeline.batch_size);
            let ledger = ProcessedFileLedger::new(conn);
            let orchestrator =
                PipelineOrchestrator::new(settings.pipeline.clone(), fetcher, store, ledger);

            let cancel = CancellationToken::new();
            let ctrlc = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight work");
                    ctrlc.cancel();
                }
            });

            println!("🔄 Ingesting {} source(s)...", sources.len());
            let run = orchestrator
                .run(sources, RunOptions { force, max_pages }, cancel)
                .await?;

            print_summary(&run);

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&run)?)?;
                println!("💾 Run report written to {}", path.display());
            }

            if !run.fully_successful() {
                error!("at least one source failed with no successful files");
                std::process::exit(1);
            }
        }
        Commands::Sources { config } => {
            let settings = Settings::load(&config)?;
            for source in &settings.sources {
                let strategy = match &source.strategy {
                    DiscoveryStrategy::DirectFeed { file_prefix, max_pages, .. } => {
                        format!("direct feed ({file_prefix}*, up to {max_pages} pages)")
                    }
                    DiscoveryStrategy::FilteredScan { chain_marker, max_pages, .. } => {
                        format!("filtered scan (marker {chain_marker}, up to {max_pages} pages)")
                    }
                };
                println!("{:<16} {:<24} {}", source.id, source.name, strategy);
            }
        }
    }

    Ok(())
}

fn print_summary(run: &RunReport) {
    println!("\n📊 Ingestion results:");
    for stats in &run.sources {
        println!(
            "   {:<16} discovered {:>3}  skipped {:>3}  succeeded {:>3}  failed {:>3}  upserted {:>6}",
            stats.source_id,
            stats.files_discovered,
            stats.files_skipped,
            stats.files_succeeded,
            stats.files_failed,
            stats.records_upserted,
        );
        if let Some(err) = &stats.error {
            println!("      ⚠️  {err}");
        }
    }
    if run.cancelled {
        println!("   ⚠️  Run was cancelled before completion");
    }
    println!("   Total records upserted: {}", run.total_upserted());
}
