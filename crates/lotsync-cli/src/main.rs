use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lotsync_storage::migrate::apply_all;
use lotsync_storage::store::LotStore;
use lotsync_sync::{SyncConfig, SyncOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lotsync-cli")]
#[command(about = "Auction lot synchronizer command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Run one sync pass against an auction.
    Sync {
        /// Auction code to sync.
        #[arg(long)]
        auction: String,
        /// Page cap for the pass; defaults to the configured limit.
        #[arg(long)]
        max_pages: Option<u64>,
        /// Diff and report without writing lots or publishing events.
        #[arg(long)]
        dry_run: bool,
        /// Follow changed lots with a detail-page fetch.
        #[arg(long)]
        fetch_details: bool,
        /// Seconds to wait between page fetches.
        #[arg(long)]
        delay_seconds: Option<u64>,
    },
    /// Serve the control API and event feed.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = LotStore::open_path(&config.database_path).await?;
            let applied = apply_all(store.pool()).await?;
            println!("migrations applied: {applied}");
        }
        Commands::Sync {
            auction,
            max_pages,
            dry_run,
            fetch_details,
            delay_seconds,
        } => {
            let state = lotsync_web::state_from_config(&config).await?;
            let mut options = SyncOptions::for_auction(auction);
            options.max_pages = max_pages.or(Some(config.max_pages));
            options.dry_run = dry_run;
            options.fetch_details = fetch_details;
            options.page_delay =
                Duration::from_secs(delay_seconds.unwrap_or(config.page_delay_seconds));

            let summary = state.engine.run_once(&options).await?;
            println!(
                "sync {}: run_id={} pages={} lots={} updated={} errors={}",
                summary.status,
                summary.run_id,
                summary.counters.pages_scanned,
                summary.counters.lots_scanned,
                summary.counters.lots_updated,
                summary.counters.error_count,
            );
        }
        Commands::Serve => {
            info!(database_path = %config.database_path, "starting control API");
            lotsync_web::serve_from_env().await?;
        }
    }

    Ok(())
}
