use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tix_storage::SqliteIncidentStore;
use tix_sync::{RunMode, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "tix_cli=info,tix_sync=info,tix_storage=info,tix_core=info";

#[derive(Debug, Parser)]
#[command(name = "tix-cli")]
#[command(about = "Traffic incident ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source and persist the normalized incidents.
    Sync {
        /// Fetch and transform without writing to the store.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the incidents table and indexes.
    Migrate,
    /// Run syncs on the SYNC_CRON_1/SYNC_CRON_2 schedule until interrupted.
    Schedule,
    /// Count stored rows whose coordinates fail validation.
    AuditCoordinates {
        /// Delete the offending rows after reporting them.
        #[arg(long)]
        purge: bool,
        /// Confirm a purge.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        json: false,
    }) {
        Commands::Sync { dry_run, json } => {
            let mode = if dry_run { RunMode::DryRun } else { RunMode::Persist };
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run(mode).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for source in &summary.sources {
                    println!(
                        "{:<20} fetched={} kept={} dropped={}{}",
                        source.name,
                        source.fetched_records,
                        source.transformed,
                        source.dropped,
                        source
                            .tiles
                            .map(|(ok, total)| format!(" tiles={ok}/{total}"))
                            .unwrap_or_default()
                    );
                }
                println!("{}", summary.result.message);
            }
            if !summary.result.success {
                bail!("sync run {} failed", summary.run_id);
            }
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("creating incidents schema")?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::AuditCoordinates { purge, yes } => {
            let store = connect(&config).await?;
            let audit = store.audit_coordinates(config.bounds).await?;
            println!("placeholder (1,1):        {}", audit.placeholder);
            println!("zero (0,0):               {}", audit.zero);
            println!("null coordinates:         {}", audit.null);
            println!("latitude out of bounds:   {}", audit.latitude_out_of_bounds);
            println!("longitude out of bounds:  {}", audit.longitude_out_of_bounds);
            println!("total bad rows:           {}", audit.total);

            if purge {
                if !yes {
                    bail!("refusing to purge {} rows without --yes", audit.total);
                }
                let deleted = store.purge_invalid_coordinates(config.bounds).await?;
                println!("deleted {deleted} rows");
            }
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<SqliteIncidentStore> {
    SqliteIncidentStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))
}
