use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ygcdm_sync::{build_scheduler, PipelineOptions, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "ygcdm-cli")]
#[command(about = "Loads YouGile deal tasks into the CDM fact table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now
    Sync {
        /// Logical run timestamp (RFC 3339); defaults to now
        #[arg(long)]
        run_ts: Option<DateTime<Utc>>,
        /// Replay recorded listings from this directory
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Write a parquet snapshot instead of inserting into Postgres
        #[arg(long)]
        snapshot_only: bool,
    },
    /// Run syncs on the configured cron schedule until interrupted
    Schedule,
    /// Create the fact table
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Sync {
        run_ts: None,
        fixtures: None,
        snapshot_only: false,
    });

    match command {
        Commands::Sync {
            run_ts,
            fixtures,
            snapshot_only,
        } => {
            let options = PipelineOptions {
                fixtures,
                snapshot_only,
            };
            let summary =
                ygcdm_sync::run_sync_once_from_env(run_ts.unwrap_or_else(Utc::now), &options).await?;
            println!(
                "sync complete: run_id={} columns={} tasks={} rows={} warnings={} sink={}",
                summary.run_id,
                summary.columns_in_scope,
                summary.tasks,
                summary.rows_written,
                summary.warnings.len(),
                summary.sink
            );
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            let pipeline = Arc::new(SyncPipeline::from_config(&config, &PipelineOptions::default())?);
            let mut sched = build_scheduler(pipeline, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            ygcdm_sync::run_migrations(&config.database_url).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
