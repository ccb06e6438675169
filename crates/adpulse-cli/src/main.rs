use std::path::PathBuf;
use std::sync::Arc;

use adpulse_core::{DateRange, SyncKind};
use adpulse_storage::{JobFilter, PgStore};
use adpulse_sync::{SyncConfig, SyncCoordinator, SyncRequest, SyncTarget};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "adpulse")]
#[command(about = "Ad creative performance sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one account, or every active account when --account is omitted.
    Sync {
        #[arg(long)]
        account: Option<Uuid>,
        #[arg(long, default_value = "manual")]
        kind: SyncKind,
        #[arg(long)]
        since: Option<NaiveDate>,
        #[arg(long)]
        until: Option<NaiveDate>,
    },
    /// Cancel the running job.
    Cancel {
        #[arg(long)]
        job: Option<Uuid>,
    },
    Jobs {
        #[arg(long)]
        account: Option<Uuid>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    Migrate,
    /// HTTP API, plus the cron scheduler when enabled.
    Serve,
    Schedule,
    /// Parquet snapshot of entities and daily metrics.
    Export {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        account: Option<Uuid>,
    },
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

async fn connect(config: &SyncConfig) -> Result<Arc<PgStore>> {
    Ok(Arc::new(PgStore::connect(&config.database_url).await?))
}

async fn coordinator_from_env() -> Result<Arc<SyncCoordinator>> {
    let config = SyncConfig::from_env();
    let store = connect(&config).await?;
    Ok(Arc::new(SyncCoordinator::new(store, config)?))
}

fn request_range(
    config: &SyncConfig,
    kind: SyncKind,
    since: Option<NaiveDate>,
    until: Option<NaiveDate>,
) -> Result<Option<DateRange>> {
    if since.is_none() && until.is_none() {
        return Ok(None);
    }
    let until = until.unwrap_or_else(|| Utc::now().date_naive());
    let since = since.unwrap_or_else(|| config.windows.range_for(kind, until).since);
    DateRange::new(since, until)
        .map(Some)
        .context("--since must not be after --until")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        account: None,
        kind: SyncKind::Manual,
        since: None,
        until: None,
    }) {
        Commands::Sync {
            account,
            kind,
            since,
            until,
        } => {
            let coordinator = coordinator_from_env().await?;
            let request = SyncRequest {
                target: account.map_or(SyncTarget::AllActive, SyncTarget::One),
                kind,
                range: request_range(coordinator.config(), kind, since, until)?,
            };
            let results = coordinator.start(request).await?;
            for result in &results {
                match result.job() {
                    Some(job) => println!(
                        "{} ({}): job={} status={} entities={} daily_rows={} api_calls={} soft_errors={}",
                        result.account_name,
                        result.account_id,
                        job.id,
                        job.status,
                        job.progress.counters.entities_upserted
                            + job.progress.counters.metrics_only_updated,
                        job.progress.counters.daily_rows_upserted,
                        job.progress.api_calls,
                        job.progress.errors.len()
                    ),
                    None => println!(
                        "{} ({}): skipped, another sync is running",
                        result.account_name, result.account_id
                    ),
                }
            }
        }
        Commands::Cancel { job } => {
            let coordinator = coordinator_from_env().await?;
            match coordinator.cancel(job).await? {
                Some(job) => println!("cancelled job {}", job.id),
                None => println!("no running sync job"),
            }
        }
        Commands::Jobs { account, limit } => {
            let coordinator = coordinator_from_env().await?;
            let jobs = coordinator
                .list_jobs(&JobFilter {
                    account_id: account,
                    limit,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let coordinator = coordinator_from_env().await?;
            let scheduler = adpulse_sync::maybe_build_scheduler(coordinator.clone()).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %coordinator.config().sync_cron, "scheduler started");
            }
            let port = std::env::var("ADPULSE_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            adpulse_web::serve(coordinator, port).await?;
        }
        Commands::Schedule => {
            let coordinator = coordinator_from_env().await?;
            let Some(mut scheduler) = adpulse_sync::maybe_build_scheduler(coordinator.clone()).await?
            else {
                anyhow::bail!("scheduler disabled; set ADPULSE_SCHEDULER_ENABLED=1");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %coordinator.config().sync_cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            coordinator.shutdown();
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Export { out, account } => {
            let config = SyncConfig::from_env();
            let store = connect(&config).await?;
            let manifest = adpulse_sync::export_snapshot(store.as_ref(), &out, account).await?;
            for file in &manifest.files {
                println!("{} rows={} sha256={}", file.path, file.rows, file.sha256);
            }
        }
    }

    Ok(())
}
