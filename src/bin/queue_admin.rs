use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use edge_collector::config;
use edge_collector::db;
use edge_collector::model::QueueStatus;
use edge_collector::outbox::{OutboxQueue, QueueSettings};
use edge_collector::transmit::{ClientSettings, TransmissionClient};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and repair the outbox queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Counts per status, oldest waiting item and recent errors (JSON)
    Stats {
        #[arg(long, default_value = "10")]
        errors: i64,
    },
    /// List items in one status
    List {
        #[arg(long, default_value = "pending")]
        status: String,
        #[arg(long, default_value = "50")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Move every `error` item back to `retry`
    RetryErrors,
    /// Give an `error` or `dead_letter` item another full set of attempts
    ForceRetry { id: String },
    /// Delete `sent` items older than the given number of days
    Purge {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Return items stuck in `processing` to `pending`
    Sweep {
        #[arg(long)]
        stuck_secs: Option<u64>,
    },
    /// Probe the ingestion health endpoint
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    match args.command {
        Command::Health => health(&cfg).await,
        command => run_queue_command(&cfg, command).await,
    }
}

async fn health(cfg: &config::Config) -> Result<()> {
    let client = TransmissionClient::new(ClientSettings::from_config(cfg)?)?;
    let outcome = client.probe_health().await;
    println!(
        "{} (status {:?}, {} ms)",
        client.connection_status().as_str(),
        outcome.status_code,
        outcome.duration.as_millis()
    );
    if !outcome.success {
        return Err(anyhow!(outcome
            .error
            .unwrap_or_else(|| "health probe failed".into())));
    }
    Ok(())
}

async fn run_queue_command(cfg: &config::Config, command: Command) -> Result<()> {
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let queue = OutboxQueue::new(
        pool,
        QueueSettings {
            max_attempts: cfg.queue.max_attempts,
            retry: cfg.retry_schedule(),
        },
    );

    match command {
        Command::Stats { errors } => {
            let stats = queue.stats(errors).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::List {
            status,
            limit,
            offset,
        } => {
            let status = QueueStatus::parse_status(&status)
                .ok_or_else(|| anyhow!("unknown status {:?}", status))?;
            let items = queue.list(status, limit, offset).await?;
            for item in &items {
                println!(
                    "{}\t{}\t{}\tattempts={}/{}\tupdated={}\t{}",
                    item.id,
                    item.document_key,
                    item.status,
                    item.attempts,
                    item.max_attempts,
                    item.updated_at.to_rfc3339(),
                    item.last_error.as_deref().unwrap_or("")
                );
            }
            let total = queue.count(status).await?;
            info!(shown = items.len(), total, %status, "listed items");
        }
        Command::RetryErrors => {
            let moved = queue.requeue_errors().await?;
            println!("moved {} item(s) to retry", moved);
        }
        Command::ForceRetry { id } => {
            if queue.force_retry(&id).await? {
                println!("item {} scheduled for retry", id);
            } else {
                warn!(%id, "item not found or not in error/dead_letter");
                return Err(anyhow!("item {} cannot be force-retried", id));
            }
        }
        Command::Purge { days } => {
            let days = days.unwrap_or(cfg.queue.sent_retention_days);
            let purged = queue
                .purge_sent(Duration::from_secs(u64::from(days) * 86_400))
                .await?;
            println!("purged {} sent item(s) older than {} day(s)", purged, days);
        }
        Command::Sweep { stuck_secs } => {
            let secs = stuck_secs.unwrap_or(cfg.queue.stuck_timeout_secs);
            let reset = queue.reset_stuck(Duration::from_secs(secs)).await?;
            println!("reset {} stuck item(s)", reset);
        }
        Command::Health => health(cfg).await?,
    }
    Ok(())
}
