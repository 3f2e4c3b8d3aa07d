use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edge_collector::config;
use edge_collector::db;
use edge_collector::outbox::{OutboxQueue, QueueSettings};
use edge_collector::parser::FiscalDocumentParser;
use edge_collector::pipeline::{Pipeline, PipelineSettings};
use edge_collector::transmit::{ClientSettings, TransmissionClient};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
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

    let shutdown = CancellationToken::new();
    let client = TransmissionClient::with_cancellation(
        ClientSettings::from_config(&cfg)?,
        shutdown.child_token(),
    )?;
    let pipeline = Pipeline::new(
        PipelineSettings::from_config(&cfg),
        queue,
        Arc::new(client),
        Arc::new(FiscalDocumentParser::new()),
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => error!(?err, "failed to listen for ctrl-c; shutting down"),
        }
        signal_token.cancel();
    });

    info!(folders = cfg.watch.folders.len(), "starting edge collector");
    pipeline.run(&cfg.watch.folders, shutdown).await?;
    info!("edge collector stopped");
    Ok(())
}
