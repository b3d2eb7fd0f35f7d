use anyhow::Context;
use clap::Parser;
use gkicks_orders::config::Config;
use gkicks_orders::retention::{RetentionJob, spawn_scheduler};
use gkicks_orders::store::Store;
use gkicks_orders::telemetry::setup_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Archives and purges old orders on a schedule.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// sled database directory, overrides GKICKS_DB_PATH
    #[arg(long, env = "GKICKS_DB_PATH")]
    db: Option<PathBuf>,

    /// Run a single retention pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let args = Args::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(db) = args.db {
        config.db_path = db;
    }
    let store = Arc::new(
        Store::open(&config.db_path)
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let job = Arc::new(RetentionJob::new(store.clone(), config.retention));

    if args.once {
        let summary = tokio::task::spawn_blocking({
            let job = job.clone();
            move || job.run()
        })
        .await
        .context("Retention run panicked")?;
        summary.log();
    } else {
        info!(
            interval_secs = config.schedule_interval.as_secs(),
            "Starting retention scheduler"
        );
        let handle = spawn_scheduler(job, config.schedule_interval);
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutting down retention scheduler");
        handle.abort();
    }

    store.flush().context("Failed to flush database")?;
    Ok(())
}
