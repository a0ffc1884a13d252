use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tscout_sync::{ScoutConfig, Secrets};

#[derive(Debug, Parser)]
#[command(name = "tscout")]
#[command(about = "Tender Scout: scrape, classify and notify tender listings")]
struct Cli {
    /// Config file; defaults to $TSCOUT_CONFIG or ./tscout.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and print the run summary.
    Run,
    /// Run the pipeline on a cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
    /// Create or upgrade the ledger schema.
    Migrate,
    /// Print ledger state counts and recent runs.
    Status {
        #[arg(long, default_value_t = 5)]
        runs: u32,
    },
    /// Serve the JSON status API.
    Serve {
        #[arg(long, env = "TSCOUT_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ScoutConfig> {
    match path {
        Some(path) => {
            let mut config = ScoutConfig::load(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => ScoutConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let secrets = Secrets::from_env(&config)?;
            let pipeline = tscout_sync::build_pipeline(&config, &secrets).await?;
            let report = pipeline.run_once().await?;
            pipeline.ledger().close().await;

            let counts = report.run.counts;
            println!(
                "run complete: run_id={} status={} scraped={} new={} qualified={} notified={} failed={}",
                report.run.run_id,
                report.run.status.as_str(),
                counts.scraped,
                counts.new,
                counts.qualified,
                counts.notified,
                counts.failed
            );
            for failure in &report.source_failures {
                println!("  source {} failed: {}", failure.source, failure.error);
            }
            for candidate in &report.duplicate_candidates {
                println!(
                    "  possible duplicate: {} ~ {} ({:.2})",
                    candidate.dedup_key_a, candidate.dedup_key_b, candidate.similarity
                );
            }
            if report.stopped_early {
                println!("  run budget exhausted; remaining backlog left for the next run");
            }
        }
        Commands::Schedule { cron } => {
            let mut config = config;
            config.scheduler.enabled = true;
            if let Some(cron) = cron {
                config.scheduler.cron = cron;
            }
            let secrets = Secrets::from_env(&config)?;
            let pipeline = Arc::new(tscout_sync::build_pipeline(&config, &secrets).await?);
            let mut sched = tscout_sync::build_scheduler(pipeline.clone(), &config.scheduler)
                .await?
                .context("scheduler is disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scheduler.cron, "scheduler started");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.ledger().close().await;
        }
        Commands::Migrate => {
            let ledger = tscout_sync::open_ledger(&config).await?;
            let total = ledger.count_tenders().await?;
            ledger.close().await;
            println!(
                "ledger ready: {} ({} tenders)",
                config.ledger.database_url, total
            );
        }
        Commands::Status { runs } => {
            let ledger = tscout_sync::open_ledger(&config).await?;
            println!("tenders: {}", ledger.count_tenders().await?);
            for (state, count) in ledger.state_counts().await? {
                println!("  {state}: {count}");
            }
            println!("recent runs:");
            for run in ledger.recent_runs(runs).await? {
                println!(
                    "  {} {} {} scraped={} new={} qualified={} notified={} failed={}{}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.run_id,
                    run.status.as_str(),
                    run.counts.scraped,
                    run.counts.new,
                    run.counts.qualified,
                    run.counts.notified,
                    run.counts.failed,
                    run.error.map(|e| format!(" error={e}")).unwrap_or_default()
                );
            }
            ledger.close().await;
        }
        Commands::Serve { port } => {
            let ledger = tscout_sync::open_ledger(&config).await?;
            tscout_web::serve(ledger, port).await?;
        }
    }

    Ok(())
}
