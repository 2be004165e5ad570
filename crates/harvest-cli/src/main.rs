use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use harvest_sync::{HarvestPipeline, HarvestRunSummary, HarvestSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Data.Vic metadata harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every enabled source, or only the one given.
    Run {
        #[arg(long)]
        source: Option<String>,
    },
    /// Check every registered source configuration against the catalog.
    Validate,
    /// Run harvests on the configured cron schedule until interrupted.
    Schedule,
}

fn print_summary(summary: &HarvestRunSummary) {
    println!(
        "harvest complete: source={} run_id={} created={} updated={} unchanged={} deleted={} skipped={} failed={}",
        summary.source_id,
        summary.run_id,
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.deleted,
        summary.skipped,
        summary.failed
    );
    for error in &summary.errors {
        eprintln!("  {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = HarvestSettings::from_env();

    match cli.command.unwrap_or(Commands::Run { source: None }) {
        Commands::Run { source: None } => {
            let pipeline = HarvestPipeline::new(settings)?;
            for summary in pipeline.run_all().await? {
                print_summary(&summary);
            }
        }
        Commands::Run {
            source: Some(source_id),
        } => {
            let pipeline = HarvestPipeline::new(settings)?;
            let registry = pipeline.load_registry().await?;
            let Some(source) = registry.find(&source_id) else {
                bail!("no source {source_id} in sources.yaml");
            };
            let summary = pipeline.run_source(source).await?;
            print_summary(&summary);
        }
        Commands::Validate => {
            let pipeline = HarvestPipeline::new(settings)?;
            let mut invalid = 0;
            for result in pipeline.validate_all().await? {
                match result.error {
                    None => println!("{}: ok", result.source_id),
                    Some(error) => {
                        invalid += 1;
                        println!("{}: {error}", result.source_id);
                    }
                }
            }
            if invalid > 0 {
                bail!("{invalid} source configuration(s) invalid");
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(HarvestPipeline::new(settings)?);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set HARVEST_SCHEDULER_ENABLED=1");
            };
            sched.start().await?;
            info!(cron = %pipeline.settings().cron, "scheduler started");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
        }
    }

    Ok(())
}
