use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kodepos_pipeline::{HarvestConfig, HarvestPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kodepos")]
#[command(about = "Indonesian postal code harvester")]
struct Cli {
    /// Path to the run configuration file.
    #[arg(long, default_value = "kodepos.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and stage every source page.
    Harvest,
    /// Aggregate staged pages into the output artifacts.
    Build,
    /// Harvest, then build.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::load_or_default(&cli.config)?;
    let pipeline = HarvestPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Harvest => {
            let summary = pipeline.harvest().await?;
            println!(
                "harvest complete: run_id={} province_pages={} regency_pages={} village_pages={}",
                summary.run_id, summary.province_pages, summary.regency_pages, summary.village_pages
            );
        }
        Commands::Build => {
            let summary = pipeline.build().await?;
            println!(
                "build complete: run_id={} provinces={} regencies={} districts={} villages={}",
                summary.run_id,
                summary.provinces,
                summary.regencies,
                summary.districts,
                summary.villages
            );
        }
        Commands::Run => {
            let harvest = pipeline.harvest().await?;
            println!(
                "harvest complete: run_id={} province_pages={} regency_pages={} village_pages={}",
                harvest.run_id, harvest.province_pages, harvest.regency_pages, harvest.village_pages
            );
            let build = pipeline.build().await?;
            println!(
                "build complete: run_id={} provinces={} regencies={} districts={} villages={}",
                build.run_id, build.provinces, build.regencies, build.districts, build.villages
            );
        }
    }

    Ok(())
}
