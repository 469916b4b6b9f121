use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use mangrove_potential::{Config, Pipeline, Stage};

#[derive(Parser, Debug)]
#[command(name = "mangrove")]
#[command(about = "Per-tile stages of the mangrove restoration potential workflow")]
#[command(version)]
struct Args {
    /// Pipeline configuration
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Tiles processed at the same time
    #[arg(short, long, value_name = "N", default_value_t = 1)]
    threads: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Stage to run
    #[arg(value_enum)]
    stage: Stage,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        "Country: {}, data directory: {}",
        config.country_name,
        config.data_dir.display()
    );

    let pipeline = Pipeline::new(config, args.threads);
    args.stage
        .run(&pipeline)
        .with_context(|| format!("stage {}", args.stage))?;
    info!("=== Done: {} ===", args.stage);
    Ok(())
}
