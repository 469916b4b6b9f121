use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use mangrove_potential::sample;
use mangrove_potential::tile::TileId;

#[derive(Parser, Debug)]
#[command(name = "sample")]
#[command(about = "Stratified pixel sample of the layers of one tile")]
struct Args {
    /// Folder holding the tile's layers (e.g. an extracted areas_of_interest)
    #[arg(short, long, value_name = "DIR")]
    folder: PathBuf,

    /// Tile id, e.g. N09E104
    #[arg(short, long, value_name = "ID")]
    tile: String,

    /// Rows drawn from each history class
    #[arg(long, default_value_t = 5000)]
    per_class: usize,

    /// Trees in the random forest
    #[arg(long, default_value_t = 200)]
    trees: u16,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let tile: TileId = args.tile.parse()?;
    let results = sample::run(&args.folder, &tile, args.per_class, args.trees, args.seed)
        .with_context(|| format!("sampling {tile} in {}", args.folder.display()))?;
    info!("Results saved in: {}", results.display());
    Ok(())
}
