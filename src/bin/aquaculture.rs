use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use mangrove_potential::aquaculture::{self, AquacultureRun};
use mangrove_potential::tile::TileId;

#[derive(Parser, Debug)]
#[command(name = "aquaculture")]
#[command(about = "Restrict aquaculture pond rasters to the coastal zone")]
struct Args {
    /// Folder of aquaculture_<year>_<lon>_<lat>.tif rasters
    #[arg(long, value_name = "DIR")]
    rasters: PathBuf,

    /// Global 1 degree grid with lat/lon fields
    #[arg(long, value_name = "FILE")]
    grid: PathBuf,

    /// River centre lines
    #[arg(long, value_name = "FILE")]
    rivers: PathBuf,

    /// Coastline lines
    #[arg(long, value_name = "FILE")]
    coastline: PathBuf,

    /// Folder for the per-tile buffer polygons
    #[arg(long, value_name = "DIR", default_value = "data_in_tiles")]
    vectors: PathBuf,

    /// Folder for the masked rasters and their VRT
    #[arg(short, long, value_name = "DIR", default_value = "masked_compressed")]
    output: PathBuf,

    /// Year in the raster file names
    #[arg(long, default_value_t = 2022)]
    year: i32,

    /// Only process these tiles (repeatable), e.g. --tile N09E104
    #[arg(long = "tile", value_name = "ID")]
    tiles: Vec<TileId>,

    /// Tiles processed at the same time
    #[arg(short, long, value_name = "N", default_value_t = 1)]
    threads: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let job = AquacultureRun {
        rasters: args.rasters,
        grid: args.grid,
        rivers: args.rivers,
        coastline: args.coastline,
        vectors: args.vectors,
        output: args.output,
        year: args.year,
        tiles: (!args.tiles.is_empty()).then(|| args.tiles.into_iter().collect::<BTreeSet<_>>()),
        threads: args.threads,
    };
    let vrts = aquaculture::run(&job)
        .with_context(|| format!("masking ponds in {}", job.rasters.display()))?;
    for vrt in vrts {
        info!("VRT saved: {}", vrt.display());
    }
    Ok(())
}
