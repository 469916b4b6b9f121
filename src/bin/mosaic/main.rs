use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use mangrove_potential::mosaic::{self, MosaicFilter};
use mangrove_potential::tile::TileId;

#[derive(Parser, Debug)]
#[command(name = "mosaic")]
#[command(about = "Mosaic per-tile layers by prefix or extract areas of interest")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write one `<PREFIX>.vrt` per layer prefix found under ROOT
    ByPrefix {
        /// Directory searched recursively for `*.tif`
        root: PathBuf,

        /// Where the VRTs are written (default: ROOT)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Copy selected layers into `ROOT/areas_of_interest` and zip the folder
    Extract {
        root: PathBuf,

        /// Destination folder name under ROOT
        #[arg(long, default_value = "areas_of_interest")]
        folder: String,

        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(clap::Args, Debug)]
struct FilterArgs {
    /// Keep only these tile ids
    #[arg(long = "tile", value_name = "ID")]
    tiles: Vec<String>,

    /// Leave out these prefixes
    #[arg(long, value_name = "PFX")]
    exclude: Vec<String>,

    /// Restrict a prefix to one year, as `PFX=YEAR`
    #[arg(long = "year", value_name = "PFX=YEAR")]
    years: Vec<String>,
}

impl FilterArgs {
    fn build(&self) -> Result<MosaicFilter> {
        let tiles = if self.tiles.is_empty() {
            None
        } else {
            Some(
                self.tiles
                    .iter()
                    .map(|id| id.parse::<TileId>())
                    .collect::<Result<BTreeSet<_>, _>>()?,
            )
        };
        let mut year_only = BTreeMap::new();
        for entry in &self.years {
            let Some((prefix, year)) = entry.split_once('=') else {
                bail!("expected PFX=YEAR, got {entry:?}");
            };
            let year: i32 = year
                .parse()
                .with_context(|| format!("year in {entry:?}"))?;
            year_only.insert(prefix.to_string(), year);
        }
        Ok(MosaicFilter {
            tiles,
            exclude: self.exclude.iter().cloned().collect(),
            year_only,
        })
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match args.command {
        Command::ByPrefix {
            root,
            output,
            filter,
        } => {
            let out_dir = output.unwrap_or_else(|| root.clone());
            let written = mosaic::build_prefix_vrts(&root, &out_dir, &filter.build()?)
                .with_context(|| format!("mosaicking {}", root.display()))?;
            info!("{} VRT(s) written", written.len());
        }
        Command::Extract {
            root,
            folder,
            filter,
        } => {
            let dest = root.join(&folder);
            let copied = mosaic::extract(&root, &dest, &filter.build()?)
                .with_context(|| format!("extracting into {}", dest.display()))?;
            info!("{} file(s) copied", copied.len());
            mosaic::zip_dir(&dest, &root.join(format!("{folder}.zip")))?;
        }
    }
    Ok(())
}
