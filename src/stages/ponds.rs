use std::path::Path;

use log::warn;

use crate::algebra::{describe_unmapped, normalize};
use crate::config::Multipliers;
use crate::error::Result;
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{open_source, warp_to_grid, write_layer, Grid, Layer, PixelType};
use crate::stages::report_failures;
use crate::tile::TileId;

/// Scores classification classes on `grid`: `multipliers(class) / 100`,
/// nodata filled with 0.
pub fn pond_scores(source: &Path, grid: &Grid, multipliers: &Multipliers, tile: &TileId) -> Result<Layer> {
    let classes = warp_to_grid(&open_source(source)?, grid)?;
    let (scores, unmapped) = normalize(&classes.data, multipliers, 100.0);
    if !unmapped.is_empty() {
        warn!(
            "Tile {tile}: classes without a multiplier scored 0: {}",
            describe_unmapped(&unmapped)
        );
    }
    Ok(classes.with_data(scores)?.fill_nodata(0.0))
}

pub fn run(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Clark)?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let grid = pipeline.tile_grid(tile)?;
        let pon = pond_scores(&config.clark_vrt, &grid, &config.clark_multipliers, tile)?;
        write_layer(
            &layout.raster(StageDir::Clark, prefix::PON, tile, None),
            &pon,
            PixelType::Float32,
        )
    })?;
    report_failures("ponds", &run.failures);
    delete_aux_files(&out_dir);
    Ok(())
}
