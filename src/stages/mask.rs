//! Empty-areas template and the no-value-areas mask.
//!
//! `EMA` is a zero raster on the tile grid, copied later as the placeholder
//! for any missing composite input. `NVA` marks pixels that can never be
//! restored: existing mangroves, built-up land and permanent water.

use ndarray::Array2;
use serde::Serialize;

use crate::algebra::{combine, indicator};
use crate::error::Result;
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{read_on_grid_or_zero, write_layer, Layer, PixelType};
use crate::record::{write_csv, LogRecord};
use crate::stages::report_failures;
use crate::tile::TileId;

#[derive(Debug, Serialize)]
struct MaskRecord {
    tile_id: TileId,
    gmw_exists: bool,
    lan_exists: bool,
    wat_exists: bool,
}

impl LogRecord for MaskRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "gmw_exists", "lan_exists", "wat_exists"];
}

/// `(GMW + LAN + WAT) < 0`; the masks are never negative so this is zero
/// wherever every input is defined.
pub fn empty_areas(gmw: &Array2<f32>, lan: &Array2<f32>, wat: &Array2<f32>) -> Result<Array2<f32>> {
    combine([gmw, lan, wat], |[g, l, w]| indicator(g + l + w < 0.0))
}

/// `GMW = 1 ∨ LAN = 1 ∨ WAT = 1`
pub fn no_value_areas(gmw: &Array2<f32>, lan: &Array2<f32>, wat: &Array2<f32>) -> Result<Array2<f32>> {
    combine([gmw, lan, wat], |[g, l, w]| {
        indicator(g == 1.0 || l == 1.0 || w == 1.0)
    })
}

pub fn run(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Mask)?;
    let tiles = layout.discover_tiles(0)?;
    let last_year = config.gmw_last_year.to_string();

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let grid = pipeline.tile_grid(tile)?;
        let (gmw, gmw_exists) = read_on_grid_or_zero(
            &layout.raster(StageDir::Gmw, prefix::GMW, tile, Some(&last_year)),
            &grid,
        )?;
        let (lan, lan_exists) =
            read_on_grid_or_zero(&layout.raster(StageDir::Landcover, prefix::LAN, tile, None), &grid)?;
        let (wat, wat_exists) = read_on_grid_or_zero(
            &layout.raster(StageDir::PermanentWater, prefix::WAT, tile, None),
            &grid,
        )?;
        let [gmw, lan, wat] = [gmw, lan, wat].map(|layer| layer.fill_nodata(0.0).data);

        let ema = Layer::new(grid.clone(), empty_areas(&gmw, &lan, &wat)?)?.fill_nodata(0.0);
        write_layer(
            &layout.raster(StageDir::Mask, prefix::EMA, tile, None),
            &ema,
            PixelType::Float32,
        )?;
        let nva = Layer::new(grid, no_value_areas(&gmw, &lan, &wat)?)?;
        write_layer(
            &layout.raster(StageDir::Mask, prefix::NVA, tile, None),
            &nva,
            PixelType::Byte,
        )?;
        Ok(MaskRecord {
            tile_id: *tile,
            gmw_exists,
            lan_exists,
            wat_exists,
        })
    })?;
    report_failures("empty-areas", &run.failures);
    let records: Vec<MaskRecord> = run.values().collect();
    write_csv(&out_dir.join("EMA.csv"), &records)?;
    delete_aux_files(&out_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_empty_areas_are_zero() {
        let gmw = arr2(&[[1.0, 0.0, 0.0, 0.0]]);
        let lan = arr2(&[[0.0, 1.0, 0.0, 0.0]]);
        let wat = arr2(&[[0.0, 0.0, 1.0, 0.0]]);
        assert_eq!(empty_areas(&gmw, &lan, &wat).unwrap(), Array2::<f32>::zeros((1, 4)));
    }

    #[test]
    fn test_no_value_areas_union() {
        let gmw = arr2(&[[1.0, 0.0, 0.0, 0.0]]);
        let lan = arr2(&[[0.0, 1.0, 0.0, 0.0]]);
        let wat = arr2(&[[0.0, 0.0, 1.0, 0.0]]);
        assert_eq!(
            no_value_areas(&gmw, &lan, &wat).unwrap(),
            arr2(&[[1.0, 1.0, 1.0, 0.0]])
        );
    }
}
