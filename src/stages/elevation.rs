//! Elevation, intertidal zones and accommodation space.

use log::warn;
use ndarray::Array2;

use crate::algebra::{combine, describe_unmapped, indicator, normalize};
use crate::error::Result;
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{
    open_source, read_layer, read_on_grid, warp_to_grid, write_layer, Layer, PixelType,
};
use crate::stages::report_failures;

/// `DEM + PON / 10000`: pond pixels are lifted just above the DEM.
pub fn lift_ponds(dem: &Array2<f32>, pon: &Array2<f32>) -> Result<Array2<f32>> {
    combine([dem, pon], |[dem, pon]| dem + pon / 10_000.0)
}

/// Zones of one tile relative to the tide: `(MSL, HAT, BEY)`.
pub struct Intertidal {
    pub msl: Array2<f32>,
    pub hat: Array2<f32>,
    pub bey: Array2<f32>,
}

/// With `e = ELE·100 − mangrove_correction` and `t = GTS·100` (cm):
/// MSL is `ELE > 0 ∧ e ≤ t`, HAT is `e > t` and BEY is `t < e ≤ t + slr`.
pub fn intertidal_zones(
    ele: &Array2<f32>,
    gts: &Array2<f32>,
    mangrove_correction: f64,
    slr_correction: f64,
) -> Result<Intertidal> {
    let correction = mangrove_correction as f32;
    let slr = slr_correction as f32;
    let level = move |ele: f32| ele * 100.0 - correction;
    Ok(Intertidal {
        msl: combine([ele, gts], |[ele, gts]| {
            indicator(ele > 0.0 && level(ele) <= gts * 100.0)
        })?,
        hat: combine([ele, gts], |[ele, gts]| indicator(level(ele) > gts * 100.0))?,
        bey: combine([ele, gts], |[ele, gts]| {
            let (e, t) = (level(ele), gts * 100.0);
            indicator(e > t && e <= t + slr)
        })?,
    })
}

/// `MSL·2 + BEY`
pub fn uncertainty(msl: &Array2<f32>, bey: &Array2<f32>) -> Result<Array2<f32>> {
    combine([msl, bey], |[msl, bey]| msl * 2.0 + bey)
}

pub fn elevation(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Elevation)?;
    let pond_dir = config.clark_files.join(layout.country());
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let grid = pipeline.tile_grid(tile)?;
        let dem = warp_to_grid(&open_source(&config.deltadtm_vrt)?, &grid)?.fill_nodata(0.0);
        let pon_path = pond_dir.join(format!("{}_{tile}.tif", prefix::PON));
        let pon = read_on_grid(&pon_path, &grid)?;
        let ele = dem.with_data(lift_ponds(&dem.data, &pon.data)?)?;
        write_layer(
            &layout.raster(StageDir::Elevation, prefix::ELE, tile, None),
            &ele,
            PixelType::Float32,
        )
    })?;
    report_failures("elevation", &run.failures);
    delete_aux_files(&pond_dir);
    delete_aux_files(&out_dir);
    Ok(())
}

pub fn intertidal(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Accommodation)?;
    let tiles = layout.discover_layer(StageDir::Tides, prefix::GTS)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let ele = read_layer(&layout.raster(StageDir::Elevation, prefix::ELE, tile, None))?;
        let gts = read_on_grid(
            &layout.raster(StageDir::Tides, prefix::GTS, tile, None),
            &ele.grid,
        )?;
        let zones = intertidal_zones(
            &ele.data,
            &gts.data,
            config.deltadtm_mangrove_correction,
            config.intertidal_slr_correction,
        )?;
        for (pfx, data) in [
            (prefix::MSL, zones.msl),
            (prefix::HAT, zones.hat),
            (prefix::BEY, zones.bey),
        ] {
            let layer = ele.with_data(data)?.fill_nodata(0.0);
            write_layer(
                &layout.raster(StageDir::Accommodation, pfx, tile, None),
                &layer,
                PixelType::Float32,
            )?;
        }
        Ok(())
    })?;
    report_failures("intertidal", &run.failures);
    for dir in [
        out_dir,
        layout.dir(StageDir::Elevation),
        layout.dir(StageDir::Tides),
    ] {
        delete_aux_files(&dir);
    }
    Ok(())
}

pub fn accommodation(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let acc_dir = layout.ensure(StageDir::Accommodation)?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let zone = |pfx: &str| layout.raster(StageDir::Accommodation, pfx, tile, None);
        let msl = read_layer(&zone(prefix::MSL))?;
        let bey = read_on_grid(&zone(prefix::BEY), &msl.grid)?;
        let unc = uncertainty(&msl.data, &bey.data)?;
        let (acc, unmapped) = normalize(&unc, &config.accommodation_multipliers, 100.0);
        if !unmapped.is_empty() {
            warn!(
                "Tile {tile}: accommodation classes scored 0: {}",
                describe_unmapped(&unmapped)
            );
        }
        write_layer(&zone(prefix::ACC), &Layer::new(msl.grid, acc)?, PixelType::Float32)?;
        pipeline.consume(&[zone(prefix::BEY), zone(prefix::HAT), zone(prefix::MSL)]);
        Ok(())
    })?;
    report_failures("accommodation", &run.failures);
    delete_aux_files(&acc_dir);
    Ok(())
}
