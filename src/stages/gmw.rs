//! Global Mangrove Watch layers: yearly extents, recruitment history and
//! seed dispersal around present mangroves.

use log::{info, warn};
use ndarray::Array2;

use crate::algebra::{describe_unmapped, latest_presence_year, normalize, sum};
use crate::error::Result;
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::morphology::{binary_dilation, Disk};
use crate::pipeline::Pipeline;
use crate::raster::{
    open_source, read_layer, read_on_grid, warp_to_bounds, write_layer, Layer, PixelType,
};
use crate::stages::report_failures;

/// Buffer of the tile vector used for the seed-dispersal window.
pub const DISPERSAL_BUFFER_M: u32 = 10_000;

/// Yearly extents warped to each tile at native resolution, nodata as 0.
pub fn fill(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let gmw_dir = layout.ensure(StageDir::Gmw)?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let bounds = pipeline.tile_bounds(tile, 0)?;
        for &year in &config.gmw_years {
            let source = open_source(&layout.gmw_vrt(year))?;
            let extent = warp_to_bounds(&source, &bounds, None)?.fill_nodata(0.0);
            let year = year.to_string();
            write_layer(
                &layout.raster(StageDir::Gmw, prefix::GMW, tile, Some(&year)),
                &extent,
                PixelType::Byte,
            )?;
        }
        Ok(())
    })?;
    report_failures("gmw", &run.failures);
    delete_aux_files(&gmw_dir);
    Ok(())
}

/// `recruitment_gmw_multipliers(EXP) / 100`, EXP being the last listed year
/// each pixel was mangrove.
pub fn recruitment(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let gmw_dir = layout.ensure(StageDir::Gmw)?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let paths: Vec<(i32, _)> = config
            .recruitment_gmw_years
            .iter()
            .map(|&year| {
                let suffix = year.to_string();
                (year, layout.raster(StageDir::Gmw, prefix::GMW, tile, Some(&suffix)))
            })
            .collect();
        let Some((_, first)) = paths.first() else {
            return Ok(());
        };
        let base = read_layer(first)?;
        let mut layers = Vec::with_capacity(paths.len());
        for (year, path) in &paths {
            layers.push((*year, read_on_grid(path, &base.grid)?.data));
        }
        let refs: Vec<(i32, &Array2<f32>)> = layers.iter().map(|(y, a)| (*y, a)).collect();
        let exp = latest_presence_year(&refs)?;
        let (rec, unmapped) = normalize(&exp, &config.recruitment_gmw_multipliers, 100.0);
        if !unmapped.is_empty() {
            warn!(
                "Tile {tile}: recruitment years scored 0: {}",
                describe_unmapped(&unmapped)
            );
        }
        write_layer(
            &layout.raster(StageDir::Gmw, prefix::REC, tile, None),
            &base.with_data(rec)?,
            PixelType::Float32,
        )?;
        let consumed: Vec<_> = paths
            .iter()
            .filter(|(year, _)| *year != config.gmw_last_year)
            .map(|(_, path)| path.clone())
            .collect();
        pipeline.consume(&consumed);
        Ok(())
    })?;
    report_failures("recruitment", &run.failures);
    delete_aux_files(&gmw_dir);
    Ok(())
}

/// Last-year extent on the 10 km window at the seed-dispersal resolution.
pub fn resample(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let gmw_dir = layout.ensure(StageDir::Gmw)?;
    let tiles = layout.discover_tiles(DISPERSAL_BUFFER_M)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let bounds = pipeline.tile_bounds(tile, DISPERSAL_BUFFER_M)?;
        let source = open_source(&layout.gmw_vrt(config.gmw_last_year))?;
        let extent = warp_to_bounds(
            &source,
            &bounds,
            Some(config.target_res_deg_for_seed_dispersal),
        )?
        .fill_nodata(0.0);
        write_layer(
            &layout.raster(StageDir::Gmw, prefix::REP, tile, None),
            &extent,
            PixelType::Byte,
        )
    })?;
    report_failures("gmw-resample", &run.failures);
    delete_aux_files(&gmw_dir);
    Ok(())
}

/// One binary dilation of the present extent per proximity distance.
pub fn dilations(extent: &Array2<f32>, distances: &[u32], res_deg: f64) -> Vec<(u32, Array2<f32>)> {
    distances
        .iter()
        .map(|&d| {
            let disk = Disk::from_distance(f64::from(d), res_deg);
            (d, binary_dilation(extent, &disk))
        })
        .collect()
}

pub fn proximity(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    layout.ensure(StageDir::Gmw)?;
    let tiles = layout.discover_tiles(0)?;
    let distances = &config.proximity_distances;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let dil = |d: u32| layout.raster(StageDir::Gmw, prefix::DIL, tile, Some(&d.to_string()));
        if let Some(&last) = distances.last() {
            if dil(last).exists() {
                info!("Skipping {tile}, {} already exists.", dil(last).display());
                return Ok(());
            }
        }
        let rep_path = layout.raster(StageDir::Gmw, prefix::REP, tile, None);
        let rep = read_layer(&rep_path)?;
        for (d, data) in dilations(&rep.data, distances, config.target_res_deg_for_seed_dispersal) {
            write_layer(&dil(d), &rep.with_data(data)?, PixelType::Byte)?;
        }
        pipeline.consume(&[rep_path]);
        Ok(())
    })?;
    report_failures("gmw-proximity", &run.failures);
    Ok(())
}

/// `proximity_gmw_multipliers(Σ DIL_d) / 100` on the tile grid.
pub fn seed_dispersal(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let gmw_dir = layout.ensure(StageDir::Gmw)?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let paths: Vec<_> = config
            .proximity_distances
            .iter()
            .map(|d| layout.raster(StageDir::Gmw, prefix::DIL, tile, Some(&d.to_string())))
            .collect();
        let layers = paths
            .iter()
            .map(|p| read_layer(p))
            .collect::<Result<Vec<Layer>>>()?;
        let Some(base) = layers.first() else {
            return Ok(());
        };
        let arrays: Vec<&Array2<f32>> = layers.iter().map(|l| &l.data).collect();
        let add = sum(&arrays)?;
        let (scores, unmapped) = normalize(&add, &config.proximity_gmw_multipliers, 100.0);
        if !unmapped.is_empty() {
            warn!(
                "Tile {tile}: dilation counts scored 0: {}",
                describe_unmapped(&unmapped)
            );
        }
        let see = base.with_data(scores)?.warp_onto(&pipeline.tile_grid(tile)?)?;
        write_layer(
            &layout.raster(StageDir::Gmw, prefix::SEE, tile, None),
            &see,
            PixelType::Float32,
        )?;
        pipeline.consume(&paths);
        Ok(())
    })?;
    report_failures("seed-dispersal", &run.failures);
    delete_aux_files(&gmw_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dilations_are_nested() {
        let mut extent = Array2::<f32>::zeros((41, 41));
        extent[[20, 20]] = 1.0;
        // 0.001° pixels are 111.32 m wide.
        let out = dilations(&extent, &[500, 1000, 2000], 0.001);
        assert_eq!(out.len(), 3);
        let counts: Vec<f32> = out.iter().map(|(_, a)| a.sum()).collect();
        assert!(counts[0] < counts[1] && counts[1] < counts[2]);
        for pair in out.windows(2) {
            for (inner, outer) in pair[0].1.iter().zip(pair[1].1.iter()) {
                assert!(inner <= outer);
            }
        }
        // 500 m is 4.49 px: (0, 4) is inside, (0, 5) is not.
        assert_eq!(out[0].1[[20, 24]], 1.0);
        assert_eq!(out[0].1[[20, 25]], 0.0);
    }

    #[test]
    fn test_sum_of_dilations_counts_rings() {
        let mut extent = Array2::<f32>::zeros((21, 21));
        extent[[10, 10]] = 1.0;
        let out = dilations(&extent, &[200, 500], 0.001);
        let arrays: Vec<&Array2<f32>> = out.iter().map(|(_, a)| a).collect();
        let add = sum(&arrays).unwrap();
        assert_eq!(add[[10, 10]], 2.0);
        assert_eq!(add[[10, 13]], 1.0);
        assert_eq!(add[[0, 0]], 0.0);
    }
}
