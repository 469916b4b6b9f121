use log::info;
use ndarray::Array2;
use serde::Serialize;

use crate::algebra::indicator;
use crate::error::{PipelineError, Result};
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{open_source, warp_to_grid, write_layer, PixelType};
use crate::record::{write_csv, LogRecord};
use crate::stages::report_failures;
use crate::tile::TileId;

/// WorldCover class for built-up areas.
pub const BUILT_UP_CLASS: f32 = 50.0;

/// One row per tile: whether `LAN` was already there before the run and
/// whether it exists after it.
#[derive(Debug, Serialize)]
struct LandcoverRecord {
    tile_id: TileId,
    already_existed: bool,
    tile_exist: bool,
}

impl LogRecord for LandcoverRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "already_existed", "tile_exist"];
}

/// `1` on built-up pixels, `0` elsewhere including nodata.
pub fn built_up(classes: &Array2<f32>) -> Array2<f32> {
    classes.mapv(|v| indicator(v == BUILT_UP_CLASS))
}

pub fn run(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Landcover)?;
    let source = config
        .landcover_source
        .as_ref()
        .ok_or_else(|| PipelineError::Config("landcover_source is not set".into()))?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let dst = layout.raster(StageDir::Landcover, prefix::LAN, tile, None);
        if dst.exists() {
            info!("Skipping {tile}, {} already exists.", dst.display());
            return Ok(true);
        }
        let classes = warp_to_grid(&open_source(source)?, &pipeline.tile_grid(tile)?)?;
        let mask = classes.with_data(built_up(&classes.data))?;
        write_layer(&dst, &mask, PixelType::Byte)?;
        Ok(false)
    })?;
    report_failures("landcover", &run.failures);
    let mut records: Vec<LandcoverRecord> = run
        .results
        .iter()
        .map(|(tile, already_existed)| LandcoverRecord {
            tile_id: *tile,
            already_existed: *already_existed,
            tile_exist: true,
        })
        .chain(run.failures.iter().map(|(tile, _)| LandcoverRecord {
            tile_id: *tile,
            already_existed: false,
            tile_exist: false,
        }))
        .collect();
    records.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));
    write_csv(&out_dir.join("LAN.csv"), &records)?;
    delete_aux_files(&out_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_json;
    use crate::config::Config;
    use crate::raster::{Grid, Layer};
    use crate::tile::Bounds;
    use crate::vector::{bbox_geometry, write_features, VectorFeature};
    use ndarray::arr2;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_built_up_mask() {
        let classes = arr2(&[[50.0, 10.0], [f32::NAN, 95.0]]);
        assert_eq!(built_up(&classes), arr2(&[[1.0, 0.0], [0.0, 0.0]]));
    }

    #[test]
    fn test_log_lists_every_tile() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("worldcover.tif");
        let mut json = sample_json(tmp.path());
        json["landcover_source"] = source.to_string_lossy().into_owned().into();
        let pipeline = Pipeline::new(Config::from_json(&json.to_string()).unwrap(), 2);
        let layout = pipeline.layout();

        let bounds = Bounds::new(104.0, 9.0, 105.0, 10.0);
        let grid = Grid::from_bounds(&bounds, 0.25).unwrap();
        write_layer(&source, &Layer::filled(grid.clone(), 50.0), PixelType::Float32).unwrap();

        let existing: TileId = "N09E104".parse().unwrap();
        let fresh: TileId = "N10E104".parse().unwrap();
        let broken: TileId = "N11E104".parse().unwrap();
        for (tile, b) in [(existing, bounds), (fresh, Bounds::new(104.0, 10.0, 105.0, 11.0))] {
            write_features(
                &layout.tile_vector(&tile, 0),
                &[VectorFeature::new(bbox_geometry(&b).unwrap())],
            )
            .unwrap();
        }
        write_features(&layout.tile_vector(&broken, 0), &[]).unwrap();
        write_layer(
            &layout.raster(StageDir::Landcover, prefix::LAN, &existing, None),
            &Layer::filled(grid, 0.0),
            PixelType::Byte,
        )
        .unwrap();

        run(&pipeline).unwrap();
        assert!(layout.raster(StageDir::Landcover, prefix::LAN, &fresh, None).exists());
        let log = fs::read_to_string(layout.dir(StageDir::Landcover).join("LAN.csv")).unwrap();
        assert_eq!(
            log,
            "tile_id,already_existed,tile_exist\n\
             N09E104,true,true\n\
             N10E104,false,true\n\
             N11E104,false,false\n"
        );
    }
}
