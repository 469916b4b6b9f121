use log::warn;
use ndarray::Array2;
use serde::Serialize;

use crate::algebra::{combine, describe_unmapped, normalize};
use crate::config::SubsidenceYear;
use crate::error::Result;
use crate::gdal_ext;
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{fill_extrapolate, open_source, read_layer, read_on_grid, write_layer, Layer, PixelType};
use crate::record::{write_csv, LogRecord};
use crate::stages::report_failures;
use crate::tile::{Bounds, TileId};

/// Search distance, in pixels, of the nodata extrapolation.
pub const FILL_DISTANCE_PX: f64 = 50.0;

#[derive(Debug, Serialize)]
struct ClipRecord {
    tile_id: TileId,
    raster_created: bool,
}

impl LogRecord for ClipRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "raster_created"];
}

/// `gdal_translate` arguments cropping to `bounds`.
pub fn projwin_args(bounds: &Bounds) -> Vec<String> {
    vec![
        "-projwin".to_string(),
        bounds.min_x.to_string(),
        bounds.max_y.to_string(),
        bounds.max_x.to_string(),
        bounds.min_y.to_string(),
        "-co".to_string(),
        "COMPRESS=LZW".to_string(),
    ]
}

/// `((N10 + N40) / 200 + max(N10, N40) / 100) / 2` with both scores in
/// `[0, 100]`.
pub fn subsidence_score(n10: &Array2<f32>, n40: &Array2<f32>) -> Result<Array2<f32>> {
    combine([n10, n40], |[a, b]| ((a + b) / 200.0 + a.max(b) / 100.0) / 2.0)
}

pub fn clip(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Subsidence)?;
    let tiles = layout.discover_tiles(0)?;

    for year in SubsidenceYear::ALL {
        let source = config.subsidence_source(year);
        let run = pipeline.for_each_tile(&tiles, |tile| {
            let dst = layout.raster(StageDir::Subsidence, prefix::CLI, tile, Some(year.as_str()));
            let created = pipeline
                .tile_bounds(tile, 0)
                .and_then(|bounds| {
                    gdal_ext::translate(&open_source(source)?, &dst, &projwin_args(&bounds))
                })
                .map(|_| ());
            if let Err(e) = &created {
                warn!("Failed processing {tile}: {e}");
            }
            Ok(ClipRecord {
                tile_id: *tile,
                raster_created: created.is_ok(),
            })
        })?;
        report_failures("subsidence-clip", &run.failures);
        let records: Vec<ClipRecord> = run.values().collect();
        write_csv(
            &out_dir.join(format!("clipping_log_{}.csv", year.as_str())),
            &records,
        )?;
    }
    delete_aux_files(&out_dir);
    Ok(())
}

/// Extrapolated and scored subsidence class of one year, 0–100.
fn scored(layer: &Layer, year: SubsidenceYear, pipeline: &Pipeline, tile: &TileId) -> Result<Array2<f32>> {
    let filled = fill_extrapolate(layer, FILL_DISTANCE_PX)?;
    let table = pipeline.config().subsidence_multipliers(year);
    let (scores, unmapped) = normalize(&filled.data, table, 1.0);
    if !unmapped.is_empty() {
        warn!(
            "Tile {tile}: {} subsidence classes scored 0: {}",
            year.as_str(),
            describe_unmapped(&unmapped)
        );
    }
    Ok(scores)
}

pub fn run(pipeline: &Pipeline) -> Result<()> {
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Subsidence)?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let cli = |year: SubsidenceYear| {
            layout.raster(StageDir::Subsidence, prefix::CLI, tile, Some(year.as_str()))
        };
        let c10 = read_layer(&cli(SubsidenceYear::Y2010))?;
        let c40 = read_on_grid(&cli(SubsidenceYear::Y2040), &c10.grid)?;
        let n10 = scored(&c10, SubsidenceYear::Y2010, pipeline, tile)?;
        let n40 = scored(&c40, SubsidenceYear::Y2040, pipeline, tile)?;
        let sub = c10
            .with_data(subsidence_score(&n10, &n40)?)?
            .warp_onto(&pipeline.tile_grid(tile)?)?;
        write_layer(
            &layout.raster(StageDir::Subsidence, prefix::SUB, tile, None),
            &sub,
            PixelType::Float32,
        )?;
        pipeline.consume(&[cli(SubsidenceYear::Y2010), cli(SubsidenceYear::Y2040)]);
        Ok(())
    })?;
    report_failures("subsidence", &run.failures);
    delete_aux_files(&out_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_json;
    use crate::config::Config;
    use crate::raster::Grid;
    use crate::vector::{bbox_geometry, write_features, VectorFeature};
    use approx::assert_relative_eq;
    use ndarray::arr2;
    use tempfile::TempDir;

    #[test]
    fn test_projwin_order() {
        let args = projwin_args(&Bounds::new(104.0, 9.0, 105.0, 10.0));
        assert_eq!(args[..5], ["-projwin", "104", "10", "105", "9"]);
    }

    #[test]
    fn test_subsidence_score() {
        let n10 = arr2(&[[100.0, 0.0, 60.0, f32::NAN]]);
        let n40 = arr2(&[[50.0, 0.0, 60.0, 10.0]]);
        let sub = subsidence_score(&n10, &n40).unwrap();
        assert_relative_eq!(sub[[0, 0]], 0.875);
        assert_eq!(sub[[0, 1]], 0.0);
        assert_relative_eq!(sub[[0, 2]], 0.6);
        assert!(sub[[0, 3]].is_nan());
    }

    #[test]
    fn test_scores_stay_in_unit_range() {
        let values = [0.0f32, 20.0, 50.0, 100.0];
        for a in values {
            for b in values {
                let s = subsidence_score(&arr2(&[[a]]), &arr2(&[[b]])).unwrap()[[0, 0]];
                assert!((0.0..=1.0).contains(&s));
            }
        }
    }

    #[test]
    fn test_clip_and_score_tile() {
        let tmp = TempDir::new().unwrap();
        let config = Config::from_json(&sample_json(tmp.path()).to_string()).unwrap();
        let pipeline = Pipeline::new(config, 1);
        let layout = pipeline.layout();
        let tile: TileId = "N09E104".parse().unwrap();
        write_features(
            &layout.tile_vector(&tile, 0),
            &[VectorFeature::new(
                bbox_geometry(&Bounds::new(104.0, 9.0, 105.0, 10.0)).unwrap(),
            )],
        )
        .unwrap();
        // Class rasters cover a wider area than the tile.
        let world = Grid::from_bounds(&Bounds::new(103.0, 8.0, 106.0, 11.0), 0.25).unwrap();
        let classes = Layer::filled(world, 1.0);
        write_layer(&tmp.path().join("sub_2010.tif"), &classes, PixelType::Float32).unwrap();
        write_layer(&tmp.path().join("sub_2040.tif"), &classes, PixelType::Float32).unwrap();

        clip(&pipeline).unwrap();
        let cli = layout.raster(StageDir::Subsidence, prefix::CLI, &tile, Some("2010"));
        assert_eq!(read_layer(&cli).unwrap().grid.shape(), (4, 4));
        let log = std::fs::read_to_string(layout.dir(StageDir::Subsidence).join("clipping_log_2040.csv"))
            .unwrap();
        assert_eq!(log, "tile_id,raster_created\nN09E104,true\n");

        run(&pipeline).unwrap();
        let sub = read_layer(&layout.raster(StageDir::Subsidence, prefix::SUB, &tile, None)).unwrap();
        // Class 1 scores 100 in both years.
        assert!(sub.data.iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(!cli.exists());
    }
}
