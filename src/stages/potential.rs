//! Mangrove potential composite (`MPM`).

use log::warn;
use ndarray::Array2;
use serde::Serialize;

use crate::algebra::combine;
use crate::error::Result;
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{copy_placeholder, read_on_grid, write_layer, Layer, PixelType};
use crate::record::{write_csv, LogRecord};
use crate::stages::report_failures;
use crate::tile::TileId;

/// Composite inputs in formula order.
pub const INPUTS: [(StageDir, &str); 8] = [
    (StageDir::Mask, prefix::NVA),
    (StageDir::Clark, prefix::PON),
    (StageDir::Accommodation, prefix::ACC),
    (StageDir::Gmw, prefix::REC),
    (StageDir::Gmw, prefix::SEE),
    (StageDir::Rivers, prefix::PRR),
    (StageDir::Coastline, prefix::PRC),
    (StageDir::Subsidence, prefix::SUB),
];

#[derive(Debug, Serialize)]
struct MissingRecord {
    tile_id: TileId,
    missing_file: String,
}

impl LogRecord for MissingRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "missing_file"];
}

/// `NVA = 0 ? (PON + ACC + REC + SEE + max(PRR, PRC) + SUB) / 6 : 0`
pub fn potential_score(inputs: [&Array2<f32>; 8]) -> Result<Array2<f32>> {
    combine(inputs, |[nva, pon, acc, rec, see, prr, prc, sub]| {
        if nva == 0.0 {
            (pon + acc + rec + see + prr.max(prc) + sub) / 6.0
        } else {
            0.0
        }
    })
}

fn potential_tile(pipeline: &Pipeline, tile: &TileId) -> Result<Vec<MissingRecord>> {
    let layout = pipeline.layout();
    let empty = layout.raster(StageDir::Mask, prefix::EMA, tile, None);
    let paths: Vec<_> = INPUTS
        .iter()
        .map(|(dir, pfx)| layout.raster(*dir, pfx, tile, None))
        .collect();

    let mut missing = Vec::new();
    for path in paths.iter().filter(|p| !p.exists()) {
        warn!("Raster missing for tile {tile}: {}", path.display());
        missing.push(MissingRecord {
            tile_id: *tile,
            missing_file: path.display().to_string(),
        });
        if let Err(e) = copy_placeholder(&empty, path) {
            warn!("Could not copy EMA raster for {}: {e}", path.display());
        }
    }
    if paths.iter().any(|p| !p.exists()) {
        warn!("Missing raster(s) for tile {tile}, skipping.");
        return Ok(missing);
    }

    let grid = pipeline.tile_grid(tile)?;
    let layers = paths
        .iter()
        .map(|p| read_on_grid(p, &grid).map(|layer| layer.data))
        .collect::<Result<Vec<Array2<f32>>>>()?;
    let refs: [&Array2<f32>; 8] = std::array::from_fn(|i| &layers[i]);
    let mpm = Layer::new(grid, potential_score(refs)?)?.fill_nodata(0.0);
    write_layer(
        &layout.raster(StageDir::Potential, prefix::MPM, tile, None),
        &mpm,
        PixelType::Float32,
    )?;
    Ok(missing)
}

pub fn run(pipeline: &Pipeline) -> Result<()> {
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Potential)?;
    let tiles = layout.discover_tiles(0)?;

    let run = pipeline.for_each_tile(&tiles, |tile| potential_tile(pipeline, tile))?;
    report_failures("potential", &run.failures);
    let records: Vec<MissingRecord> = run.values().flatten().collect();
    write_csv(&out_dir.join("MPM.csv"), &records)?;
    delete_aux_files(&out_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_potential_score() {
        let nva = arr2(&[[0.0, 1.0, 0.0]]);
        let ones = Array2::from_elem((1, 3), 1.0f32);
        let half = Array2::from_elem((1, 3), 0.5f32);
        let zero = Array2::zeros((1, 3));
        let mpm = potential_score([&nva, &ones, &ones, &ones, &ones, &half, &ones, &zero]).unwrap();
        assert_relative_eq!(mpm[[0, 0]], 5.0 / 6.0);
        assert_eq!(mpm[[0, 1]], 0.0);
    }

    #[test]
    fn test_potential_stays_in_unit_range() {
        let nva = Array2::zeros((2, 2));
        let full = Array2::from_elem((2, 2), 1.0f32);
        let mpm = potential_score([&nva, &full, &full, &full, &full, &full, &full, &full]).unwrap();
        assert!(mpm.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_nodata_propagates() {
        let mut nva = Array2::zeros((1, 1));
        nva[[0, 0]] = f32::NAN;
        let one = Array2::from_elem((1, 1), 1.0f32);
        let mpm = potential_score([&nva, &one, &one, &one, &one, &one, &one, &one]).unwrap();
        assert!(mpm[[0, 0]].is_nan());
    }
}
