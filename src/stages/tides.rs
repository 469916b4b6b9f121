//! Highest astronomical tide per pixel from the GTSM station points.
//!
//! Each pixel takes the `HAT` value of the nearest station, which is the
//! rasterised Voronoi partition of the stations.

use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use log::debug;
use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::layout::{delete_aux_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{write_layer, Grid, Layer, PixelType};
use crate::stages::report_failures;
use crate::vector::{self, VectorFeature};

/// Attribute holding the tide level.
pub const HAT_FIELD: &str = "HAT";

/// Buffer of the tile vector that selects the stations.
pub const STATION_BUFFER_M: u32 = 200_000;

/// Station coordinates and tide levels; features without a numeric level
/// are skipped.
pub fn stations(features: &[VectorFeature]) -> Vec<([f64; 2], f32)> {
    features
        .iter()
        .filter_map(|f| {
            let hat = f.number(HAT_FIELD)?;
            if !hat.is_finite() {
                return None;
            }
            let b = vector::envelope(&f.geometry);
            Some(([(b.min_x + b.max_x) / 2.0, (b.min_y + b.max_y) / 2.0], hat as f32))
        })
        .collect()
}

/// Nearest-station value at every pixel centre of `grid`.
pub fn nearest_station_surface(stations: &[([f64; 2], f32)], grid: &Grid) -> Result<Array2<f32>> {
    let mut tree = KdTree::with_capacity(2, 64);
    for (point, hat) in stations {
        tree.add(*point, *hat)?;
    }
    let (rows, cols) = grid.shape();
    let values = (0..rows)
        .into_par_iter()
        .map(|row| -> Result<Vec<f32>> {
            (0..cols)
                .map(|col| -> Result<f32> {
                    let (x, y) = grid.cell_center(row, col);
                    let nearest = tree.nearest(&[x, y], 1, &squared_euclidean)?;
                    Ok(nearest.first().map(|(_, hat)| **hat).unwrap_or(f32::NAN))
                })
                .collect::<Result<Vec<f32>>>()
        })
        .collect::<Result<Vec<Vec<f32>>>>()?;
    Ok(Array2::from_shape_vec(
        (rows, cols),
        values.into_iter().flatten().collect(),
    )?)
}

pub fn run(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let out_dir = layout.ensure(StageDir::Tides)?;
    let tiles = layout.discover_tiles(STATION_BUFFER_M)?;

    let run = pipeline.for_each_tile(&tiles, |tile| {
        let area = vector::read_geometry(&layout.tile_vector(tile, STATION_BUFFER_M))?;
        let candidates = vector::read_features(&config.gtsm_points, Some(&vector::envelope(&area)))?;
        let inside: Vec<VectorFeature> = candidates
            .into_iter()
            .filter(|f| f.geometry.intersects(&area))
            .collect();
        let stations = stations(&inside);
        debug!("Tile {tile}: {} tide stations", stations.len());
        if stations.is_empty() {
            return Err(PipelineError::EmptyInput(config.gtsm_points.clone()));
        }
        let grid = pipeline.tile_grid(tile)?;
        let data = nearest_station_surface(&stations, &grid)?;
        write_layer(
            &layout.raster(StageDir::Tides, prefix::GTS, tile, None),
            &Layer::new(grid, data)?,
            PixelType::Float32,
        )
    })?;
    report_failures("tides", &run.failures);
    delete_aux_files(&out_dir);
    Ok(())
}
