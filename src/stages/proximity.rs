//! Distance to the coastline and to rivers near the coast.
//!
//! `coastline-rivers` turns the global line datasets into per-tile buffer
//! polygons and masks them against the tide surface; the two proximity
//! stages count how many nested buffers cover each pixel and score the
//! count.

use std::path::{Path, PathBuf};

use gdal::vector::Geometry;
use log::{info, warn};
use ndarray::Array2;
use serde::Serialize;

use crate::algebra::{count_equal, describe_unmapped, normalize};
use crate::config::Multipliers;
use crate::error::Result;
use crate::layout::{delete_aux_files, delete_vector_files, prefix, StageDir};
use crate::pipeline::Pipeline;
use crate::raster::{read_layer, read_on_grid, write_layer, Layer, PixelType};
use crate::record::{write_csv, write_table, LogRecord};
use crate::stages::report_failures;
use crate::tile::TileId;
use crate::vector::{self, MetricProjection, VectorFeature};

/// River attribute holding the channel width in metres.
pub const WIDTH_FIELD: &str = "width_m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineSource {
    Coastline,
    Rivers,
}

/// One `<PFX>_<id>_<buffer>.geojson` product of the clip step.
#[derive(Debug, Clone, Copy)]
struct ClipJob {
    source: LineSource,
    prefix: &'static str,
    buffer_m: u32,
    dir: StageDir,
}

/// One `<PFX>_<id>_<buffer>.tif` mask of the rasterize step.
#[derive(Debug, Clone, Copy)]
struct MaskJob {
    prefix: &'static str,
    buffer_m: u32,
    dir: StageDir,
}

#[derive(Debug, Clone, Serialize)]
struct ClipRecord {
    tile_id: TileId,
    has_features: bool,
}

impl LogRecord for ClipRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "has_features"];
}

#[derive(Debug, Clone, Serialize)]
struct OverlayRecord {
    tile_id: TileId,
    #[serde(rename = "C300_exists")]
    corridor_exists: bool,
    #[serde(rename = "RIV_exists")]
    river_exists: bool,
    #[serde(rename = "OVE_created")]
    overlay_created: bool,
}

impl LogRecord for OverlayRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "C300_exists", "RIV_exists", "OVE_created"];
}

#[derive(Debug, Clone, Serialize)]
struct MaskRecord {
    tile_id: TileId,
    raster_exists: bool,
    vector_exists: bool,
    masked_created: bool,
}

impl LogRecord for MaskRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "raster_exists", "vector_exists", "masked_created"];
}

/// Buffer polygon of the lines near `tile`.
///
/// Lines meeting the tile grown by `buffer_m` are kept; with `river_widths`
/// each one is first widened by its `width_m`. The union is then buffered
/// by `buffer_m` and cut back to the tile. `None` when no line is close
/// enough or the buffer misses the tile.
pub fn buffer_near_tile(
    lines: &[VectorFeature],
    tile: &Geometry,
    buffer_m: u32,
    river_widths: bool,
    projection: &MetricProjection,
) -> Result<Option<Geometry>> {
    let area = projection.buffer(tile, f64::from(buffer_m))?;
    let clipped = vector::clip(lines, &area);
    if clipped.is_empty() {
        return Ok(None);
    }
    let mut parts = Vec::with_capacity(clipped.len());
    for feature in &clipped {
        let width = feature.number(WIDTH_FIELD).unwrap_or(0.0);
        if river_widths && width > 0.0 {
            parts.push(projection.buffer(&feature.geometry, width)?);
        } else {
            parts.push(feature.geometry.clone());
        }
    }
    let Some(merged) = vector::dissolve(&parts) else {
        return Ok(None);
    };
    let buffered = projection.buffer(&merged, f64::from(buffer_m))?;
    Ok(buffered.intersection(tile))
}

/// `1` where the pixel centre is inside the mask and the tide level is
/// positive, `0` elsewhere.
pub fn mask_positive(inside: &Array2<bool>, tides: &Array2<f32>) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(tides.raw_dim());
    ndarray::Zip::from(&mut out)
        .and(inside)
        .and(tides)
        .for_each(|o, &inside, &t| {
            if inside && t > 0.0 {
                *o = 1.0;
            }
        });
    out
}

fn clip_jobs(pipeline: &Pipeline) -> Vec<ClipJob> {
    let config = pipeline.config();
    let mut jobs: Vec<ClipJob> = config
        .coastline_buffers
        .iter()
        .map(|&buffer_m| ClipJob {
            source: LineSource::Coastline,
            prefix: prefix::COA,
            buffer_m,
            dir: StageDir::Coastline,
        })
        .collect();
    jobs.push(ClipJob {
        source: LineSource::Coastline,
        prefix: prefix::COA,
        buffer_m: config.coastline_river_buffer,
        dir: StageDir::Rivers,
    });
    jobs.extend(config.river_buffers.iter().map(|&buffer_m| ClipJob {
        source: LineSource::Rivers,
        prefix: prefix::RIV,
        buffer_m,
        dir: StageDir::Rivers,
    }));
    jobs
}

fn mask_jobs(pipeline: &Pipeline) -> Vec<MaskJob> {
    let config = pipeline.config();
    let coastline = config.coastline_buffers.iter().map(|&buffer_m| MaskJob {
        prefix: prefix::COA,
        buffer_m,
        dir: StageDir::Coastline,
    });
    let rivers = config.river_buffers.iter().map(|&buffer_m| MaskJob {
        prefix: prefix::OVE,
        buffer_m,
        dir: StageDir::Rivers,
    });
    coastline.chain(rivers).collect()
}

/// Lines that may fall within the largest buffer of `jobs` around `tile`.
fn nearby_lines(
    path: &Path,
    tile: &Geometry,
    jobs: &[ClipJob],
    source: LineSource,
    projection: &MetricProjection,
) -> Result<Vec<VectorFeature>> {
    let Some(widest) = jobs
        .iter()
        .filter(|job| job.source == source)
        .map(|job| job.buffer_m)
        .max()
    else {
        return Ok(Vec::new());
    };
    let area = projection.buffer(tile, f64::from(widest))?;
    vector::read_features(path, Some(&vector::envelope(&area)))
}

fn clip_tile(pipeline: &Pipeline, tile: &TileId, jobs: &[ClipJob]) -> Result<Vec<ClipRecord>> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let projection = MetricProjection::new()?;
    let geometry = vector::read_geometry(&layout.tile_vector(tile, 0))?;
    let coastline = nearby_lines(
        &config.coastline_geometries,
        &geometry,
        jobs,
        LineSource::Coastline,
        &projection,
    )?;
    let rivers = nearby_lines(
        &config.rivers_geometries,
        &geometry,
        jobs,
        LineSource::Rivers,
        &projection,
    )?;

    let mut records = Vec::with_capacity(jobs.len());
    for job in jobs {
        let (lines, river_widths) = match job.source {
            LineSource::Coastline => (&coastline, false),
            LineSource::Rivers => (&rivers, true),
        };
        let polygon = buffer_near_tile(lines, &geometry, job.buffer_m, river_widths, &projection)?;
        let has_features = polygon.is_some();
        match polygon {
            Some(polygon) => {
                let out = layout.vector(job.dir, job.prefix, tile, Some(&job.buffer_m.to_string()));
                let features: Vec<VectorFeature> = if polygon.is_empty() {
                    Vec::new()
                } else {
                    vec![VectorFeature::new(polygon)]
                };
                vector::write_features(&out, &features)?;
            }
            None => info!(
                "Tile {tile} has no {}_{} features, skipping save.",
                job.prefix, job.buffer_m
            ),
        }
        records.push(ClipRecord {
            tile_id: *tile,
            has_features,
        });
    }
    Ok(records)
}

fn overlay_tile(pipeline: &Pipeline, tile: &TileId, buffer_m: u32) -> Result<OverlayRecord> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let corridor_path = layout.vector(
        StageDir::Rivers,
        prefix::COA,
        tile,
        Some(&config.coastline_river_buffer.to_string()),
    );
    let buffer = buffer_m.to_string();
    let river_path = layout.vector(StageDir::Rivers, prefix::RIV, tile, Some(&buffer));
    let mut record = OverlayRecord {
        tile_id: *tile,
        corridor_exists: corridor_path.exists(),
        river_exists: river_path.exists(),
        overlay_created: false,
    };

    let Some(rivers) = vector::read_non_empty(&river_path)? else {
        warn!("Tile {tile}: no river polygons at {buffer_m} m, skipping overlay.");
        record.river_exists = false;
        return Ok(record);
    };
    let Some(corridor) = vector::read_non_empty(&corridor_path)? else {
        warn!("Tile {tile}: no coastal corridor, skipping overlay.");
        record.corridor_exists = false;
        return Ok(record);
    };
    let overlay = vector::overlay_intersection(&corridor, &rivers);
    if !overlay.is_empty() {
        vector::write_features(
            &layout.vector(StageDir::Rivers, prefix::OVE, tile, Some(&buffer)),
            &overlay,
        )?;
        record.overlay_created = true;
    }
    Ok(record)
}

fn mask_tile(pipeline: &Pipeline, tile: &TileId, jobs: &[MaskJob]) -> Result<Vec<MaskRecord>> {
    let layout = pipeline.layout();
    let tides_path = layout.raster(StageDir::Tides, prefix::GTS, tile, None);
    let tides: Option<Layer> = if tides_path.exists() {
        Some(read_layer(&tides_path)?)
    } else {
        None
    };

    let mut records = Vec::with_capacity(jobs.len());
    for job in jobs {
        let buffer = job.buffer_m.to_string();
        let vector_path = layout.vector(job.dir, job.prefix, tile, Some(&buffer));
        let mut record = MaskRecord {
            tile_id: *tile,
            raster_exists: tides.is_some(),
            vector_exists: vector_path.exists(),
            masked_created: false,
        };
        let Some(tides) = tides.as_ref() else {
            records.push(record);
            continue;
        };
        if vector::read_non_empty(&vector_path)?.is_none() {
            record.vector_exists = false;
            records.push(record);
            continue;
        }
        let inside = vector::rasterize_mask(&vector_path, &tides.grid)?;
        let mask = tides.with_data(mask_positive(&inside, &tides.data))?;
        write_layer(
            &layout.raster(job.dir, job.prefix, tile, Some(&buffer)),
            &mask,
            PixelType::Byte,
        )?;
        record.masked_created = true;
        records.push(record);
    }
    Ok(records)
}

/// Column `job` of the per-tile record lists.
fn column<R: Clone>(results: &[(TileId, Vec<R>)], job: usize) -> Vec<R> {
    results
        .iter()
        .filter_map(|(_, records)| records.get(job).cloned())
        .collect()
}

pub fn coastline_rivers(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    let coa_dir = layout.ensure(StageDir::Coastline)?;
    let riv_dir = layout.ensure(StageDir::Rivers)?;
    let tiles = layout.discover_tiles(0)?;

    let clips = clip_jobs(pipeline);
    let run = pipeline.for_each_tile(&tiles, |tile| clip_tile(pipeline, tile, &clips))?;
    report_failures("coastline-rivers clip", &run.failures);
    for (i, job) in clips.iter().enumerate() {
        let log = layout
            .dir(job.dir)
            .join(format!("{}_{}.csv", job.prefix, job.buffer_m));
        write_csv(&log, &column(&run.results, i))?;
    }

    for &buffer_m in &config.river_buffers {
        let run = pipeline.for_each_tile(&tiles, |tile| overlay_tile(pipeline, tile, buffer_m))?;
        report_failures("coastline-rivers overlay", &run.failures);
        let records: Vec<OverlayRecord> = run.values().collect();
        write_csv(&riv_dir.join(format!("{}_{buffer_m}.csv", prefix::OVE)), &records)?;
    }

    let masks = mask_jobs(pipeline);
    let run = pipeline.for_each_tile(&tiles, |tile| mask_tile(pipeline, tile, &masks))?;
    report_failures("coastline-rivers rasterize", &run.failures);
    for (i, job) in masks.iter().enumerate() {
        let log = layout
            .dir(job.dir)
            .join(format!("RAS_{}_{}.csv", job.prefix, job.buffer_m));
        write_csv(&log, &column(&run.results, i))?;
    }

    delete_aux_files(&layout.dir(StageDir::Tides));
    if !config.keep_intermediates {
        delete_vector_files(&riv_dir);
        delete_vector_files(&coa_dir);
    }
    Ok(())
}

/// Inputs of one nested-buffer proximity score.
pub struct NestedBuffers<'a> {
    pub dir: StageDir,
    pub input_prefix: &'static str,
    pub output_prefix: &'static str,
    pub buffers: &'a [u32],
    pub multipliers: &'a Multipliers,
    pub log_name: &'static str,
}

impl NestedBuffers<'_> {
    /// Buffers from the widest to the narrowest.
    fn ordered(&self) -> Vec<u32> {
        let mut buffers = self.buffers.to_vec();
        buffers.sort_unstable_by(|a, b| b.cmp(a));
        buffers.dedup();
        buffers
    }

    fn header(&self) -> Vec<String> {
        let column = self.input_prefix.to_lowercase();
        std::iter::once("tile_id".to_string())
            .chain(self.ordered().iter().map(|b| format!("{column}_{b}")))
            .chain(std::iter::once("add_raster".to_string()))
            .collect()
    }
}

/// The widest buffer and then every narrower one while the chain of
/// existing files is unbroken. Empty when the widest is missing.
pub fn nested_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths.iter().take_while(|p| p.exists()).cloned().collect()
}

fn nested_tile(pipeline: &Pipeline, tile: &TileId, nested: &NestedBuffers) -> Result<Vec<String>> {
    let layout = pipeline.layout();
    let paths: Vec<PathBuf> = nested
        .ordered()
        .iter()
        .map(|b| layout.raster(nested.dir, nested.input_prefix, tile, Some(&b.to_string())))
        .collect();
    let mut row = vec![tile.to_string()];
    row.extend(paths.iter().map(|p| p.exists().to_string()));

    let inputs = nested_inputs(&paths);
    if inputs.is_empty() {
        info!(
            "Skipping tile {tile}, widest {} buffer missing (mandatory).",
            nested.input_prefix
        );
        row.push(false.to_string());
        return Ok(row);
    }

    let grid = pipeline.tile_grid(tile)?;
    let mut layers = Vec::with_capacity(inputs.len());
    for path in &inputs {
        layers.push(read_on_grid(path, &grid)?.fill_nodata(0.0).data);
    }
    let refs: Vec<&Array2<f32>> = layers.iter().collect();
    let add = count_equal(&refs, 1.0)?;
    let (scores, unmapped) = normalize(&add, nested.multipliers, 100.0);
    if !unmapped.is_empty() {
        warn!(
            "Tile {tile}: buffer counts scored 0: {}",
            describe_unmapped(&unmapped)
        );
    }
    write_layer(
        &layout.raster(nested.dir, nested.output_prefix, tile, None),
        &Layer::new(grid, scores)?,
        PixelType::Float32,
    )?;
    pipeline.consume(&inputs);
    row.push(true.to_string());
    Ok(row)
}

/// `multipliers(Σ (buffer mask = 1)) / 100` on the tile grid.
pub fn nested_proximity(pipeline: &Pipeline, nested: &NestedBuffers) -> Result<()> {
    let layout = pipeline.layout();
    let dir = layout.ensure(nested.dir)?;
    let tiles = layout.discover_tiles(0)?;
    let run = pipeline.for_each_tile(&tiles, |tile| nested_tile(pipeline, tile, nested))?;
    report_failures(nested.output_prefix, &run.failures);
    let rows: Vec<Vec<String>> = run.values().collect();
    write_table(&dir.join(nested.log_name), &nested.header(), &rows)?;
    delete_aux_files(&dir);
    Ok(())
}

pub fn coastline(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    nested_proximity(
        pipeline,
        &NestedBuffers {
            dir: StageDir::Coastline,
            input_prefix: prefix::COA,
            output_prefix: prefix::PRC,
            buffers: &config.coastline_buffers,
            multipliers: &config.proximity_coastline_multipliers,
            log_name: "COA_ADD.csv",
        },
    )
}

pub fn rivers(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    nested_proximity(
        pipeline,
        &NestedBuffers {
            dir: StageDir::Rivers,
            input_prefix: prefix::OVE,
            output_prefix: prefix::PRR,
            buffers: &config.river_buffers,
            multipliers: &config.proximity_rivers_multipliers,
            log_name: "OVE_ADD.csv",
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_json;
    use crate::config::Config;
    use crate::raster::Grid;
    use crate::tile::Bounds;
    use ndarray::arr2;
    use std::fs;
    use tempfile::TempDir;

    fn line(wkt: &str) -> VectorFeature {
        VectorFeature::new(Geometry::from_wkt(wkt).unwrap())
    }

    fn tile_square() -> Geometry {
        vector::bbox_geometry(&Bounds::new(104.0, 9.0, 105.0, 10.0)).unwrap()
    }

    #[test]
    fn test_buffer_near_tile_skips_far_lines() {
        let projection = MetricProjection::new().unwrap();
        let far = vec![line("LINESTRING (110 9.5, 111 9.5)")];
        let out = buffer_near_tile(&far, &tile_square(), 500, false, &projection).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_buffer_near_tile_stays_inside_tile() {
        let projection = MetricProjection::new().unwrap();
        let coast = vec![line("LINESTRING (103.5 9.5, 104.5 9.5)")];
        let polygon = buffer_near_tile(&coast, &tile_square(), 2_500, false, &projection)
            .unwrap()
            .unwrap();
        let b = vector::envelope(&polygon);
        assert!(b.min_x >= 104.0 - 1e-9);
        assert!(b.max_x > 104.49 && b.max_x < 104.53);
        assert!(b.min_y < 9.49 && b.max_y > 9.51);
    }

    #[test]
    fn test_river_width_widens_buffer() {
        let projection = MetricProjection::new().unwrap();
        let narrow = vec![line("LINESTRING (104.2 9.5, 104.8 9.5)").with_property(WIDTH_FIELD, 0.0)];
        let wide = vec![line("LINESTRING (104.2 9.5, 104.8 9.5)").with_property(WIDTH_FIELD, 2_000.0)];
        let a = buffer_near_tile(&narrow, &tile_square(), 250, true, &projection)
            .unwrap()
            .unwrap();
        let b = buffer_near_tile(&wide, &tile_square(), 250, true, &projection)
            .unwrap()
            .unwrap();
        assert!(b.area() > a.area() * 4.0);
    }

    #[test]
    fn test_mask_positive() {
        let inside = arr2(&[[true, true, false]]);
        let tides = arr2(&[[1.2, -0.3, 2.0]]);
        assert_eq!(mask_positive(&inside, &tides), arr2(&[[1.0, 0.0, 0.0]]));
    }

    #[test]
    fn test_nested_inputs_stop_at_first_gap() {
        let tmp = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = ["7500", "5000", "2500", "500"]
            .iter()
            .map(|b| tmp.path().join(format!("COA_N09E104_{b}.tif")))
            .collect();
        for i in [0, 1, 3] {
            fs::write(&paths[i], "").unwrap();
        }
        assert_eq!(nested_inputs(&paths), paths[..2].to_vec());
        fs::remove_file(&paths[0]).unwrap();
        assert!(nested_inputs(&paths).is_empty());
    }

    #[test]
    fn test_nested_proximity_scores_counts() {
        let tmp = TempDir::new().unwrap();
        let config = Config::from_json(&sample_json(tmp.path()).to_string()).unwrap();
        let pipeline = Pipeline::new(config, 1);
        let layout = pipeline.layout();
        let tile: TileId = "N09E104".parse().unwrap();
        let bounds = Bounds::new(104.0, 9.0, 105.0, 10.0);
        vector::write_features(
            &layout.tile_vector(&tile, 0),
            &[VectorFeature::new(vector::bbox_geometry(&bounds).unwrap())],
        )
        .unwrap();
        let grid = Grid::from_bounds(&bounds, 0.25).unwrap();
        let wide = Layer::new(grid.clone(), Array2::from_elem((4, 4), 1.0)).unwrap();
        let mut narrow = Layer::filled(grid.clone(), 0.0);
        narrow.data[[0, 0]] = 1.0;
        narrow.data[[3, 3]] = f32::NAN;
        let raster = |b: &str| layout.raster(StageDir::Rivers, prefix::OVE, &tile, Some(b));
        write_layer(&raster("2500"), &wide, PixelType::Byte).unwrap();
        write_layer(&raster("500"), &narrow, PixelType::Float32).unwrap();

        rivers(&pipeline).unwrap();

        let prr = read_layer(&layout.raster(StageDir::Rivers, prefix::PRR, &tile, None)).unwrap();
        assert_eq!(prr.data[[0, 0]], 0.67);
        assert_eq!(prr.data[[1, 1]], 0.5);
        assert_eq!(prr.data[[3, 3]], 0.5);
        assert!(!raster("2500").exists());

        let log = fs::read_to_string(layout.dir(StageDir::Rivers).join("OVE_ADD.csv")).unwrap();
        assert_eq!(
            log,
            "tile_id,ove_2500,ove_500,ove_250,add_raster\nN09E104,true,true,false,true\n"
        );
    }
}
