//! Aquaculture pond rasters restricted to the coastal zone.
//!
//! Around every 1° tile that has a pond raster, the coastline buffered by
//! 7.5 km and the rivers buffered by 2.5 km inside the 30 km coastal
//! corridor make up the `ADD` area. Pond pixels outside that area become
//! nodata and the masked tiles are mosaicked into one VRT per prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::Zip;
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::mosaic::{self, MosaicFilter};
use crate::pipeline::run_tiles;
use crate::raster::{read_layer, write_layer, Layer, PixelType};
use crate::record::{write_csv, LogRecord};
use crate::stages::proximity::buffer_near_tile;
use crate::stages::report_failures;
use crate::stages::tiles::{feature_id, select_catalog, tile_ids_in_dir};
use crate::tile::{Bounds, TileId};
use crate::vector::{self, MetricProjection, VectorFeature};

pub const RIVER_BUFFER_M: u32 = 2_500;
pub const COAST_BUFFER_M: u32 = 7_500;
pub const CORRIDOR_BUFFER_M: u32 = 30_000;

const RIV: &str = "RIV";
const C07: &str = "C07";
const C30: &str = "C30";
const OVE: &str = "OVE";
const ADD: &str = "ADD";

/// Clip products in log order.
const CLIPS: [&str; 3] = [RIV, C07, C30];

/// Inputs and outputs of one run.
#[derive(Debug, Clone)]
pub struct AquacultureRun {
    /// Folder of `aquaculture_<year>_<lon>_<lat>.tif` rasters.
    pub rasters: PathBuf,
    /// Global 1° grid with `lat` and `lon` fields.
    pub grid: PathBuf,
    pub rivers: PathBuf,
    pub coastline: PathBuf,
    /// Per-tile buffer polygons and their logs.
    pub vectors: PathBuf,
    /// Masked rasters, `masking_log.csv` and the VRTs.
    pub output: PathBuf,
    pub year: i32,
    /// Keep only these tiles; every tile with a raster when `None`.
    pub tiles: Option<BTreeSet<TileId>>,
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ClipRecord {
    tile_id: TileId,
    has_features: bool,
}

impl LogRecord for ClipRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "has_features"];
}

#[derive(Debug, Serialize)]
struct OverlayRecord {
    tile_id: TileId,
    #[serde(rename = "C30_exists")]
    corridor_exists: bool,
    #[serde(rename = "RIV_exists")]
    river_exists: bool,
    #[serde(rename = "OVE_created")]
    overlay_created: bool,
}

impl LogRecord for OverlayRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "C30_exists", "RIV_exists", "OVE_created"];
}

#[derive(Debug, Serialize)]
struct AdditionRecord {
    tile_id: TileId,
    #[serde(rename = "C07_exists")]
    coast_exists: bool,
    #[serde(rename = "OVE_exists")]
    overlay_exists: bool,
    #[serde(rename = "ADD_created")]
    area_created: bool,
}

impl LogRecord for AdditionRecord {
    const HEADER: &'static [&'static str] = &["tile_id", "C07_exists", "OVE_exists", "ADD_created"];
}

#[derive(Debug, Serialize)]
struct MaskRecord {
    tile_id: TileId,
    raster_exists: bool,
    vector_exists: bool,
    masked_created: bool,
}

impl LogRecord for MaskRecord {
    const HEADER: &'static [&'static str] =
        &["tile_id", "raster_exists", "vector_exists", "masked_created"];
}

/// `aquaculture_<year>_E104_N9.tif`
pub fn raster_name(year: i32, tile: &TileId) -> String {
    format!("aquaculture_{year}_{}.tif", tile.lon_lat_name())
}

pub fn masked_name(year: i32, tile: &TileId) -> String {
    format!("aquaculture_{year}_{}_masked.tif", tile.lon_lat_name())
}

fn vector_path(dir: &Path, prefix: &str, tile: &TileId) -> PathBuf {
    dir.join(format!("{prefix}_{tile}.geojson"))
}

/// Extent of every grid cell that has a pond raster, by tile id.
pub fn catalog(job: &AquacultureRun) -> Result<BTreeMap<TileId, Bounds>> {
    let mut ids = tile_ids_in_dir(&job.rasters)?;
    if let Some(keep) = &job.tiles {
        ids.retain(|id| keep.contains(id));
    }
    let grid = vector::read_features(&job.grid, None)?;
    Ok(select_catalog(grid, &ids)
        .iter()
        .filter_map(|f| Some((feature_id(f)?, vector::envelope(&f.geometry))))
        .collect())
}

/// Writes the `RIV`, `C07` and `C30` polygons of one tile and returns which
/// of them had features.
fn clip_tile(job: &AquacultureRun, tile: &TileId, bounds: &Bounds) -> Result<[bool; 3]> {
    let projection = MetricProjection::new()?;
    let geometry = vector::bbox_geometry(bounds)?;
    let near = |buffer_m: u32| -> Result<Bounds> {
        Ok(vector::envelope(&projection.buffer(&geometry, f64::from(buffer_m))?))
    };
    let rivers = vector::read_features(&job.rivers, Some(&near(RIVER_BUFFER_M)?))?;
    let coastline = vector::read_features(&job.coastline, Some(&near(CORRIDOR_BUFFER_M)?))?;

    let jobs = [
        (RIV, &rivers, RIVER_BUFFER_M),
        (C07, &coastline, COAST_BUFFER_M),
        (C30, &coastline, CORRIDOR_BUFFER_M),
    ];
    let mut found = [false; 3];
    for (slot, (prefix, lines, buffer_m)) in found.iter_mut().zip(jobs) {
        match buffer_near_tile(lines, &geometry, buffer_m, false, &projection)? {
            Some(polygon) if !polygon.is_empty() => {
                vector::write_features(
                    &vector_path(&job.vectors, prefix, tile),
                    &[VectorFeature::new(polygon)],
                )?;
                *slot = true;
            }
            _ => info!("Tile {tile} has no {prefix} features, skipping save."),
        }
    }
    Ok(found)
}

/// `OVE = C30 ∩ RIV`: rivers inside the coastal corridor.
fn overlay_tile(dir: &Path, tile: &TileId) -> Result<OverlayRecord> {
    let corridor_path = vector_path(dir, C30, tile);
    let river_path = vector_path(dir, RIV, tile);
    let mut record = OverlayRecord {
        tile_id: *tile,
        corridor_exists: corridor_path.exists(),
        river_exists: river_path.exists(),
        overlay_created: false,
    };
    let Some(rivers) = vector::read_non_empty(&river_path)? else {
        warn!("Tile {tile}: no river polygons, skipping overlay.");
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
        vector::write_features(&vector_path(dir, OVE, tile), &overlay)?;
        record.overlay_created = true;
    }
    Ok(record)
}

/// `ADD = C07 ∪ OVE`, or `C07` alone when there is no overlay.
fn addition_tile(dir: &Path, tile: &TileId) -> Result<AdditionRecord> {
    let overlay_path = vector_path(dir, OVE, tile);
    let mut record = AdditionRecord {
        tile_id: *tile,
        coast_exists: true,
        overlay_exists: overlay_path.exists(),
        area_created: false,
    };
    let Some(coast) = vector::read_non_empty(&vector_path(dir, C07, tile))? else {
        warn!("Tile {tile}: no coastline polygons, skipping addition.");
        record.coast_exists = false;
        return Ok(record);
    };
    let mut parts: Vec<_> = coast.into_iter().map(|f| f.geometry).collect();
    match vector::read_non_empty(&overlay_path)? {
        Some(overlay) => parts.extend(overlay.into_iter().map(|f| f.geometry)),
        None => warn!("Tile {tile}: no overlay, using the coastline buffer alone."),
    }
    if let Some(area) = vector::dissolve(&parts) {
        vector::write_features(&vector_path(dir, ADD, tile), &[VectorFeature::new(area)])?;
        record.area_created = true;
    }
    Ok(record)
}

/// Crops `ponds` to the extent of the polygons in `area` and sets every
/// pixel whose centre lies outside them to nodata. `None` when the area
/// misses the raster.
pub fn mask_to_area(ponds: &Layer, area: &Path) -> Result<Option<Layer>> {
    let features = vector::read_features(area, None)?;
    let Some(extent) = features
        .iter()
        .map(|f| vector::envelope(&f.geometry))
        .reduce(|a, b| a.union(&b))
    else {
        return Ok(None);
    };
    let Some(mut window) = ponds.crop(&extent) else {
        return Ok(None);
    };
    let inside = vector::rasterize_mask(area, &window.grid)?;
    Zip::from(&mut window.data).and(&inside).for_each(|v, &inside| {
        if !inside {
            *v = f32::NAN;
        }
    });
    Ok(Some(window))
}

fn mask_tile(job: &AquacultureRun, tile: &TileId) -> Result<MaskRecord> {
    let raster_path = job.rasters.join(raster_name(job.year, tile));
    let area_path = vector_path(&job.vectors, ADD, tile);
    let mut record = MaskRecord {
        tile_id: *tile,
        raster_exists: raster_path.exists(),
        vector_exists: area_path.exists(),
        masked_created: false,
    };
    if !record.vector_exists {
        warn!("Vector file missing for tile {tile}, skipping.");
        return Ok(record);
    }
    if !record.raster_exists {
        warn!("Raster file missing for tile {tile}, skipping.");
        return Ok(record);
    }
    if vector::read_non_empty(&area_path)?.is_none() {
        record.vector_exists = false;
        return Ok(record);
    }
    match mask_to_area(&read_layer(&raster_path)?, &area_path)? {
        Some(masked) => {
            write_layer(
                &job.output.join(masked_name(job.year, tile)),
                &masked,
                PixelType::Float32,
            )?;
            record.masked_created = true;
        }
        None => warn!("Tile {tile}: coastal area misses the pond raster."),
    }
    Ok(record)
}

/// Clips, overlays, masks and mosaics every tile; returns the VRTs.
pub fn run(job: &AquacultureRun) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(&job.vectors)?;
    fs::create_dir_all(&job.output)?;
    let cells = catalog(job)?;
    let tiles: Vec<TileId> = cells.keys().copied().collect();
    info!("{} tile(s) with pond rasters", tiles.len());

    let clips = run_tiles(job.threads, &tiles, |tile| {
        let bounds = cells
            .get(tile)
            .ok_or_else(|| PipelineError::InvalidTileId(tile.to_string()))?;
        clip_tile(job, tile, bounds)
    })?;
    report_failures("aquaculture clip", &clips.failures);
    for (i, prefix) in CLIPS.iter().enumerate() {
        let records: Vec<ClipRecord> = clips
            .results
            .iter()
            .map(|(tile, found)| ClipRecord {
                tile_id: *tile,
                has_features: found[i],
            })
            .collect();
        let log = job
            .vectors
            .join(format!("tiles_{}_log.csv", prefix.to_lowercase()));
        write_csv(&log, &records)?;
    }

    let overlays = run_tiles(job.threads, &tiles, |tile| overlay_tile(&job.vectors, tile))?;
    report_failures("aquaculture overlay", &overlays.failures);
    let records: Vec<OverlayRecord> = overlays.values().collect();
    write_csv(&job.vectors.join("tiles_ove_log.csv"), &records)?;

    let additions = run_tiles(job.threads, &tiles, |tile| addition_tile(&job.vectors, tile))?;
    report_failures("aquaculture addition", &additions.failures);
    let records: Vec<AdditionRecord> = additions.values().collect();
    write_csv(&job.vectors.join("tiles_add_log.csv"), &records)?;

    let masks = run_tiles(job.threads, &tiles, |tile| mask_tile(job, tile))?;
    report_failures("aquaculture mask", &masks.failures);
    let records: Vec<MaskRecord> = masks.values().collect();
    write_csv(&job.output.join("masking_log.csv"), &records)?;

    mosaic::build_prefix_vrts(&job.output, &job.output, &MosaicFilter::default())
}
