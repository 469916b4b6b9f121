//! Tile catalog: which 1° cells have classification data, lie inside the
//! mangrove latitude range, and which countries they touch.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde_json::json;

use crate::error::Result;
use crate::layout::StageDir;
use crate::pipeline::Pipeline;
use crate::tile::{Bounds, TileId};
use crate::vector::{self, MetricProjection, VectorFeature};

/// Country label for tiles that touch no country.
const NO_COUNTRY: &str = "any";

/// Tile ids named by the `*.tif` files of a directory (`..._E104_N9...`).
pub fn tile_ids_in_dir(dir: &Path) -> Result<BTreeSet<TileId>> {
    let mut ids = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".tif") {
            continue;
        }
        match TileId::find_in_file_name(name) {
            Some(id) => {
                ids.insert(id);
            }
            None => warn!("No tile id in {name}"),
        }
    }
    Ok(ids)
}

/// Global grid cells whose `lat`/`lon` fields name one of `ids`. The
/// normalised id is stored in the `id` property.
pub fn select_catalog(grid: Vec<VectorFeature>, ids: &BTreeSet<TileId>) -> Vec<VectorFeature> {
    let total = grid.len();
    let mut found = BTreeSet::new();
    let selected: Vec<VectorFeature> = grid
        .into_iter()
        .filter_map(|feature| {
            let lat = feature.number("lat")?;
            let lon = feature.number("lon")?;
            let id = TileId::from_lat_lon(lat, lon).ok()?;
            if !ids.contains(&id) {
                return None;
            }
            found.insert(id);
            Some(feature.with_property("id", id.to_string()))
        })
        .collect();
    info!("Selected {} geometries out of {}", selected.len(), total);
    info!(
        "Found {} matches, {} missing.",
        found.len(),
        ids.len() - found.len()
    );
    selected
}

pub fn feature_id(feature: &VectorFeature) -> Option<TileId> {
    feature.text("id")?.parse().ok()
}

/// Northern and western limits of the mangrove tiles: `(max maxy, min minx)`.
pub fn gmw_limits(gmw: &[VectorFeature]) -> Option<(f64, f64)> {
    gmw.iter()
        .map(|f| vector::envelope(&f.geometry))
        .fold(None, |acc: Option<(f64, f64)>, b| match acc {
            None => Some((b.max_y, b.min_x)),
            Some((max_y, min_x)) => Some((max_y.max(b.max_y), min_x.min(b.min_x))),
        })
}

/// Keeps tiles with `maxy <= max_lat` and `minx >= min_lon`.
pub fn within_gmw_range(tiles: Vec<VectorFeature>, limits: (f64, f64)) -> Vec<VectorFeature> {
    let (max_lat, min_lon) = limits;
    tiles
        .into_iter()
        .filter(|f| {
            let b = vector::envelope(&f.geometry);
            b.max_y <= max_lat && b.min_x >= min_lon
        })
        .collect()
}

/// Distinct `name`s of the countries the tile intersects, in file order,
/// or `["any"]`.
pub fn country_names(tile: &VectorFeature, countries: &[VectorFeature]) -> Vec<String> {
    let bounds = vector::envelope(&tile.geometry);
    let mut names: Vec<String> = Vec::new();
    for country in countries {
        if !touches(&bounds, &vector::envelope(&country.geometry)) {
            continue;
        }
        if !country.geometry.intersects(&tile.geometry) {
            continue;
        }
        if let Some(name) = country.text("name") {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    if names.is_empty() {
        names.push(NO_COUNTRY.to_string());
    }
    names
}

fn touches(a: &Bounds, b: &Bounds) -> bool {
    a.min_x <= b.max_x && b.min_x <= a.max_x && a.min_y <= b.max_y && b.min_y <= a.max_y
}

pub fn run(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let layout = pipeline.layout();
    layout.ensure(StageDir::Tiles)?;

    let ids = tile_ids_in_dir(&config.clark_tiles)?;
    let grid = vector::read_features(&config.global_tiles, None)?;
    let mut catalog = select_catalog(grid, &ids);
    vector::write_features(&layout.catalog("clark_tiles.geojson"), &catalog)?;

    if let Some(filter) = config.tile_filter()? {
        catalog.retain(|f| feature_id(f).is_some_and(|id| filter.contains(&id)));
        info!("Kept {} tiles from tiles_ids", catalog.len());
    }

    let gmw = vector::read_features(&config.gmw_tiles, None)?;
    let mut tiles = match gmw_limits(&gmw) {
        Some(limits) => within_gmw_range(catalog, limits),
        None => {
            warn!("No mangrove tiles in {}", config.gmw_tiles.display());
            Vec::new()
        }
    };
    vector::write_features(&layout.catalog("clark_gmw_tiles.geojson"), &tiles)?;

    let countries = vector::read_features(&config.countries_geometries, None)?;
    for tile in tiles.iter_mut() {
        let names = country_names(tile, &countries);
        let count = if names == [NO_COUNTRY] { 0 } else { names.len() };
        tile.properties.insert("countries".into(), json!(names));
        tile.properties.insert("num_countries".into(), json!(count));
    }
    let overlapping = tiles
        .iter()
        .filter(|t| t.number("num_countries").unwrap_or(0.0) > 0.0)
        .count();
    info!("Found {overlapping} tiles overlapping any country.");
    vector::write_features(&layout.catalog("clark_gmw_tiles_country.geojson"), &tiles)?;

    let projection = MetricProjection::new()?;
    for tile in &tiles {
        let Some(id) = feature_id(tile) else {
            continue;
        };
        vector::write_features(&layout.tile_vector(&id, 0), std::slice::from_ref(tile))?;
        for &buffer_m in &config.tile_buffers {
            let buffered = VectorFeature {
                geometry: projection.buffer(&tile.geometry, f64::from(buffer_m))?,
                properties: tile.properties.clone(),
            };
            vector::write_features(&layout.tile_vector(&id, buffer_m), &[buffered])?;
        }
    }
    info!("Wrote {} tiles", tiles.len());
    Ok(())
}
