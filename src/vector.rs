//! Vector helpers on top of OGR: GeoJSON I/O, metric buffers, clip,
//! dissolve, overlay and rasterization of polygon masks.
//!
//! Geometries are kept in EPSG:4326 with longitude first. Buffers given in
//! metres are computed in EPSG:3857 and projected back.

use std::fs;
use std::path::Path;

use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::vector::{FieldValue, Geometry, LayerAccess};
use gdal::{Dataset, DriverManager};
use log::{debug, info};
use ndarray::Array2;
use serde_json::{json, Map, Value};

use crate::error::{PipelineError, Result};
use crate::gdal_ext;
use crate::raster::{read_dataset, Grid, Layer};
use crate::tile::Bounds;

/// Segments per quarter circle used by metric buffers.
const QUAD_SEGMENTS: u32 = 16;

/// A geometry with its attribute table row.
#[derive(Clone)]
pub struct VectorFeature {
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
}

impl VectorFeature {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Numeric attribute; numeric strings are accepted too.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.properties.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

fn field_to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::IntegerValue(v) => json!(v),
        FieldValue::Integer64Value(v) => json!(v),
        FieldValue::RealValue(v) => json!(v),
        FieldValue::StringValue(v) => json!(v),
        _ => Value::Null,
    }
}

/// Reads every feature of the first layer. With `filter`, only features
/// whose envelope meets the rectangle are returned.
pub fn read_features(path: &Path, filter: Option<&Bounds>) -> Result<Vec<VectorFeature>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    debug!("Reading features from {}", path.display());
    let dataset = Dataset::open(path)?;
    let mut layer = dataset.layer(0)?;
    if let Some(b) = filter {
        layer.set_spatial_filter_rect(b.min_x, b.min_y, b.max_x, b.max_y);
    }
    let mut features = Vec::new();
    for feature in layer.features() {
        let Some(geometry) = feature.geometry() else {
            continue;
        };
        let mut properties = Map::new();
        for (name, value) in feature.fields() {
            properties.insert(name, value.map(field_to_json).unwrap_or(Value::Null));
        }
        features.push(VectorFeature {
            geometry: geometry.clone(),
            properties,
        });
    }
    Ok(features)
}

/// Geometry of the first feature, e.g. a `TIL_*` tile polygon.
pub fn read_geometry(path: &Path) -> Result<Geometry> {
    read_features(path, None)?
        .into_iter()
        .next()
        .map(|f| f.geometry)
        .ok_or_else(|| PipelineError::EmptyInput(path.to_path_buf()))
}

/// Features of a vector file, or `None` when it is missing or empty.
pub fn read_non_empty(path: &Path) -> Result<Option<Vec<VectorFeature>>> {
    if !path.exists() {
        return Ok(None);
    }
    let features = read_features(path, None)?;
    Ok(if features.is_empty() {
        None
    } else {
        Some(features)
    })
}

/// Writes a GeoJSON `FeatureCollection`.
pub fn write_features(path: &Path, features: &[VectorFeature]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut items = Vec::with_capacity(features.len());
    for feature in features {
        let geometry: Value = serde_json::from_str(&feature.geometry.json()?)?;
        items.push(json!({
            "type": "Feature",
            "properties": feature.properties,
            "geometry": geometry,
        }));
    }
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let collection = json!({
        "type": "FeatureCollection",
        "name": name,
        "features": items,
    });
    fs::write(path, serde_json::to_string(&collection)?)?;
    info!("Saved: {}", path.display());
    Ok(())
}

pub fn bbox_geometry(bounds: &Bounds) -> Result<Geometry> {
    let Bounds {
        min_x,
        min_y,
        max_x,
        max_y,
    } = *bounds;
    let wkt = format!(
        "POLYGON (({min_x} {min_y},{max_x} {min_y},{max_x} {max_y},{min_x} {max_y},{min_x} {min_y}))"
    );
    Ok(Geometry::from_wkt(&wkt)?)
}

pub fn envelope(geometry: &Geometry) -> Bounds {
    let env = geometry.envelope();
    Bounds::new(env.MinX, env.MinY, env.MaxX, env.MaxY)
}

fn lon_lat_srs(epsg: u32) -> Result<SpatialRef> {
    let mut srs = SpatialRef::from_epsg(epsg)?;
    srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    Ok(srs)
}

/// Round trip between EPSG:4326 and Web Mercator for buffering in metres.
pub struct MetricProjection {
    to_metric: CoordTransform,
    to_geographic: CoordTransform,
}

impl MetricProjection {
    pub fn new() -> Result<Self> {
        let wgs84 = lon_lat_srs(4326)?;
        let mercator = lon_lat_srs(3857)?;
        Ok(Self {
            to_metric: CoordTransform::new(&wgs84, &mercator)?,
            to_geographic: CoordTransform::new(&mercator, &wgs84)?,
        })
    }

    pub fn buffer(&self, geometry: &Geometry, meters: f64) -> Result<Geometry> {
        let projected = geometry.transform(&self.to_metric)?;
        let buffered = projected.buffer(meters, QUAD_SEGMENTS)?;
        Ok(buffered.transform(&self.to_geographic)?)
    }
}

/// Union of all geometries, or `None` when there are none.
pub fn dissolve(geometries: &[Geometry]) -> Option<Geometry> {
    let mut iter = geometries.iter();
    let mut merged = iter.next()?.clone();
    for geometry in iter {
        merged = merged.union(geometry)?;
    }
    Some(merged)
}

/// Intersects each feature with `mask`, keeping attributes and dropping
/// features that fall outside.
pub fn clip(features: &[VectorFeature], mask: &Geometry) -> Vec<VectorFeature> {
    features
        .iter()
        .filter(|f| f.geometry.intersects(mask))
        .filter_map(|f| {
            let geometry = f.geometry.intersection(mask)?;
            if geometry.is_empty() {
                return None;
            }
            Some(VectorFeature {
                geometry,
                properties: f.properties.clone(),
            })
        })
        .collect()
}

/// Pairwise intersection of two feature sets; attributes of both sides are
/// merged, the left side winning on name clashes.
pub fn overlay_intersection(left: &[VectorFeature], right: &[VectorFeature]) -> Vec<VectorFeature> {
    let mut out = Vec::new();
    for a in left {
        for b in right {
            if !a.geometry.intersects(&b.geometry) {
                continue;
            }
            let Some(geometry) = a.geometry.intersection(&b.geometry) else {
                continue;
            };
            if geometry.is_empty() {
                continue;
            }
            let mut properties = b.properties.clone();
            properties.extend(a.properties.clone());
            out.push(VectorFeature {
                geometry,
                properties,
            });
        }
    }
    out
}

/// Pixels of `grid` whose centre falls inside any polygon of the file.
pub fn rasterize_mask(vector_path: &Path, grid: &Grid) -> Result<Array2<bool>> {
    let source = Dataset::open(vector_path)?;
    let driver = DriverManager::get_driver_by_name("MEM")?;
    let mut target = driver.create_with_band_type::<u8, _>("", grid.width, grid.height, 1)?;
    target.set_geo_transform(&grid.geo_transform)?;
    target.set_projection(&grid.projection)?;
    gdal_ext::rasterize(
        &source,
        &target,
        &["-burn".into(), "1".into(), "-init".into(), "0".into()],
    )?;
    let burned: Layer = read_dataset(&target)?;
    Ok(burned.data.mapv(|v| v == 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn square(min_x: f64, min_y: f64, size: f64) -> Geometry {
        bbox_geometry(&Bounds::new(min_x, min_y, min_x + size, min_y + size)).unwrap()
    }

    #[test]
    fn test_bbox_envelope() {
        let bounds = Bounds::new(104.0, 9.0, 105.0, 10.0);
        assert_eq!(envelope(&bbox_geometry(&bounds).unwrap()), bounds);
    }

    #[test]
    fn test_metric_buffer_grows_by_distance() {
        let projection = MetricProjection::new().unwrap();
        let tile = square(0.0, 0.0, 1.0);
        let buffered = projection.buffer(&tile, 10_000.0).unwrap();
        let b = envelope(&buffered);
        // 10 km is about 0.0898° of longitude at the equator.
        assert_relative_eq!(b.min_x, -0.0898, epsilon = 1e-3);
        assert_relative_eq!(b.max_x, 1.0898, epsilon = 1e-3);
        assert!(b.min_y < -0.08 && b.max_y > 1.08);
    }

    #[test]
    fn test_dissolve_merges_overlaps() {
        let merged = dissolve(&[square(0.0, 0.0, 2.0), square(1.0, 0.0, 2.0)]).unwrap();
        assert_relative_eq!(merged.area(), 6.0, epsilon = 1e-9);
        assert!(dissolve(&[]).is_none());
    }

    #[test]
    fn test_clip_drops_outside_features() {
        let features = vec![
            VectorFeature::new(square(0.5, 0.5, 1.0)).with_property("width_m", 40),
            VectorFeature::new(square(5.0, 5.0, 1.0)),
        ];
        let clipped = clip(&features, &square(0.0, 0.0, 1.0));
        assert_eq!(clipped.len(), 1);
        assert_relative_eq!(clipped[0].geometry.area(), 0.25, epsilon = 1e-9);
        assert_eq!(clipped[0].number("width_m"), Some(40.0));
    }

    #[test]
    fn test_overlay_intersection() {
        let left = vec![VectorFeature::new(square(0.0, 0.0, 2.0)).with_property("side", "coast")];
        let right = vec![
            VectorFeature::new(square(1.0, 1.0, 2.0)).with_property("side", "river"),
            VectorFeature::new(square(10.0, 10.0, 1.0)),
        ];
        let out = overlay_intersection(&left, &right);
        assert_eq!(out.len(), 1);
        assert_relative_eq!(out[0].geometry.area(), 1.0, epsilon = 1e-9);
        assert_eq!(out[0].text("side"), Some("coast"));
    }

    #[test]
    fn test_write_then_read_features() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("TIL_N09E104_0.geojson");
        let feature = VectorFeature::new(square(104.0, 9.0, 1.0))
            .with_property("tile_id", "N09E104")
            .with_property("num_countries", 1);
        write_features(&path, &[feature]).unwrap();

        let back = read_features(&path, None).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].text("tile_id"), Some("N09E104"));
        assert_eq!(back[0].number("num_countries"), Some(1.0));
        assert_eq!(
            envelope(&read_geometry(&path).unwrap()),
            Bounds::new(104.0, 9.0, 105.0, 10.0)
        );
    }

    #[test]
    fn test_read_with_filter() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("coast.geojson");
        write_features(
            &path,
            &[
                VectorFeature::new(square(0.0, 0.0, 1.0)),
                VectorFeature::new(square(50.0, 50.0, 1.0)),
            ],
        )
        .unwrap();
        let near = read_features(&path, Some(&Bounds::new(-1.0, -1.0, 2.0, 2.0))).unwrap();
        assert_eq!(near.len(), 1);
    }

    #[test]
    fn test_rasterize_mask_on_grid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("COA_N00E000_500.geojson");
        write_features(&path, &[VectorFeature::new(square(0.0, 0.0, 0.5))]).unwrap();
        let grid = Grid::from_bounds(&Bounds::new(0.0, 0.0, 1.0, 1.0), 0.25).unwrap();
        let mask = rasterize_mask(&path, &grid).unwrap();
        assert_eq!(mask.dim(), (4, 4));
        assert_eq!(mask.iter().filter(|v| **v).count(), 4);
        assert!(mask[[3, 0]] && mask[[2, 1]]);
        assert!(!mask[[0, 0]]);
    }
}
