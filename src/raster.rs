//! Single-band rasters held in memory as `f32` arrays with NaN as nodata.

use std::fs;
use std::path::Path;

use gdal::raster::{Buffer, RasterCreationOptions};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use log::{debug, info};
use ndarray::{s, Array2};

use crate::error::{PipelineError, Result};
use crate::gdal_ext::{self, WarpArgs};
use crate::tile::Bounds;

/// Nodata value written to every Float32 output.
pub const NODATA: f64 = -9999.0;

/// Pixel type of a written GeoTIFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    Float32,
    /// Binary masks; NaN is written as 0 and no nodata value is set.
    Byte,
}

pub fn wgs84_wkt() -> Result<String> {
    Ok(SpatialRef::from_epsg(4326)?.to_wkt()?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub geo_transform: [f64; 6],
    pub width: usize,
    pub height: usize,
    pub projection: String,
}

impl Grid {
    /// North-up EPSG:4326 grid covering `bounds` at `res` degrees. The pixel
    /// count is rounded the way `gdalwarp -te -tr` rounds it.
    pub fn from_bounds(bounds: &Bounds, res: f64) -> Result<Self> {
        let width = ((bounds.width() + res / 2.0) / res) as usize;
        let height = ((bounds.height() + res / 2.0) / res) as usize;
        if width == 0 || height == 0 {
            return Err(PipelineError::Config(format!(
                "extent {bounds:?} is smaller than one {res}° pixel"
            )));
        }
        Ok(Self {
            geo_transform: [bounds.min_x, res, 0.0, bounds.max_y, 0.0, -res],
            width,
            height,
            projection: wgs84_wkt()?,
        })
    }

    pub fn from_dataset(dataset: &Dataset) -> Result<Self> {
        let (width, height) = dataset.raster_size();
        Ok(Self {
            geo_transform: dataset.geo_transform()?,
            width,
            height,
            projection: dataset.projection(),
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn res_x(&self) -> f64 {
        self.geo_transform[1].abs()
    }

    pub fn res_y(&self) -> f64 {
        self.geo_transform[5].abs()
    }

    pub fn bounds(&self) -> Bounds {
        let gt = &self.geo_transform;
        let x1 = gt[0] + gt[1] * self.width as f64;
        let y1 = gt[3] + gt[5] * self.height as f64;
        Bounds::new(gt[0].min(x1), gt[3].min(y1), gt[0].max(x1), gt[3].max(y1))
    }

    /// Map coordinates of the centre of pixel `(row, col)`.
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let gt = &self.geo_transform;
        let x = gt[0] + (col as f64 + 0.5) * gt[1] + (row as f64 + 0.5) * gt[2];
        let y = gt[3] + (col as f64 + 0.5) * gt[4] + (row as f64 + 0.5) * gt[5];
        (x, y)
    }

    /// Same shape and a geotransform equal within a hundredth of a pixel.
    pub fn aligned_with(&self, other: &Grid) -> bool {
        if self.width != other.width || self.height != other.height {
            return false;
        }
        let tol = self.res_x().min(self.res_y()) * 0.01;
        self.geo_transform
            .iter()
            .zip(other.geo_transform.iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub grid: Grid,
    pub data: Array2<f32>,
}

impl Layer {
    pub fn new(grid: Grid, data: Array2<f32>) -> Result<Self> {
        let (rows, cols) = data.dim();
        if (rows, cols) != grid.shape() {
            return Err(PipelineError::GridMismatch(
                grid.height,
                grid.width,
                rows,
                cols,
            ));
        }
        Ok(Self { grid, data })
    }

    pub fn filled(grid: Grid, value: f32) -> Self {
        let data = Array2::from_elem(grid.shape(), value);
        Self { grid, data }
    }

    /// New layer on the same grid.
    pub fn with_data(&self, data: Array2<f32>) -> Result<Self> {
        Self::new(self.grid.clone(), data)
    }

    /// Replaces nodata with a constant.
    pub fn fill_nodata(mut self, value: f32) -> Self {
        self.data.mapv_inplace(|v| if v.is_nan() { value } else { v });
        self
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    fn values_with_nodata(&self, kind: PixelType) -> Vec<f32> {
        let fill = match kind {
            PixelType::Float32 => NODATA as f32,
            PixelType::Byte => 0.0,
        };
        self.data
            .iter()
            .map(|v| if v.is_nan() { fill } else { *v })
            .collect()
    }

    /// In-memory GDAL copy carrying the `NODATA` value.
    pub fn to_mem_dataset(&self) -> Result<Dataset> {
        let driver = DriverManager::get_driver_by_name("MEM")?;
        let mut dataset =
            driver.create_with_band_type::<f32, _>("", self.grid.width, self.grid.height, 1)?;
        dataset.set_geo_transform(&self.grid.geo_transform)?;
        dataset.set_projection(&self.grid.projection)?;
        self.write_band(&dataset, PixelType::Float32)?;
        Ok(dataset)
    }

    /// Resamples onto another grid with nearest neighbour.
    pub fn warp_onto(&self, grid: &Grid) -> Result<Layer> {
        if self.grid.aligned_with(grid) {
            return Ok(Layer {
                grid: grid.clone(),
                data: self.data.clone(),
            });
        }
        warp_to_grid(&self.to_mem_dataset()?, grid)
    }

    /// Window of the pixels touching `bounds`, snapped outwards to the
    /// pixel edges. `None` when `bounds` misses the layer.
    pub fn crop(&self, bounds: &Bounds) -> Option<Layer> {
        let gt = self.grid.geo_transform;
        let (res_x, res_y) = (self.grid.res_x(), self.grid.res_y());
        let col = |x: f64| (x - gt[0]) / res_x;
        let row = |y: f64| (gt[3] - y) / res_y;
        let col0 = col(bounds.min_x).floor().max(0.0) as usize;
        let col1 = (col(bounds.max_x).ceil().max(0.0) as usize).min(self.grid.width);
        let row0 = row(bounds.max_y).floor().max(0.0) as usize;
        let row1 = (row(bounds.min_y).ceil().max(0.0) as usize).min(self.grid.height);
        if col0 >= col1 || row0 >= row1 {
            return None;
        }
        let mut geo_transform = gt;
        geo_transform[0] = gt[0] + col0 as f64 * gt[1];
        geo_transform[3] = gt[3] + row0 as f64 * gt[5];
        let grid = Grid {
            geo_transform,
            width: col1 - col0,
            height: row1 - row0,
            projection: self.grid.projection.clone(),
        };
        let data = self.data.slice(s![row0..row1, col0..col1]).to_owned();
        Some(Layer { grid, data })
    }

    fn write_band(&self, dataset: &Dataset, kind: PixelType) -> Result<()> {
        let (width, height) = (self.grid.width, self.grid.height);
        let mut band = dataset.rasterband(1)?;
        if kind == PixelType::Float32 {
            band.set_no_data_value(Some(NODATA))?;
        }
        match kind {
            PixelType::Float32 => {
                let mut buffer = Buffer::new((width, height), self.values_with_nodata(kind));
                band.write((0, 0), (width, height), &mut buffer)?;
            }
            PixelType::Byte => {
                let bytes: Vec<u8> = self
                    .values_with_nodata(kind)
                    .into_iter()
                    .map(|v| v.clamp(0.0, 255.0) as u8)
                    .collect();
                let mut buffer = Buffer::new((width, height), bytes);
                band.write((0, 0), (width, height), &mut buffer)?;
            }
        }
        Ok(())
    }
}

/// Reads band 1; the band's nodata value becomes NaN.
pub fn read_dataset(dataset: &Dataset) -> Result<Layer> {
    let grid = Grid::from_dataset(dataset)?;
    let band = dataset.rasterband(1)?;
    let nodata = band.no_data_value();
    let buffer = band.read_as::<f32>(
        (0, 0),
        (grid.width, grid.height),
        (grid.width, grid.height),
        None,
    )?;
    let values: Vec<f32> = match nodata {
        Some(nodata) => {
            let nodata = nodata as f32;
            buffer
                .into_iter()
                .map(|v| if v == nodata { f32::NAN } else { v })
                .collect()
        }
        None => buffer.into_iter().collect(),
    };
    let data = Array2::from_shape_vec(grid.shape(), values)?;
    Ok(Layer { grid, data })
}

/// Opens a raster source (file, VRT or `/vsizip/` path on disk).
pub fn open_source(path: &Path) -> Result<Dataset> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    debug!("Opening input raster: {}", path.display());
    Ok(Dataset::open(path)?)
}

pub fn read_layer(path: &Path) -> Result<Layer> {
    read_dataset(&open_source(path)?)
}

/// Warps a dataset onto `grid` with nearest-neighbour resampling.
pub fn warp_to_grid(dataset: &Dataset, grid: &Grid) -> Result<Layer> {
    let args = WarpArgs::new()
        .extent(&grid.bounds())
        .size(grid.width, grid.height)
        .output_type("Float32")
        .dst_nodata(NODATA)
        .format("MEM");
    let warped = gdal_ext::warp(dataset, None, &args)?;
    let mut layer = read_dataset(&warped)?;
    layer.grid = grid.clone();
    Ok(layer)
}

/// Warps a dataset to `bounds`, at `res` degrees or at the source
/// resolution when `res` is `None`.
pub fn warp_to_bounds(dataset: &Dataset, bounds: &Bounds, res: Option<f64>) -> Result<Layer> {
    let mut args = WarpArgs::new().extent(bounds);
    if let Some(res) = res {
        args = args.resolution(res);
    }
    let args = args
        .output_type("Float32")
        .dst_nodata(NODATA)
        .format("MEM");
    let warped = gdal_ext::warp(dataset, None, &args)?;
    read_dataset(&warped)
}

/// Reads a raster file onto `grid`, warping only when the grids differ.
pub fn read_on_grid(path: &Path, grid: &Grid) -> Result<Layer> {
    let dataset = open_source(path)?;
    let own = Grid::from_dataset(&dataset)?;
    if own.aligned_with(grid) {
        let mut layer = read_dataset(&dataset)?;
        layer.grid = grid.clone();
        return Ok(layer);
    }
    warp_to_grid(&dataset, grid)
}

/// Like [`read_on_grid`] but a missing file reads as zeros.
pub fn read_on_grid_or_zero(path: &Path, grid: &Grid) -> Result<(Layer, bool)> {
    if path.exists() {
        Ok((read_on_grid(path, grid)?, true))
    } else {
        Ok((Layer::filled(grid.clone(), 0.0), false))
    }
}

/// Writes an LZW-compressed single-band GeoTIFF.
pub fn write_layer(path: &Path, layer: &Layer, kind: PixelType) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = RasterCreationOptions::from_iter(["COMPRESS=LZW"]);
    let (width, height) = (layer.grid.width, layer.grid.height);
    let mut dataset = match kind {
        PixelType::Float32 => driver
            .create_with_band_type_with_options::<f32, _>(path, width, height, 1, &options)?,
        PixelType::Byte => driver
            .create_with_band_type_with_options::<u8, _>(path, width, height, 1, &options)?,
    };
    dataset.set_geo_transform(&layer.grid.geo_transform)?;
    dataset.set_projection(&layer.grid.projection)?;
    layer.write_band(&dataset, kind)?;
    info!("Saved: {}", path.display());
    Ok(())
}

/// Fills nodata by inverse-distance interpolation from valid pixels up to
/// `max_search_dist` pixels away; farther pixels stay NaN.
pub fn fill_extrapolate(layer: &Layer, max_search_dist: f64) -> Result<Layer> {
    let dataset = layer.to_mem_dataset()?;
    {
        let mut band = dataset.rasterband(1)?;
        gdal_ext::fill_nodata(&mut band, max_search_dist)?;
    }
    let mut filled = read_dataset(&dataset)?;
    filled.grid = layer.grid.clone();
    Ok(filled)
}

/// Copies a raster file byte for byte; used for placeholder layers.
pub fn copy_placeholder(template: &Path, dst: &Path) -> Result<()> {
    if !template.exists() {
        return Err(PipelineError::MissingInput(template.to_path_buf()));
    }
    fs::copy(template, dst)?;
    info!("Created placeholder raster: {}", dst.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;
    use tempfile::TempDir;

    fn grid_2x3() -> Grid {
        Grid::from_bounds(&Bounds::new(104.0, 9.0, 104.75, 9.5), 0.25).unwrap()
    }

    #[test]
    fn test_grid_from_bounds() {
        let grid = grid_2x3();
        assert_eq!(grid.shape(), (2, 3));
        assert_eq!(grid.geo_transform, [104.0, 0.25, 0.0, 9.5, 0.0, -0.25]);
        assert_eq!(grid.bounds(), Bounds::new(104.0, 9.0, 104.75, 9.5));
        let (x, y) = grid.cell_center(1, 2);
        assert_relative_eq!(x, 104.625);
        assert_relative_eq!(y, 9.125);
    }

    #[test]
    fn test_grid_rejects_degenerate_extent() {
        assert!(Grid::from_bounds(&Bounds::new(0.0, 0.0, 0.1, 0.1), 0.25).is_err());
    }

    #[test]
    fn test_layer_shape_checked() {
        let err = Layer::new(grid_2x3(), Array2::zeros((3, 2))).unwrap_err();
        assert!(matches!(err, PipelineError::GridMismatch(2, 3, 3, 2)));
    }

    #[test]
    fn test_fill_nodata_constant() {
        let layer = Layer::new(grid_2x3(), arr2(&[[1.0, f32::NAN, 3.0], [f32::NAN, 5.0, 6.0]]))
            .unwrap()
            .fill_nodata(0.0);
        assert_eq!(layer.data, arr2(&[[1.0, 0.0, 3.0], [0.0, 5.0, 6.0]]));
    }

    #[test]
    fn test_crop_snaps_outwards() {
        let layer = Layer::new(grid_2x3(), arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]])).unwrap();
        let window = layer.crop(&Bounds::new(104.3, 9.1, 104.4, 9.2)).unwrap();
        assert_eq!(window.data, arr2(&[[5.0]]));
        assert_eq!(window.grid.geo_transform, [104.25, 0.25, 0.0, 9.25, 0.0, -0.25]);

        let wide = layer.crop(&Bounds::new(103.0, 8.0, 104.3, 9.4)).unwrap();
        assert_eq!(wide.data, arr2(&[[1.0, 2.0], [4.0, 5.0]]));
        assert!(layer.crop(&Bounds::new(110.0, 9.0, 111.0, 10.0)).is_none());
    }

    #[test]
    fn test_write_then_read_restores_nodata() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("PON_N09E104.tif");
        let layer =
            Layer::new(grid_2x3(), arr2(&[[0.5, f32::NAN, 1.0], [0.0, 0.25, f32::NAN]])).unwrap();
        write_layer(&path, &layer, PixelType::Float32).unwrap();

        let back = read_layer(&path).unwrap();
        assert!(back.grid.aligned_with(&layer.grid));
        assert_eq!(back.data[[0, 0]], 0.5);
        assert!(back.data[[0, 1]].is_nan());
        assert!(back.data[[1, 2]].is_nan());
        assert_eq!(back.valid_count(), 4);
    }

    #[test]
    fn test_byte_output_writes_nan_as_zero() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("DIL_N09E104_500.tif");
        let layer = Layer::new(grid_2x3(), arr2(&[[1.0, f32::NAN, 1.0], [0.0, 1.0, 0.0]])).unwrap();
        write_layer(&path, &layer, PixelType::Byte).unwrap();
        let back = read_layer(&path).unwrap();
        assert_eq!(back.data, arr2(&[[1.0, 0.0, 1.0], [0.0, 1.0, 0.0]]));
    }

    #[test]
    fn test_read_on_grid_resamples() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("coarse.tif");
        let coarse_grid = Grid::from_bounds(&Bounds::new(104.0, 9.0, 105.0, 10.0), 0.5).unwrap();
        let coarse = Layer::new(coarse_grid, arr2(&[[1.0, 2.0], [3.0, 4.0]])).unwrap();
        write_layer(&path, &coarse, PixelType::Float32).unwrap();

        let fine_grid = Grid::from_bounds(&Bounds::new(104.0, 9.0, 105.0, 10.0), 0.25).unwrap();
        let fine = read_on_grid(&path, &fine_grid).unwrap();
        assert_eq!(fine.data.dim(), (4, 4));
        assert_eq!(fine.data[[0, 0]], 1.0);
        assert_eq!(fine.data[[0, 3]], 2.0);
        assert_eq!(fine.data[[3, 0]], 3.0);
        assert_eq!(fine.data[[3, 3]], 4.0);
    }

    #[test]
    fn test_warp_onto_coarser_grid() {
        let fine_grid = Grid::from_bounds(&Bounds::new(104.0, 9.0, 105.0, 10.0), 0.25).unwrap();
        let fine = Layer::new(
            fine_grid,
            Array2::from_shape_fn((4, 4), |(r, c)| if r < 2 && c < 2 { 1.0 } else { 0.0 }),
        )
        .unwrap();
        let coarse_grid = Grid::from_bounds(&Bounds::new(104.0, 9.0, 105.0, 10.0), 0.5).unwrap();
        let coarse = fine.warp_onto(&coarse_grid).unwrap();
        assert_eq!(coarse.data.dim(), (2, 2));
        assert_eq!(coarse.data[[0, 0]], 1.0);
        assert_eq!(coarse.data[[1, 1]], 0.0);
    }

    #[test]
    fn test_read_on_grid_or_zero_for_missing() {
        let tmp = TempDir::new().unwrap();
        let (layer, existed) =
            read_on_grid_or_zero(&tmp.path().join("WAT_N09E104.tif"), &grid_2x3()).unwrap();
        assert!(!existed);
        assert!(layer.data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_fill_extrapolate_reaches_gaps() {
        let grid = Grid::from_bounds(&Bounds::new(0.0, 0.0, 1.0, 0.25), 0.25).unwrap();
        let layer = Layer::new(grid, arr2(&[[2.0, f32::NAN, f32::NAN, 2.0]])).unwrap();
        let filled = fill_extrapolate(&layer, 50.0).unwrap();
        assert_eq!(filled.valid_count(), 4);
        assert_relative_eq!(filled.data[[0, 1]], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_copy_placeholder() {
        let tmp = TempDir::new().unwrap();
        let ema = tmp.path().join("EMA_N09E104.tif");
        write_layer(&ema, &Layer::filled(grid_2x3(), 0.0), PixelType::Float32).unwrap();
        let dst = tmp.path().join("SUB_N09E104.tif");
        copy_placeholder(&ema, &dst).unwrap();
        assert_eq!(fs::read(&ema).unwrap(), fs::read(&dst).unwrap());
        assert!(copy_placeholder(&tmp.path().join("nope.tif"), &dst).is_err());
    }
}
