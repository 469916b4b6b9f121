//! Thin wrappers over the GDAL utility programs (`gdalwarp`,
//! `gdal_translate`, `gdalbuildvrt`, `gdal_rasterize`) and `GDALFillNodata`,
//! called through the C API.

use std::ffi::{CStr, CString};
use std::path::Path;
use std::ptr;

use gdal::cpl::CslStringList;
use gdal::raster::RasterBand;
use gdal::Dataset;
use libc::{c_char, c_int};

use crate::error::{PipelineError, Result};
use crate::tile::Bounds;

fn last_gdal_error() -> String {
    unsafe {
        let msg = gdal_sys::CPLGetLastErrorMsg();
        if msg.is_null() {
            return String::from("unknown error");
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

fn string_list(args: &[String]) -> Result<CslStringList> {
    let mut list = CslStringList::new();
    for arg in args {
        list.add_string(arg)?;
    }
    Ok(list)
}

fn path_cstring(path: &Path) -> Result<CString> {
    Ok(CString::new(path.to_string_lossy().as_ref())?)
}

/// Wraps a returned dataset handle, or reports the utility failure.
fn wrap_handle(
    utility: &'static str,
    handle: gdal_sys::GDALDatasetH,
    usage_error: c_int,
) -> Result<Dataset> {
    if usage_error != 0 {
        return Err(PipelineError::GdalUtility(
            utility,
            "invalid arguments".to_string(),
        ));
    }
    if handle.is_null() {
        return Err(PipelineError::GdalUtility(utility, last_gdal_error()));
    }
    Ok(unsafe { Dataset::from_c_dataset(handle) })
}

struct WarpAppOptions(*mut gdal_sys::GDALWarpAppOptions);

impl WarpAppOptions {
    fn new(args: &[String]) -> Result<Self> {
        let list = string_list(args)?;
        let options = unsafe { gdal_sys::GDALWarpAppOptionsNew(list.as_ptr(), ptr::null_mut()) };
        if options.is_null() {
            return Err(PipelineError::GdalUtility("GDALWarp", last_gdal_error()));
        }
        Ok(Self(options))
    }
}

impl Drop for WarpAppOptions {
    fn drop(&mut self) {
        unsafe { gdal_sys::GDALWarpAppOptionsFree(self.0) };
    }
}

struct TranslateOptions(*mut gdal_sys::GDALTranslateOptions);

impl TranslateOptions {
    fn new(args: &[String]) -> Result<Self> {
        let list = string_list(args)?;
        let options = unsafe { gdal_sys::GDALTranslateOptionsNew(list.as_ptr(), ptr::null_mut()) };
        if options.is_null() {
            return Err(PipelineError::GdalUtility("GDALTranslate", last_gdal_error()));
        }
        Ok(Self(options))
    }
}

impl Drop for TranslateOptions {
    fn drop(&mut self) {
        unsafe { gdal_sys::GDALTranslateOptionsFree(self.0) };
    }
}

struct BuildVrtOptions(*mut gdal_sys::GDALBuildVRTOptions);

impl BuildVrtOptions {
    fn new(args: &[String]) -> Result<Self> {
        let list = string_list(args)?;
        let options = unsafe { gdal_sys::GDALBuildVRTOptionsNew(list.as_ptr(), ptr::null_mut()) };
        if options.is_null() {
            return Err(PipelineError::GdalUtility("GDALBuildVRT", last_gdal_error()));
        }
        Ok(Self(options))
    }
}

impl Drop for BuildVrtOptions {
    fn drop(&mut self) {
        unsafe { gdal_sys::GDALBuildVRTOptionsFree(self.0) };
    }
}

struct RasterizeOptions(*mut gdal_sys::GDALRasterizeOptions);

impl RasterizeOptions {
    fn new(args: &[String]) -> Result<Self> {
        let list = string_list(args)?;
        let options = unsafe { gdal_sys::GDALRasterizeOptionsNew(list.as_ptr(), ptr::null_mut()) };
        if options.is_null() {
            return Err(PipelineError::GdalUtility("GDALRasterize", last_gdal_error()));
        }
        Ok(Self(options))
    }
}

impl Drop for RasterizeOptions {
    fn drop(&mut self) {
        unsafe { gdal_sys::GDALRasterizeOptionsFree(self.0) };
    }
}

/// Argument builder for `gdalwarp`. Always reprojects to EPSG:4326 with
/// nearest-neighbour resampling.
#[derive(Debug, Clone)]
pub struct WarpArgs {
    args: Vec<String>,
}

impl Default for WarpArgs {
    fn default() -> Self {
        Self::new()
    }
}

impl WarpArgs {
    pub fn new() -> Self {
        Self {
            args: ["-t_srs", "EPSG:4326", "-r", "near"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn push(mut self, items: &[String]) -> Self {
        self.args.extend_from_slice(items);
        self
    }

    pub fn extent(self, bounds: &Bounds) -> Self {
        self.push(&[
            "-te".into(),
            bounds.min_x.to_string(),
            bounds.min_y.to_string(),
            bounds.max_x.to_string(),
            bounds.max_y.to_string(),
        ])
    }

    pub fn resolution(self, res: f64) -> Self {
        self.push(&["-tr".into(), res.to_string(), res.to_string()])
    }

    pub fn size(self, width: usize, height: usize) -> Self {
        self.push(&["-ts".into(), width.to_string(), height.to_string()])
    }

    pub fn output_type(self, ty: &str) -> Self {
        self.push(&["-ot".into(), ty.into()])
    }

    pub fn dst_nodata(self, value: f64) -> Self {
        self.push(&["-dstnodata".into(), value.to_string()])
    }

    pub fn format(self, driver: &str) -> Self {
        self.push(&["-of".into(), driver.into()])
    }

    pub fn creation_option(self, option: &str) -> Self {
        self.push(&["-co".into(), option.into()])
    }

    pub fn overwrite(self) -> Self {
        self.push(&["-overwrite".into()])
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }
}

/// Runs `gdalwarp`. With `dst == None` the output is an in-memory dataset
/// and `args` should select the `MEM` driver.
pub fn warp(src: &Dataset, dst: Option<&Path>, args: &WarpArgs) -> Result<Dataset> {
    let options = WarpAppOptions::new(args.as_slice())?;
    let dest = match dst {
        Some(path) => path_cstring(path)?,
        None => CString::new("")?,
    };
    let mut usage_error: c_int = 0;
    let handle = unsafe {
        gdal_sys::GDALWarp(
            dest.as_ptr(),
            ptr::null_mut(),
            1,
            &mut src.c_dataset(),
            options.0,
            &mut usage_error,
        )
    };
    wrap_handle("GDALWarp", handle, usage_error)
}

/// Runs `gdal_translate`.
pub fn translate(src: &Dataset, dst: &Path, args: &[String]) -> Result<Dataset> {
    let options = TranslateOptions::new(args)?;
    let dest = path_cstring(dst)?;
    let mut usage_error: c_int = 0;
    let handle =
        unsafe { gdal_sys::GDALTranslate(dest.as_ptr(), src.c_dataset(), options.0, &mut usage_error) };
    wrap_handle("GDALTranslate", handle, usage_error)
}

/// Runs `gdal_rasterize` from a vector dataset into an existing raster.
pub fn rasterize(src: &Dataset, dst: &Dataset, args: &[String]) -> Result<()> {
    let options = RasterizeOptions::new(args)?;
    let mut usage_error: c_int = 0;
    let handle = unsafe {
        gdal_sys::GDALRasterize(
            ptr::null(),
            dst.c_dataset(),
            src.c_dataset(),
            options.0,
            &mut usage_error,
        )
    };
    if usage_error != 0 {
        return Err(PipelineError::GdalUtility(
            "GDALRasterize",
            "invalid arguments".to_string(),
        ));
    }
    if handle.is_null() {
        return Err(PipelineError::GdalUtility("GDALRasterize", last_gdal_error()));
    }
    Ok(())
}

/// Runs `gdalbuildvrt` over dataset names, which may be `/vsizip/` paths.
pub fn build_vrt(dst: &Path, sources: &[String]) -> Result<Dataset> {
    if sources.is_empty() {
        return Err(PipelineError::GdalUtility(
            "GDALBuildVRT",
            "no source datasets".to_string(),
        ));
    }
    let options = BuildVrtOptions::new(&[])?;
    let dest = path_cstring(dst)?;
    let names = sources
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let name_ptrs: Vec<*const c_char> = names.iter().map(|n| n.as_ptr()).collect();
    let mut usage_error: c_int = 0;
    let handle = unsafe {
        gdal_sys::GDALBuildVRT(
            dest.as_ptr(),
            name_ptrs.len() as c_int,
            ptr::null_mut(),
            name_ptrs.as_ptr(),
            options.0,
            &mut usage_error,
        )
    };
    wrap_handle("GDALBuildVRT", handle, usage_error)
}

/// Interpolates nodata pixels of `band` from valid pixels up to
/// `max_search_dist` pixels away. The band must carry a nodata value.
pub fn fill_nodata(band: &mut RasterBand, max_search_dist: f64) -> Result<()> {
    let rv = unsafe {
        gdal_sys::GDALFillNodata(
            band.c_rasterband(),
            ptr::null_mut(),
            max_search_dist,
            0,
            0,
            ptr::null_mut(),
            None,
            ptr::null_mut(),
        )
    };
    if rv != gdal_sys::CPLErr::CE_None {
        return Err(PipelineError::GdalUtility("GDALFillNodata", last_gdal_error()));
    }
    Ok(())
}
