//! Global mosaics assembled from zipped GeoTIFF archives. Members are
//! addressed through GDAL's `/vsizip/` handler so nothing is extracted.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{PipelineError, Result};
use crate::gdal_ext;
use crate::layout::StageDir;
use crate::pipeline::Pipeline;

/// Names of the regular files stored in a zip archive.
pub fn zip_members(archive: &Path) -> Result<Vec<String>> {
    let zip = zip::ZipArchive::new(File::open(archive)?)?;
    let mut names: Vec<String> = zip
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(str::to_string)
        .collect();
    names.sort();
    Ok(names)
}

pub fn vsizip_path(archive: &Path, member: &str) -> String {
    format!("/vsizip/{}/{}", archive.display(), member)
}

/// `*.zip` files directly inside `dir`, sorted.
fn zip_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingInput(dir.to_path_buf()));
    }
    let mut archives: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "zip"))
        .collect();
    archives.sort();
    Ok(archives)
}

/// `/vsizip/` names of every member accepted by `keep`.
fn collect_members(archives: &[PathBuf], keep: impl Fn(&str) -> bool) -> Result<Vec<String>> {
    let mut sources = Vec::new();
    for archive in archives {
        for member in zip_members(archive)? {
            if keep(&member) {
                sources.push(vsizip_path(archive, &member));
            }
        }
    }
    Ok(sources)
}

fn write_vrt(dst: &Path, sources: &[String]) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    info!("Building {} from {} rasters", dst.display(), sources.len());
    gdal_ext::build_vrt(dst, sources)?;
    info!("Saved: {}", dst.display());
    Ok(())
}

/// Classification rasters of the configured year.
pub fn is_clark_member(member: &str, year: i32) -> bool {
    member.ends_with(&format!("_{year}_v1exp.tif")) || member.ends_with(&format!("_{year}_v2exp.tif"))
}

pub fn clark(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let archives = zip_archives(&config.clark_files)?;
    let sources = collect_members(&archives, |m| is_clark_member(m, config.clark_year))?;
    write_vrt(&config.clark_vrt, &sources)
}

/// The DeltaDTM mask archive, which is not part of the elevation mosaic.
pub fn is_mask_archive(archive: &Path) -> bool {
    archive
        .file_name()
        .is_some_and(|name| name == "mask_tiles.zip")
}

pub fn deltadtm(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let archives: Vec<PathBuf> = zip_archives(&config.deltadtm_files)?
        .into_iter()
        .filter(|a| !is_mask_archive(a))
        .collect();
    let sources = collect_members(&archives, |m| m.ends_with(".tif"))?;
    write_vrt(&config.deltadtm_vrt, &sources)
}

/// One mosaic per GMW year, from `4_GMW/gmw_v3_<year>_gtiff.zip`.
pub fn gmw(pipeline: &Pipeline) -> Result<()> {
    let layout = pipeline.layout();
    layout.ensure(StageDir::Gmw)?;
    for &year in &pipeline.config().gmw_years {
        let archive = layout.gmw_zip(year);
        if !archive.exists() {
            warn!("Missing GMW archive {}", archive.display());
            continue;
        }
        let sources = collect_members(&[archive], |m| m.ends_with(".tif"))?;
        write_vrt(&layout.gmw_vrt(year), &sources)?;
    }
    Ok(())
}
