//! Aggregation of per-tile layers: one VRT per layer prefix, and extraction
//! of a few tiles into a shareable folder.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;
use crate::gdal_ext;
use crate::tile::TileId;

/// Which `*.tif` files take part in a mosaic.
#[derive(Debug, Clone, Default)]
pub struct MosaicFilter {
    /// Keep only these tiles; every tile when `None`.
    pub tiles: Option<BTreeSet<TileId>>,
    /// Prefixes left out entirely.
    pub exclude: BTreeSet<String>,
    /// Prefixes restricted to files ending in `_<year>.tif`.
    pub year_only: BTreeMap<String, i32>,
}

impl MosaicFilter {
    pub fn accepts(&self, file_name: &str) -> bool {
        let Some(prefix) = file_prefix(file_name) else {
            return false;
        };
        if self.exclude.contains(prefix) {
            return false;
        }
        if let Some(year) = self.year_only.get(prefix) {
            if !file_name.ends_with(&format!("_{year}.tif")) {
                return false;
            }
        }
        match &self.tiles {
            Some(tiles) => file_tile(file_name).is_some_and(|tile| tiles.contains(&tile)),
            None => true,
        }
    }
}

/// Token before the first `_` of a `*.tif` name.
pub fn file_prefix(file_name: &str) -> Option<&str> {
    if !file_name.to_lowercase().ends_with(".tif") {
        return None;
    }
    let (prefix, _) = file_name.split_once('_')?;
    (!prefix.is_empty()).then_some(prefix)
}

/// Tile id in the second `_`-separated token, as in `SEE_N09E104.tif`.
pub fn file_tile(file_name: &str) -> Option<TileId> {
    let stem = file_name.strip_suffix(".tif").unwrap_or(file_name);
    stem.split('_').nth(1)?.parse().ok()
}

/// Every accepted raster under `root`, grouped by prefix and sorted.
pub fn group_by_prefix(root: &Path, filter: &MosaicFilter) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !filter.accepts(name) {
            continue;
        }
        if let Some(prefix) = file_prefix(name) {
            groups
                .entry(prefix.to_string())
                .or_default()
                .push(entry.path().to_path_buf());
        }
    }
    for files in groups.values_mut() {
        files.sort();
        files.dedup();
    }
    Ok(groups)
}

/// Writes `<out_dir>/<PREFIX>.vrt` for every group and returns the paths.
pub fn build_prefix_vrts(root: &Path, out_dir: &Path, filter: &MosaicFilter) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;
    let groups = group_by_prefix(root, filter)?;
    if groups.is_empty() {
        warn!("No matching .tif files found under {}", root.display());
    }
    let mut written = Vec::with_capacity(groups.len());
    for (prefix, files) in &groups {
        info!("{prefix}: {} files", files.len());
        let sources: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
        let vrt = out_dir.join(format!("{prefix}.vrt"));
        gdal_ext::build_vrt(&vrt, &sources)?;
        info!("VRT created at: {}", vrt.display());
        written.push(vrt);
    }
    Ok(written)
}

/// `dir/name`, or `dir/<stem>_<n>.<ext>` with the first free `n`.
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Copies the accepted rasters under `root` into `dest` without overwriting
/// and returns the copies.
pub fn extract(root: &Path, dest: &Path, filter: &MosaicFilter) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dest)?;
    let groups = group_by_prefix(root, filter)?;
    let mut copied = Vec::new();
    for (prefix, files) in &groups {
        info!("{prefix}: {} files", files.len());
        for file in files {
            if file.starts_with(dest) {
                continue;
            }
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let target = unique_destination(dest, name);
            fs::copy(file, &target)?;
            copied.push(target);
        }
    }
    info!("All filtered files copied to: {}", dest.display());
    Ok(copied)
}

/// Deflate archive of every file under `dir`, stored with relative names.
pub fn zip_dir(dir: &Path, zip_path: &Path) -> Result<()> {
    let mut writer = ZipWriter::new(File::create(zip_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative.to_string_lossy().replace('\\', "/");
        writer.start_file(name, options)?;
        io::copy(&mut File::open(entry.path())?, &mut writer)?;
    }
    writer.finish()?;
    info!("Folder compressed to ZIP: {}", zip_path.display());
    Ok(())
}
