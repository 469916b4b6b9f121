//! Numbered stage directories and deterministic file naming.
//!
//! Every per-tile artifact lives at
//! `<data_dir>/<stage dir>/<country>/<PFX>_<tile id>[_<suffix>].<ext>`.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::Result;
use crate::tile::TileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageDir {
    Tiles,
    Clark,
    Gmw,
    Rivers,
    Elevation,
    Tides,
    Accommodation,
    Landcover,
    Subsidence,
    Coastline,
    PermanentWater,
    Mask,
    Potential,
}

impl StageDir {
    pub fn name(&self) -> &'static str {
        match self {
            StageDir::Tiles => "1_Tiles",
            StageDir::Clark => "3_Clark_classification",
            StageDir::Gmw => "4_GMW",
            StageDir::Rivers => "6_Rivers",
            StageDir::Elevation => "7_Elevation",
            StageDir::Tides => "8_Tides",
            StageDir::Accommodation => "10_Accommodation_space",
            StageDir::Landcover => "11_Landcover",
            StageDir::Subsidence => "12_Subsidence",
            StageDir::Coastline => "13_Coastline",
            StageDir::PermanentWater => "14_Permanent_water",
            StageDir::Mask => "15_Mask",
            StageDir::Potential => "16_Mangrove_potential",
        }
    }
}

/// Layer prefixes.
pub mod prefix {
    pub const TIL: &str = "TIL";
    pub const PON: &str = "PON";
    pub const GTS: &str = "GTS";
    pub const ELE: &str = "ELE";
    pub const MSL: &str = "MSL";
    pub const HAT: &str = "HAT";
    pub const BEY: &str = "BEY";
    pub const ACC: &str = "ACC";
    pub const GMW: &str = "GMW";
    pub const REC: &str = "REC";
    pub const REP: &str = "REP";
    pub const DIL: &str = "DIL";
    pub const SEE: &str = "SEE";
    pub const COA: &str = "COA";
    pub const RIV: &str = "RIV";
    pub const OVE: &str = "OVE";
    pub const PRC: &str = "PRC";
    pub const PRR: &str = "PRR";
    pub const CLI: &str = "CLI";
    pub const SUB: &str = "SUB";
    pub const LAN: &str = "LAN";
    pub const WAT: &str = "WAT";
    pub const EMA: &str = "EMA";
    pub const NVA: &str = "NVA";
    pub const MPM: &str = "MPM";
}

/// `<PFX>_<id>[_<suffix>]`
pub fn layer_name(prefix: &str, tile: &TileId, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{prefix}_{tile}_{suffix}"),
        None => format!("{prefix}_{tile}"),
    }
}

#[derive(Debug, Clone)]
pub struct Layout {
    data_dir: PathBuf,
    country: String,
}

impl Layout {
    pub fn new(data_dir: impl Into<PathBuf>, country: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            country: country.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    /// Root of a stage, shared by every country (`<data_dir>/<stage>`).
    pub fn stage_root(&self, stage: StageDir) -> PathBuf {
        self.data_dir.join(stage.name())
    }

    pub fn dir(&self, stage: StageDir) -> PathBuf {
        self.stage_root(stage).join(&self.country)
    }

    /// Creates the stage directory if needed and returns it.
    pub fn ensure(&self, stage: StageDir) -> Result<PathBuf> {
        let dir = self.dir(stage);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn raster(
        &self,
        stage: StageDir,
        prefix: &str,
        tile: &TileId,
        suffix: Option<&str>,
    ) -> PathBuf {
        self.dir(stage)
            .join(format!("{}.tif", layer_name(prefix, tile, suffix)))
    }

    pub fn vector(
        &self,
        stage: StageDir,
        prefix: &str,
        tile: &TileId,
        suffix: Option<&str>,
    ) -> PathBuf {
        self.dir(stage)
            .join(format!("{}.geojson", layer_name(prefix, tile, suffix)))
    }

    /// `1_Tiles/<country>/TIL_<id>_<buffer>.geojson`; buffer `0` is the tile
    /// itself.
    pub fn tile_vector(&self, tile: &TileId, buffer_m: u32) -> PathBuf {
        self.vector(StageDir::Tiles, prefix::TIL, tile, Some(&buffer_m.to_string()))
    }

    /// Catalog files are written next to the country directories.
    pub fn catalog(&self, file_name: &str) -> PathBuf {
        self.stage_root(StageDir::Tiles).join(file_name)
    }

    /// Yearly GMW archive shared by every country.
    pub fn gmw_zip(&self, year: i32) -> PathBuf {
        self.stage_root(StageDir::Gmw)
            .join(format!("gmw_v3_{year}_gtiff.zip"))
    }

    pub fn gmw_vrt(&self, year: i32) -> PathBuf {
        self.dir(StageDir::Gmw).join(format!("gmw_v3_{year}_gtiff.vrt"))
    }

    pub fn timing_log(&self) -> PathBuf {
        self.data_dir.join("timing_log.txt")
    }

    /// Tiles with a `TIL_<id>_<buffer>.geojson` file, sorted by id.
    pub fn discover_tiles(&self, buffer_m: u32) -> Result<Vec<TileId>> {
        let suffix = format!("_{buffer_m}.geojson");
        self.discover(StageDir::Tiles, prefix::TIL, &suffix)
    }

    /// Tiles with a `<PFX>_<id>.tif` raster in a stage directory.
    pub fn discover_layer(&self, stage: StageDir, prefix: &str) -> Result<Vec<TileId>> {
        self.discover(stage, prefix, ".tif")
    }

    fn discover(&self, stage: StageDir, prefix: &str, suffix: &str) -> Result<Vec<TileId>> {
        let dir = self.dir(stage);
        let pattern = dir.join(format!("{prefix}_*{suffix}"));
        let mut tiles = Vec::new();
        for path in glob::glob(&pattern.to_string_lossy())?.flatten() {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let id = name
                .strip_prefix(&format!("{prefix}_"))
                .and_then(|rest| rest.strip_suffix(suffix));
            match id.map(str::parse::<TileId>) {
                Some(Ok(tile)) => tiles.push(tile),
                _ => warn!("Ignoring {}: not a tile file", path.display()),
            }
        }
        tiles.sort();
        tiles.dedup();
        Ok(tiles)
    }
}

/// Deletes each file, logging successes and warning on failures.
pub fn remove_temp_files<P: AsRef<Path>>(files: &[P]) {
    for file in files {
        let file = file.as_ref();
        match fs::remove_file(file) {
            Ok(()) => info!("Deleted temporary file: {}", file.display()),
            Err(e) => warn!("Error deleting temporary file {}: {e}", file.display()),
        }
    }
}

/// Removes GDAL `*.aux.xml` sidecars from a directory.
pub fn delete_aux_files(dir: &Path) {
    delete_matching(dir, "*.aux.xml");
}

/// Removes every `*.geojson` from a directory.
pub fn delete_vector_files(dir: &Path) {
    delete_matching(dir, "*.geojson");
}

fn delete_matching(dir: &Path, pattern: &str) {
    let pattern = dir.join(pattern);
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        return;
    };
    let files: Vec<PathBuf> = paths.flatten().collect();
    remove_temp_files(&files);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tile(id: &str) -> TileId {
        id.parse().unwrap()
    }

    #[test]
    fn test_raster_names_are_deterministic() {
        let layout = Layout::new("/data", "Indonesia");
        assert_eq!(
            layout.raster(StageDir::Clark, prefix::PON, &tile("S01E117"), None),
            PathBuf::from("/data/3_Clark_classification/Indonesia/PON_S01E117.tif")
        );
        assert_eq!(
            layout.raster(StageDir::Gmw, prefix::GMW, &tile("S01E117"), Some("2020")),
            PathBuf::from("/data/4_GMW/Indonesia/GMW_S01E117_2020.tif")
        );
        assert_eq!(
            layout.tile_vector(&tile("N09E104"), 200_000),
            PathBuf::from("/data/1_Tiles/Indonesia/TIL_N09E104_200000.geojson")
        );
        assert_eq!(
            layout.catalog("clark_tiles.geojson"),
            PathBuf::from("/data/1_Tiles/clark_tiles.geojson")
        );
    }

    #[test]
    fn test_discover_tiles_by_buffer() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), "VN");
        let dir = layout.ensure(StageDir::Tiles).unwrap();
        for name in [
            "TIL_S02E117_0.geojson",
            "TIL_N09E104_0.geojson",
            "TIL_N09E104_10000.geojson",
            "TIL_bogus_0.geojson",
        ] {
            fs::write(dir.join(name), "{}").unwrap();
        }
        let tiles = layout.discover_tiles(0).unwrap();
        assert_eq!(tiles, vec![tile("N09E104"), tile("S02E117")]);
        let buffered = layout.discover_tiles(10_000).unwrap();
        assert_eq!(buffered, vec![tile("N09E104")]);
    }

    #[test]
    fn test_discover_layer_skips_suffixed_files() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), "VN");
        let dir = layout.ensure(StageDir::Tides).unwrap();
        fs::write(dir.join("GTS_N09E104.tif"), "").unwrap();
        fs::write(dir.join("GTS_N09E104_tmp.tif"), "").unwrap();
        let tiles = layout.discover_layer(StageDir::Tides, prefix::GTS).unwrap();
        assert_eq!(tiles, vec![tile("N09E104")]);
    }

    #[test]
    fn test_discover_in_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), "VN");
        assert!(layout.discover_tiles(0).unwrap().is_empty());
    }

    #[test]
    fn test_delete_aux_files_keeps_rasters() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("PON_N09E104.tif"), "").unwrap();
        fs::write(tmp.path().join("PON_N09E104.tif.aux.xml"), "").unwrap();
        delete_aux_files(tmp.path());
        assert!(tmp.path().join("PON_N09E104.tif").exists());
        assert!(!tmp.path().join("PON_N09E104.tif.aux.xml").exists());
    }

    #[test]
    fn test_remove_temp_files_tolerates_missing() {
        let tmp = TempDir::new().unwrap();
        let present = tmp.path().join("a.tif");
        fs::write(&present, "").unwrap();
        remove_temp_files(&[present.clone(), tmp.path().join("missing.tif")]);
        assert!(!present.exists());
    }
}
