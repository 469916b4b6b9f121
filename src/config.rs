use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::tile::TileId;

/// Pixel values a multiplier table could not score.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unmapped {
    /// Integral values with no entry.
    pub classes: BTreeSet<i64>,
    /// Pixels holding a non-integral value.
    pub fractional: usize,
}

impl Unmapped {
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.fractional == 0
    }
}

/// Lookup table from a raw class value to a score in `[0, 100]`.
///
/// JSON keys are strings (`{"1": 50, "2": 89}`); they must parse as
/// integers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>")]
pub struct Multipliers(BTreeMap<i64, f64>);

impl Multipliers {
    pub fn new(entries: impl IntoIterator<Item = (i64, f64)>) -> Result<Self> {
        let table: BTreeMap<i64, f64> = entries.into_iter().collect();
        for (class, score) in &table {
            if !(0.0..=100.0).contains(score) {
                return Err(PipelineError::InvalidMultipliers(format!(
                    "score {score} for class {class} outside [0, 100]"
                )));
            }
        }
        Ok(Self(table))
    }

    /// Score of a pixel value. `None` for NaN; `Some(0.0)` recorded in
    /// `unmapped` when the value has no entry or is not integral.
    pub fn score(&self, value: f32, unmapped: &mut Unmapped) -> Option<f64> {
        if value.is_nan() {
            return None;
        }
        if value.fract() != 0.0 {
            unmapped.fractional += 1;
            return Some(0.0);
        }
        let class = value as i64;
        match self.0.get(&class) {
            Some(score) => Some(*score),
            None => {
                unmapped.classes.insert(class);
                Some(0.0)
            }
        }
    }

    pub fn max_score(&self) -> f64 {
        self.0.values().copied().fold(0.0, f64::max)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

impl TryFrom<BTreeMap<String, f64>> for Multipliers {
    type Error = PipelineError;

    fn try_from(raw: BTreeMap<String, f64>) -> Result<Self> {
        let mut entries = Vec::with_capacity(raw.len());
        for (key, score) in raw {
            let class = key.trim().parse::<i64>().map_err(|_| {
                PipelineError::InvalidMultipliers(format!("class key {key:?} is not an integer"))
            })?;
            entries.push((class, score));
        }
        Self::new(entries)
    }
}

fn default_tile_buffers() -> Vec<u32> {
    vec![10_000, 200_000]
}

fn default_coastline_buffers() -> Vec<u32> {
    vec![500, 2_500, 5_000, 7_500]
}

fn default_coastline_river_buffer() -> u32 {
    30_000
}

fn default_river_buffers() -> Vec<u32> {
    vec![250, 500, 2_500]
}

/// Pipeline configuration, read from the shared JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub country_name: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub tiles_ids: Option<Vec<String>>,

    // Tile catalog
    pub global_tiles: PathBuf,
    pub clark_tiles: PathBuf,
    pub gmw_tiles: PathBuf,
    pub countries_geometries: PathBuf,
    #[serde(default = "default_tile_buffers")]
    pub tile_buffers: Vec<u32>,

    // Aquaculture ponds
    pub clark_files: PathBuf,
    pub clark_year: i32,
    pub clark_vrt: PathBuf,
    pub clark_multipliers: Multipliers,
    pub target_res_deg: f64,

    // Tides and elevation
    pub gtsm_points: PathBuf,
    pub deltadtm_files: PathBuf,
    pub deltadtm_vrt: PathBuf,
    pub deltadtm_mangrove_correction: f64,
    pub intertidal_slr_correction: f64,
    pub accommodation_multipliers: Multipliers,

    // Historical mangroves
    pub gmw_years: Vec<i32>,
    pub recruitment_gmw_years: Vec<i32>,
    pub recruitment_gmw_multipliers: Multipliers,
    pub gmw_last_year: i32,
    pub target_res_deg_for_seed_dispersal: f64,
    pub proximity_distances: Vec<u32>,
    pub proximity_gmw_multipliers: Multipliers,

    // Coastline and rivers
    pub rivers_geometries: PathBuf,
    pub coastline_geometries: PathBuf,
    pub proximity_coastline_multipliers: Multipliers,
    pub proximity_rivers_multipliers: Multipliers,
    #[serde(default = "default_coastline_buffers")]
    pub coastline_buffers: Vec<u32>,
    #[serde(default = "default_coastline_river_buffer")]
    pub coastline_river_buffer: u32,
    #[serde(default = "default_river_buffers")]
    pub river_buffers: Vec<u32>,

    // Subsidence
    pub subsidence_data_2010: PathBuf,
    pub subsidence_data_2040: PathBuf,
    pub subsidence_multipliers_2010: Multipliers,
    pub subsidence_multipliers_2040: Multipliers,

    // Land cover
    #[serde(default)]
    pub landcover_source: Option<PathBuf>,

    #[serde(default)]
    pub keep_intermediates: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::MissingInput(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.country_name.trim().is_empty() {
            return Err(PipelineError::Config("country_name is empty".into()));
        }
        for (name, res) in [
            ("target_res_deg", self.target_res_deg),
            (
                "target_res_deg_for_seed_dispersal",
                self.target_res_deg_for_seed_dispersal,
            ),
        ] {
            if !(res.is_finite() && res > 0.0) {
                return Err(PipelineError::Config(format!("{name} must be positive")));
            }
        }
        if self.proximity_distances.is_empty() {
            return Err(PipelineError::Config("proximity_distances is empty".into()));
        }
        if self.coastline_buffers.is_empty() || self.river_buffers.is_empty() {
            return Err(PipelineError::Config(
                "coastline_buffers and river_buffers need at least one entry".into(),
            ));
        }
        self.tile_filter()?;
        Ok(())
    }

    /// Parsed `tiles_ids`, or `None` to keep every tile.
    pub fn tile_filter(&self) -> Result<Option<BTreeSet<TileId>>> {
        self.tiles_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.parse::<TileId>()).collect())
            .transpose()
    }

    pub fn subsidence_source(&self, year: SubsidenceYear) -> &Path {
        match year {
            SubsidenceYear::Y2010 => &self.subsidence_data_2010,
            SubsidenceYear::Y2040 => &self.subsidence_data_2040,
        }
    }

    pub fn subsidence_multipliers(&self, year: SubsidenceYear) -> &Multipliers {
        match year {
            SubsidenceYear::Y2010 => &self.subsidence_multipliers_2010,
            SubsidenceYear::Y2040 => &self.subsidence_multipliers_2040,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsidenceYear {
    Y2010,
    Y2040,
}

impl SubsidenceYear {
    pub const ALL: [SubsidenceYear; 2] = [SubsidenceYear::Y2010, SubsidenceYear::Y2040];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubsidenceYear::Y2010 => "2010",
            SubsidenceYear::Y2040 => "2040",
        }
    }
}
