//! Tile identifiers for the 1°×1° processing grid.
//!
//! A tile id is written `<N|S><lat:02><E|W><lon:03>`, e.g. `N09E104`. The
//! hemisphere letters are kept explicitly so that `S00` and `N00` stay
//! distinct cells.
//!
//! [`Bounds`] is the degree extent used to build tile grids.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    north: bool,
    lat: u8,
    east: bool,
    lon: u16,
}

impl TileId {
    pub fn new(north: bool, lat: u8, east: bool, lon: u16) -> Result<Self> {
        if lat > 90 || lon > 180 {
            return Err(PipelineError::InvalidTileId(format!(
                "lat={lat} lon={lon} out of range"
            )));
        }
        Ok(Self {
            north,
            lat,
            east,
            lon,
        })
    }

    /// Builds the id of the cell whose reference corner is `(lat, lon)`.
    /// Fractions are truncated towards zero.
    pub fn from_lat_lon(lat: f64, lon: f64) -> Result<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(PipelineError::InvalidTileId(format!("{lat},{lon}")));
        }
        Self::new(
            lat >= 0.0,
            lat.abs().trunc() as u8,
            lon >= 0.0,
            lon.abs().trunc() as u16,
        )
    }

    /// Parses the `<E|W><lon>_<N|S><lat>` form used in the aquaculture
    /// classification file names (`W117_N32`), where the numbers are not
    /// zero padded.
    pub fn from_lon_lat_name(name: &str) -> Result<Self> {
        let invalid = || PipelineError::InvalidTileId(name.to_string());
        let (lon, lat) = name.split_once('_').ok_or_else(invalid)?;
        let (east, lon) = split_hemisphere(lon, 'E', 'W').ok_or_else(invalid)?;
        let (north, lat) = split_hemisphere(lat, 'N', 'S').ok_or_else(invalid)?;
        Self::new(
            north,
            lat.try_into().map_err(|_| invalid())?,
            east,
            lon.try_into().map_err(|_| invalid())?,
        )
    }

    /// Finds the first `_<E|W><digits>_<N|S><digits>` token pair in a file
    /// name and returns the normalized tile id.
    pub fn find_in_file_name(file_name: &str) -> Option<Self> {
        let tokens: Vec<&str> = file_name
            .trim_end_matches(".tif")
            .split(['_', '.'])
            .collect();
        tokens.windows(2).skip(1).find_map(|pair| {
            let joined = format!("{}_{}", pair[0], pair[1]);
            Self::from_lon_lat_name(&joined).ok()
        })
    }

    pub fn lat_degrees(&self) -> i32 {
        if self.north {
            self.lat as i32
        } else {
            -(self.lat as i32)
        }
    }

    pub fn lon_degrees(&self) -> i32 {
        if self.east {
            self.lon as i32
        } else {
            -(self.lon as i32)
        }
    }

    /// Inverse of [`TileId::from_lon_lat_name`], e.g. `E104_N9`.
    pub fn lon_lat_name(&self) -> String {
        format!(
            "{}{}_{}{}",
            if self.east { 'E' } else { 'W' },
            self.lon,
            if self.north { 'N' } else { 'S' },
            self.lat
        )
    }
}

fn split_hemisphere(token: &str, positive: char, negative: char) -> Option<(bool, u32)> {
    let mut chars = token.chars();
    let hemisphere = match chars.next()? {
        c if c == positive => true,
        c if c == negative => false,
        _ => return None,
    };
    let digits = chars.as_str();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((hemisphere, digits.parse().ok()?))
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:02}{}{:03}",
            if self.north { 'N' } else { 'S' },
            self.lat,
            if self.east { 'E' } else { 'W' },
            self.lon
        )
    }
}

impl FromStr for TileId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PipelineError::InvalidTileId(s.to_string());
        if s.len() != 7 || !s.is_ascii() {
            return Err(invalid());
        }
        let (north, lat) = split_hemisphere(&s[..3], 'N', 'S').ok_or_else(invalid)?;
        let (east, lon) = split_hemisphere(&s[3..], 'E', 'W').ok_or_else(invalid)?;
        Self::new(north, lat as u8, east, lon as u16)
    }
}

impl Ord for TileId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for TileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Axis-aligned extent in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Snaps each edge to the nearest whole degree.
    pub fn rounded(&self) -> Self {
        Self::new(
            self.min_x.round(),
            self.min_y.round(),
            self.max_x.round(),
            self.max_y.round(),
        )
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn is_empty(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    pub fn union(&self, other: &Bounds) -> Self {
        Self::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }
}

impl Serialize for TileId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_pads_numbers() {
        let tile = TileId::new(true, 9, true, 104).unwrap();
        assert_eq!(tile.to_string(), "N09E104");
        let tile = TileId::new(false, 1, false, 7).unwrap();
        assert_eq!(tile.to_string(), "S01W007");
    }

    #[test]
    fn test_parse_roundtrip_keeps_hemisphere_of_zero() {
        let tile: TileId = "S00E117".parse().unwrap();
        assert_eq!(tile.to_string(), "S00E117");
        assert_ne!(tile, "N00E117".parse::<TileId>().unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("N9E104".parse::<TileId>().is_err());
        assert!("X09E104".parse::<TileId>().is_err());
        assert!("N09E1O4".parse::<TileId>().is_err());
        assert!("N95E104".parse::<TileId>().is_err());
    }

    #[test]
    fn test_from_lat_lon_truncates() {
        assert_eq!(TileId::from_lat_lon(9.0, 104.0).unwrap().to_string(), "N09E104");
        assert_eq!(TileId::from_lat_lon(-6.0, 110.0).unwrap().to_string(), "S06E110");
        assert_eq!(TileId::from_lat_lon(32.7, -117.2).unwrap().to_string(), "N32W117");
    }

    #[test]
    fn test_from_lon_lat_name() {
        let tile = TileId::from_lon_lat_name("W117_N32").unwrap();
        assert_eq!(tile.to_string(), "N32W117");
        assert!(TileId::from_lon_lat_name("N32_W117").is_err());
    }

    #[test]
    fn test_lon_lat_name_drops_padding() {
        let tile: TileId = "N09E104".parse().unwrap();
        assert_eq!(tile.lon_lat_name(), "E104_N9");
        let tile: TileId = "S00W007".parse().unwrap();
        assert_eq!(tile.lon_lat_name(), "W7_S0");
        assert_eq!(TileId::from_lon_lat_name(&tile.lon_lat_name()).unwrap(), tile);
    }

    #[test]
    fn test_find_in_file_name() {
        let tile = TileId::find_in_file_name("aquaculture_E104_N9_2020_v1exp.tif").unwrap();
        assert_eq!(tile.to_string(), "N09E104");
        assert!(TileId::find_in_file_name("mosaic_2020.tif").is_none());
    }

    #[test]
    fn test_signed_degrees() {
        let tile: TileId = "S06W110".parse().unwrap();
        assert_eq!(tile.lat_degrees(), -6);
        assert_eq!(tile.lon_degrees(), -110);
    }

    #[test]
    fn test_bounds_rounding_and_overlap() {
        let b = Bounds::new(103.9999999, 8.99999, 105.00001, 10.0);
        assert_eq!(b.rounded(), Bounds::new(104.0, 9.0, 105.0, 10.0));
        assert!(b.intersects(&Bounds::new(104.5, 9.5, 106.0, 11.0)));
        assert!(!b.intersects(&Bounds::new(106.0, 9.0, 107.0, 10.0)));
        assert!(Bounds::new(1.0, 1.0, 1.0, 2.0).is_empty());
    }

    #[test]
    fn test_ordering_follows_id_text() {
        let mut tiles: Vec<TileId> = ["S02E117", "N09E104", "S01E117"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        tiles.sort();
        let names: Vec<String> = tiles.iter().map(|t| t.to_string()).collect();
        assert_eq!(names, ["N09E104", "S01E117", "S02E117"]);
    }
}
