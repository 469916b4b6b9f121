//! Pipeline stages. Each stage reads the outputs of earlier stages from the
//! data tree, processes every tile independently and writes its own layers
//! and CSV logs.

use std::fmt;

use clap::ValueEnum;
use log::warn;

use crate::error::Result;
use crate::pipeline::Pipeline;

pub mod elevation;
pub mod gmw;
pub mod landcover;
pub mod mask;
pub mod ponds;
pub mod potential;
pub mod proximity;
pub mod subsidence;
pub mod tides;
pub mod tiles;
pub mod vrt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    Tiles,
    ClarkVrt,
    Ponds,
    Tides,
    DeltadtmVrt,
    Elevation,
    Intertidal,
    Accommodation,
    GmwVrt,
    Gmw,
    Recruitment,
    GmwResample,
    GmwProximity,
    SeedDispersal,
    CoastlineRivers,
    CoastlineProximity,
    RiverProximity,
    SubsidenceClip,
    Subsidence,
    Landcover,
    EmptyAreas,
    Potential,
    /// Every stage above, in order.
    All,
}

impl Stage {
    /// Execution order used by [`Stage::All`].
    pub const ORDER: [Stage; 22] = [
        Stage::Tiles,
        Stage::ClarkVrt,
        Stage::Ponds,
        Stage::Tides,
        Stage::DeltadtmVrt,
        Stage::Elevation,
        Stage::Intertidal,
        Stage::Accommodation,
        Stage::GmwVrt,
        Stage::Gmw,
        Stage::Recruitment,
        Stage::GmwResample,
        Stage::GmwProximity,
        Stage::SeedDispersal,
        Stage::CoastlineRivers,
        Stage::CoastlineProximity,
        Stage::RiverProximity,
        Stage::SubsidenceClip,
        Stage::Subsidence,
        Stage::Landcover,
        Stage::EmptyAreas,
        Stage::Potential,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Tiles => "tiles",
            Stage::ClarkVrt => "clark-vrt",
            Stage::Ponds => "ponds",
            Stage::Tides => "tides",
            Stage::DeltadtmVrt => "deltadtm-vrt",
            Stage::Elevation => "elevation",
            Stage::Intertidal => "intertidal",
            Stage::Accommodation => "accommodation",
            Stage::GmwVrt => "gmw-vrt",
            Stage::Gmw => "gmw",
            Stage::Recruitment => "recruitment",
            Stage::GmwResample => "gmw-resample",
            Stage::GmwProximity => "gmw-proximity",
            Stage::SeedDispersal => "seed-dispersal",
            Stage::CoastlineRivers => "coastline-rivers",
            Stage::CoastlineProximity => "coastline-proximity",
            Stage::RiverProximity => "river-proximity",
            Stage::SubsidenceClip => "subsidence-clip",
            Stage::Subsidence => "subsidence",
            Stage::Landcover => "landcover",
            Stage::EmptyAreas => "empty-areas",
            Stage::Potential => "potential",
            Stage::All => "all",
        }
    }

    fn execute(&self, pipeline: &Pipeline) -> Result<()> {
        match self {
            Stage::Tiles => tiles::run(pipeline),
            Stage::ClarkVrt => vrt::clark(pipeline),
            Stage::Ponds => ponds::run(pipeline),
            Stage::Tides => tides::run(pipeline),
            Stage::DeltadtmVrt => vrt::deltadtm(pipeline),
            Stage::Elevation => elevation::elevation(pipeline),
            Stage::Intertidal => elevation::intertidal(pipeline),
            Stage::Accommodation => elevation::accommodation(pipeline),
            Stage::GmwVrt => vrt::gmw(pipeline),
            Stage::Gmw => gmw::fill(pipeline),
            Stage::Recruitment => gmw::recruitment(pipeline),
            Stage::GmwResample => gmw::resample(pipeline),
            Stage::GmwProximity => gmw::proximity(pipeline),
            Stage::SeedDispersal => gmw::seed_dispersal(pipeline),
            Stage::CoastlineRivers => proximity::coastline_rivers(pipeline),
            Stage::CoastlineProximity => proximity::coastline(pipeline),
            Stage::RiverProximity => proximity::rivers(pipeline),
            Stage::SubsidenceClip => subsidence::clip(pipeline),
            Stage::Subsidence => subsidence::run(pipeline),
            Stage::Landcover => landcover::run(pipeline),
            Stage::EmptyAreas => mask::run(pipeline),
            Stage::Potential => potential::run(pipeline),
            Stage::All => {
                for stage in Stage::ORDER {
                    stage.run(pipeline)?;
                }
                Ok(())
            }
        }
    }

    /// Runs the stage and records its wall time in the timing log.
    pub fn run(&self, pipeline: &Pipeline) -> Result<()> {
        if *self == Stage::All {
            return self.execute(pipeline);
        }
        pipeline.timed(self.name(), |p| self.execute(p))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logs the tiles a stage could not process.
pub(crate) fn report_failures(stage: &str, failures: &[(crate::tile::TileId, String)]) {
    for (tile, reason) in failures {
        warn!("{stage}: skipped tile {tile}: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_cli_values() {
        for stage in Stage::ORDER.iter().chain([Stage::All].iter()) {
            let value = stage.to_possible_value().unwrap();
            assert_eq!(value.get_name(), stage.name());
        }
    }

    #[test]
    fn test_order_covers_every_stage_once() {
        let mut names: Vec<&str> = Stage::ORDER.iter().map(|s| s.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Stage::ORDER.len());
        assert_eq!(Stage::value_variants().len(), Stage::ORDER.len() + 1);
    }
}
