//! Mangrove restoration potential: a per-tile raster pipeline over GDAL.
//!
//! Each stage reads the shared JSON configuration, finds the tiles prepared
//! by earlier stages under the data directory and writes its own layers
//! next to them.

pub mod algebra;
pub mod aquaculture;
pub mod config;
pub mod error;
pub mod gdal_ext;
pub mod layout;
pub mod model;
pub mod morphology;
pub mod mosaic;
pub mod pipeline;
pub mod raster;
pub mod record;
pub mod sample;
pub mod stages;
pub mod tile;
pub mod vector;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
pub use stages::Stage;
