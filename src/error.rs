use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("String contains an interior NUL byte: {0}")]
    Nul(#[from] std::ffi::NulError),

    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Point index error: {0:?}")]
    KdTree(kdtree::ErrorKind),

    #[error("Invalid tile id: {0}")]
    InvalidTileId(String),

    #[error("Invalid multiplier table: {0}")]
    InvalidMultipliers(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Missing input: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Empty input: {}", .0.display())]
    EmptyInput(PathBuf),

    #[error("Raster grids differ: {0}x{1} vs {2}x{3}")]
    GridMismatch(usize, usize, usize, usize),

    #[error("{0} failed: {1}")]
    GdalUtility(&'static str, String),

    #[error("Model fitting failed: {0}")]
    Model(String),
}

impl From<kdtree::ErrorKind> for PipelineError {
    fn from(err: kdtree::ErrorKind) -> Self {
        PipelineError::KdTree(err)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
