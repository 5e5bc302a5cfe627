use thiserror::Error;

/// Error taxonomy for the structure-discovery pipeline.
///
/// Every stage fails fast at its own boundary: a condition is reported where
/// it is detected, and no stage attempts silent repair beyond the documented
/// zero-variance drop in the confound adjuster.
#[derive(Error, Debug)]
pub enum StructureError {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("degenerate data: {0}")]
    DegenerateData(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StructureError>;
