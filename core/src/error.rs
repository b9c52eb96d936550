//! Error types for the filter and its collaborators.
//!
//! Per-particle failures (map training, map queries, likelihood evaluation) are
//! isolated by the orchestrator and never abort a filter cycle. Only
//! configuration problems are fatal, and they surface at startup.

use std::io;
use std::path::PathBuf;

/// Malformed or missing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read or write configuration: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported configuration file extension: {0}")]
    UnsupportedFormat(String),

    #[error("failed to parse {format} configuration: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    #[error("covariance `{value}` is malformed: {reason}")]
    Covariance { value: String, reason: String },

    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A static transform could not be resolved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformLookupError {
    #[error("no transform from `{source_frame}` to `{target_frame}`")]
    NotFound {
        target_frame: String,
        source_frame: String,
    },
}

/// Failure while fitting a map model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrainingError {
    #[error("input has {inputs} rows but {targets} targets")]
    LengthMismatch { inputs: usize, targets: usize },

    #[error("training inputs must have 2 columns, got {0}")]
    Dimension(usize),

    #[error("no training data")]
    Empty,

    #[error("training data contains non-finite values")]
    NonFinite,

    #[error("kernel matrix is not positive definite")]
    Numerical,
}

/// Failure while sampling a map model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("map model has never been fit")]
    NotFitted,

    #[error("query inputs must have 2 columns, got {0}")]
    Dimension(usize),
}

/// Any failure reported through the map model interface.
#[derive(Debug, thiserror::Error)]
pub enum MapModelError {
    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("map model i/o failed for {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("map model serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background training worker panicked")]
    Worker,

    #[error("no particle at index {0}")]
    UnknownParticle(usize),
}

/// The Gaussian likelihood of a ping could not be evaluated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LikelihoodError {
    #[error("residual has {residual} entries but covariance has {covariance}")]
    DimensionMismatch { residual: usize, covariance: usize },

    #[error("covariance is singular (variance {0} at a beam)")]
    Singular(f64),

    #[error("log-likelihood is not finite")]
    NonFinite,
}

/// Failure while writing the trajectory archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive i/o failed for {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to write csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Failure while loading a bathymetric mesh or sound-speed profile.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to parse mesh: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse sound speed profile: {0}")]
    Csv(#[from] csv::Error),

    #[error("face {face} references vertex {vertex} but mesh has {count} vertices")]
    InvalidFace {
        face: usize,
        vertex: usize,
        count: usize,
    },
}

/// Failure while reading logged sensor messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to read csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Inputs to a resampling step that do not match the particle cloud.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResampleError {
    #[error("expected one weight per particle ({expected}), got {actual}")]
    WeightCount { expected: usize, actual: usize },

    #[error("{lost} lost particles but {sources} sources")]
    UnpairedLost { lost: usize, sources: usize },

    #[error("particle index {index} out of range for {count} particles")]
    IndexOutOfRange { index: usize, count: usize },
}
