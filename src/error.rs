//! Error types for orbitforge subsystems.
//!
//! Defines error types for all major subsystems:
//! - Parameter-set parsing and validation
//! - Granule discovery and workspace layout
//! - Per-job stage execution
//! - Image rendering and similarity scoring collaborators
//! - Worker pool dispatch
//! - Checkpoint report writing and resume parsing

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while parsing and validating parameter sets.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed parameter line '{0}': expected 'KEY: value'")]
    MalformedLine(String),

    #[error("Parameter key '{0}' is not upper-case")]
    LowercaseKey(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Comparison list '{0}' must be comma-separated 'left=right' pairs")]
    ComparePairShape(String),

    #[error("Invalid dataset reference '{reference}': {reason}")]
    BadDatasetRef { reference: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during granule discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid orbit range '{token}': {reason}")]
    InvalidRange { token: String, reason: String },

    #[error("No input granule found for {} requested orbit(s): {orbits:?}", orbits.len())]
    MissingOrbits { orbits: Vec<u32> },

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the pre-flight tool checks.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Tool '{0}' is not resolvable on PATH")]
    ToolNotFound(String),

    #[error("Tool path '{0}' does not exist")]
    ToolMissing(PathBuf),
}

/// Errors that can occur while executing a single job stage.
///
/// Stage errors are local to a job: they are recorded on the job's
/// outcome and never abort the run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Conversion tool exited with status {code}")]
    ToolFailed { code: i32 },

    #[error("Conversion tool was terminated by a signal")]
    ToolKilled,

    #[error("Validator exited with status {code}")]
    ValidatorFailed { code: i32 },

    #[error("Validator was terminated by a signal")]
    ValidatorKilled,

    #[error("Image stage failed: {0}")]
    Render(#[from] RenderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the image renderer and similarity scorer collaborators.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Missing parameter '{0}' required for image generation")]
    MissingParameter(String),

    #[error("Invalid selector '{selector}' for {instrument}: {reason}")]
    InvalidSelector {
        instrument: String,
        selector: String,
        reason: String,
    },

    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("Dataset '{0}' was not rendered by this job")]
    NotRendered(String),

    #[error("No image renderer configured but the workflow requests images")]
    NoRenderer,

    #[error("No similarity scorer configured but the workflow requests comparisons")]
    NoScorer,

    #[error("Renderer exited with status {code}: {stderr}")]
    RendererFailed { code: i32, stderr: String },

    #[error("Scorer exited with status {code}: {stderr}")]
    ScorerFailed { code: i32, stderr: String },

    #[error("Scorer output '{0}' is not a number")]
    BadScore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool returned {returned} of {expected} job results")]
    Incomplete { expected: usize, returned: usize },
}

/// Errors that can occur while writing or parsing checkpoint reports.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Malformed record line '{0}': expected 'attribute: value'")]
    MalformedLine(String),

    #[error("Record is missing required attribute '{0}'")]
    MissingAttribute(&'static str),

    #[error("Unknown attribute '{0}' in record")]
    UnknownAttribute(String),

    #[error("Invalid value '{value}' for '{attribute}': {reason}")]
    InvalidValue {
        attribute: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid parameters in record: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
