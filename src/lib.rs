//! orbitforge: distributed orchestration for orbit-keyed satellite data fusion runs.
//!
//! This library discovers orbit granules under an input tree, fans the
//! per-granule conversion pipeline out across a bounded worker pool, and
//! writes a resumable checkpoint of every job that did not fully succeed.

// Core modules
pub mod cli;
pub mod config;
pub mod discover;
pub mod error;
pub mod imaging;
pub mod job;
pub mod pool;
pub mod report;
pub mod stage;

// Re-export commonly used error types
pub use error::{
    ConfigError, DiscoveryError, EnvironmentError, PoolError, RenderError, ReportError, StageError,
};
