//! Job configuration parameter sets.
//!
//! A parameter set is a `KEY: value` file in the conversion tool's own
//! config syntax (`#` comments, blank lines ignored, multi-value entries
//! space-separated). Keys are canonically upper-case. A fixed set of
//! keys drives the workflow itself rather than the tool; those are split
//! off at construction and never written back to a tool-facing config.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::imaging::ImageKey;

// Keys owned by the orchestrator; a parameter set may not set them.
pub const INPUT_FILE_PATH: &str = "INPUT_FILE_PATH";
pub const OUTPUT_FILE_PATH: &str = "OUTPUT_FILE_PATH";

// Tool-facing keys consulted when planning image generation.
pub const SOURCE_INSTRUMENT: &str = "SOURCE_INSTRUMENT";
pub const TARGET_INSTRUMENT: &str = "TARGET_INSTRUMENT";
pub const MISR_RESOLUTION: &str = "MISR_RESOLUTION";
pub const MISR_CAMERA_ANGLE: &str = "MISR_CAMERA_ANGLE";
pub const MISR_RADIANCE: &str = "MISR_RADIANCE";
pub const MODIS_RESOLUTION: &str = "MODIS_RESOLUTION";
pub const MODIS_BANDS: &str = "MODIS_BANDS";
pub const ASTER_RESOLUTION: &str = "ASTER_RESOLUTION";
pub const ASTER_BANDS: &str = "ASTER_BANDS";

// Workflow-only keys, stripped before the tool config is written.
pub const GENERATE_IMAGES: &str = "GENERATE_IMAGES";
pub const COMPARE_DATASETS: &str = "COMPARE_DATASETS";
pub const COMPARE_THRESHOLD: &str = "COMPARE_THRESHOLD";
pub const OUTPUT_PREFIX: &str = "OUTPUT_PREFIX";

/// Similarity threshold applied when a set does not configure one.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;

/// Output naming prefix applied when a set does not configure one.
pub const DEFAULT_OUTPUT_PREFIX: &str = "ADVNCE_FUSE";

/// A requested comparison between two rendered dataset slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparePair {
    pub left: ImageKey,
    pub right: ImageKey,
}

impl fmt::Display for ComparePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.left, self.right)
    }
}

impl ComparePair {
    /// Parses a comma-separated list of `left=right` pairs.
    ///
    /// The flat alternating-list shape is rejected: every entry must
    /// name both sides of its pair explicitly.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, ConfigError> {
        let mut pairs = Vec::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((left, right)) = entry.split_once('=') else {
                return Err(ConfigError::ComparePairShape(raw.to_string()));
            };
            pairs.push(Self {
                left: parse_dataset_ref(left.trim())?,
                right: parse_dataset_ref(right.trim())?,
            });
        }
        Ok(pairs)
    }
}

fn parse_dataset_ref(reference: &str) -> Result<ImageKey, ConfigError> {
    reference
        .parse()
        .map_err(|reason| ConfigError::BadDatasetRef {
            reference: reference.to_string(),
            reason,
        })
}

/// The workflow-facing half of a parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParams {
    /// Render images even when no comparison is requested.
    pub generate_images: bool,
    /// Comparison pairs, resolved against the job's image index.
    pub compare: Vec<ComparePair>,
    /// Minimum acceptable similarity score.
    pub threshold: f64,
    /// Prefix for the output artifact name.
    pub output_prefix: String,
}

impl Default for WorkflowParams {
    fn default() -> Self {
        Self {
            generate_images: false,
            compare: Vec::new(),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
        }
    }
}

impl WorkflowParams {
    /// Whether the image stage has any work to do.
    pub fn requests_images(&self) -> bool {
        self.generate_images || !self.compare.is_empty()
    }
}

/// One job configuration: tool-facing parameters plus the typed
/// workflow split.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    /// Parameters written verbatim to the tool config file.
    pub tool: BTreeMap<String, String>,
    /// Workflow-only parameters.
    pub workflow: WorkflowParams,
}

impl ParameterSet {
    /// Reads and validates a parameter-set file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_text(&text)
    }

    /// Parses parameter-set text (`KEY: value` lines, `#` comments).
    pub fn from_text(text: &str) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(ConfigError::MalformedLine(line.to_string()));
            };
            let key = key.trim();
            validate_key(key)?;
            map.insert(key.to_string(), value.trim().to_string());
        }
        Self::from_map(map)
    }

    /// Builds a set from an already-parsed key/value map, splitting off
    /// the workflow-only keys.
    pub fn from_map(mut map: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        for key in map.keys() {
            validate_key(key)?;
        }
        for owned in [INPUT_FILE_PATH, OUTPUT_FILE_PATH] {
            if map.remove(owned).is_some() {
                warn!(key = owned, "Ignoring orchestrator-owned key in parameter set");
            }
        }

        let generate_images = match map.remove(GENERATE_IMAGES) {
            Some(value) => parse_switch(GENERATE_IMAGES, &value)?,
            None => false,
        };
        let compare = match map.remove(COMPARE_DATASETS) {
            Some(value) => ComparePair::parse_list(&value)?,
            None => Vec::new(),
        };
        let threshold = match map.remove(COMPARE_THRESHOLD) {
            Some(value) => parse_threshold(&value)?,
            None => DEFAULT_SIMILARITY_THRESHOLD,
        };
        let output_prefix = match map.remove(OUTPUT_PREFIX) {
            Some(value) => parse_prefix(&value)?,
            None => DEFAULT_OUTPUT_PREFIX.to_string(),
        };

        let workflow = WorkflowParams {
            // A comparison request implies rendering.
            generate_images: generate_images || !compare.is_empty(),
            compare,
            threshold,
            output_prefix,
        };
        Ok(Self {
            tool: map,
            workflow,
        })
    }

    /// Reconstructs the single flat map (tool + workflow keys) used by
    /// the checkpoint format. `from_map(merged())` round-trips.
    pub fn merged(&self) -> BTreeMap<String, String> {
        let mut map = self.tool.clone();
        map.insert(
            OUTPUT_PREFIX.to_string(),
            self.workflow.output_prefix.clone(),
        );
        map.insert(
            COMPARE_THRESHOLD.to_string(),
            self.workflow.threshold.to_string(),
        );
        if self.workflow.generate_images {
            map.insert(GENERATE_IMAGES.to_string(), "TRUE".to_string());
        }
        if !self.workflow.compare.is_empty() {
            let pairs: Vec<String> = self
                .workflow
                .compare
                .iter()
                .map(ComparePair::to_string)
                .collect();
            map.insert(COMPARE_DATASETS.to_string(), pairs.join(","));
        }
        map
    }
}

fn validate_key(key: &str) -> Result<(), ConfigError> {
    if key.is_empty() {
        return Err(ConfigError::MalformedLine(key.to_string()));
    }
    if key.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(ConfigError::LowercaseKey(key.to_string()));
    }
    let valid = key.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !valid || !key.starts_with(|c: char| c.is_ascii_uppercase()) {
        return Err(ConfigError::MalformedLine(key.to_string()));
    }
    Ok(())
}

fn parse_switch(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_uppercase().as_str() {
        "TRUE" | "ON" | "YES" | "1" => Ok(true),
        "FALSE" | "OFF" | "NO" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected TRUE/FALSE, ON/OFF, YES/NO or 1/0".to_string(),
        }),
    }
}

fn parse_threshold(value: &str) -> Result<f64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: COMPARE_THRESHOLD.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let threshold: f64 = value.parse().map_err(|_| invalid("not a number"))?;
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(invalid("must be within 0.0..=1.0"));
    }
    Ok(threshold)
}

fn parse_prefix(value: &str) -> Result<String, ConfigError> {
    if value.is_empty() || value.contains(['/', ' ']) {
        return Err(ConfigError::InvalidValue {
            key: OUTPUT_PREFIX.to_string(),
            value: value.to_string(),
            reason: "must be a non-empty name without '/' or spaces".to_string(),
        });
    }
    Ok(value.to_string())
}
