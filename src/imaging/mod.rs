//! Instrument families, dataset references, and per-job image planning.
//!
//! The conversion output pairs a source and a target instrument. Each
//! instrument family selects data slices differently:
//!
//! - MISR: camera angle x spectral band, at a configured resolution
//! - MODIS: spectral band list, at a configured resolution
//! - ASTER: spectral band list at the family's fixed resolution
//!
//! A rendered slice is addressed by an [`ImageKey`], one flat composite
//! key per image, which is also the grammar of the dataset references
//! used in comparison requests.

mod render;

pub use render::{CommandRenderer, CommandScorer, ImageRenderer, SimilarityScorer};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{
    ASTER_BANDS, ASTER_RESOLUTION, MISR_CAMERA_ANGLE, MISR_RADIANCE, MISR_RESOLUTION, MODIS_BANDS,
    MODIS_RESOLUTION, SOURCE_INSTRUMENT, TARGET_INSTRUMENT,
};
use crate::error::RenderError;

/// MISR camera angles, fore to aft.
pub const MISR_CAMERAS: [&str; 9] = ["AA", "AF", "AN", "BA", "BF", "CA", "CF", "DA", "DF"];

/// MISR spectral bands.
pub const MISR_BAND_NAMES: [&str; 4] = ["RED", "GREEN", "BLUE", "NIR"];

/// Highest MODIS band number accepted as a selector.
pub const MODIS_BAND_COUNT: u32 = 36;

/// Highest ASTER band number accepted as a selector.
pub const ASTER_BAND_COUNT: u32 = 14;

/// An instrument family with renderable radiance data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Instrument {
    Misr,
    Modis,
    Aster,
}

impl Instrument {
    /// Canonical upper-case family name as it appears in parameters.
    pub fn name(&self) -> &'static str {
        match self {
            Instrument::Misr => "MISR",
            Instrument::Modis => "MODIS",
            Instrument::Aster => "ASTER",
        }
    }

    /// Parses a family name. `USER_DEFINE` and unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MISR" => Some(Instrument::Misr),
            "MODIS" => Some(Instrument::Modis),
            "ASTER" => Some(Instrument::Aster),
            _ => None,
        }
    }

    /// Validates and canonicalizes a selector for this family.
    ///
    /// MISR selectors are `CAMERA_BAND` (e.g. `AN_RED`); MODIS and ASTER
    /// selectors are band numbers within the family's range.
    fn canonical_selector(&self, selector: &str) -> Result<String, String> {
        match self {
            Instrument::Misr => {
                let upper = selector.to_uppercase();
                let (camera, band) = upper
                    .split_once('_')
                    .ok_or_else(|| "expected CAMERA_BAND".to_string())?;
                if !MISR_CAMERAS.contains(&camera) {
                    return Err(format!("unknown camera '{camera}'"));
                }
                if !MISR_BAND_NAMES.contains(&band) {
                    return Err(format!("unknown band '{band}'"));
                }
                Ok(format!("{camera}_{band}"))
            }
            Instrument::Modis => {
                canonical_band_number(selector, MODIS_BAND_COUNT).map(|b| b.to_string())
            }
            Instrument::Aster => {
                canonical_band_number(selector, ASTER_BAND_COUNT).map(|b| b.to_string())
            }
        }
    }
}

fn canonical_band_number(selector: &str, max: u32) -> Result<u32, String> {
    let band: u32 = selector
        .parse()
        .map_err(|_| format!("band '{selector}' is not a number"))?;
    if band < 1 || band > max {
        return Err(format!("band {band} outside 1..={max}"));
    }
    Ok(band)
}

/// Flat composite key addressing one rendered image:
/// `(instrument, resolution, camera-angle-or-band)`.
///
/// The display form `INSTRUMENT/RESOLUTION/SELECTOR` (e.g. `MISR/H/AN_RED`,
/// `MODIS/1KM/8`) is the dataset-reference grammar used by comparison
/// requests and the checkpoint format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageKey {
    pub instrument: Instrument,
    pub resolution: String,
    pub selector: String,
}

impl ImageKey {
    /// Builds a key, canonicalizing the selector for the family.
    pub fn new(
        instrument: Instrument,
        resolution: impl Into<String>,
        selector: &str,
    ) -> Result<Self, RenderError> {
        let canonical =
            instrument
                .canonical_selector(selector)
                .map_err(|reason| RenderError::InvalidSelector {
                    instrument: instrument.name().to_string(),
                    selector: selector.to_string(),
                    reason,
                })?;
        Ok(Self {
            instrument,
            resolution: resolution.into().to_uppercase(),
            selector: canonical,
        })
    }

    /// File name for the rendered slice inside a job's image directory.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.png",
            self.instrument.name(),
            self.resolution,
            self.selector
        )
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instrument.name(),
            self.resolution,
            self.selector
        )
    }
}

impl FromStr for ImageKey {
    type Err = String;

    /// Strict parse of the `INSTRUMENT/RESOLUTION/SELECTOR` grammar.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let &[family, resolution, selector] = parts.as_slice() else {
            return Err("expected INSTRUMENT/RESOLUTION/SELECTOR".to_string());
        };
        let family = family.to_uppercase();
        let instrument =
            Instrument::from_name(&family).ok_or_else(|| format!("unknown instrument '{family}'"))?;
        if resolution.is_empty() {
            return Err("empty resolution".to_string());
        }
        let canonical = instrument.canonical_selector(selector)?;
        Ok(Self {
            instrument,
            resolution: resolution.to_uppercase(),
            selector: canonical,
        })
    }
}

impl Serialize for ImageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ImageKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// One slice to render: its key, the dataset it comes from, and the
/// selection indices handed to the renderer.
#[derive(Debug, Clone)]
pub struct ImageSlice {
    pub key: ImageKey,
    pub dataset_path: String,
    pub indices: Vec<usize>,
}

/// Every slice a job's parameters request, across both instrument roles.
#[derive(Debug, Clone, Default)]
pub struct ImagePlan {
    pub slices: Vec<ImageSlice>,
}

impl ImagePlan {
    /// Derives the plan from a job's tool-facing parameters.
    ///
    /// Selection indices are positions within the job's own expanded
    /// request lists: the output artifact only contains the cameras and
    /// bands this job converted, in request order.
    pub fn from_parameters(params: &BTreeMap<String, String>) -> Result<Self, RenderError> {
        let mut slices = Vec::new();
        for (param, role) in [(SOURCE_INSTRUMENT, "Source"), (TARGET_INSTRUMENT, "Target")] {
            let Some(name) = params.get(param) else {
                continue;
            };
            let name = name.trim().to_uppercase();
            if name == "USER_DEFINE" {
                continue;
            }
            let instrument =
                Instrument::from_name(&name).ok_or(RenderError::UnknownInstrument(name))?;
            family_slices(instrument, role, params, &mut slices)?;
        }
        Ok(Self { slices })
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

fn family_slices(
    instrument: Instrument,
    role: &str,
    params: &BTreeMap<String, String>,
    out: &mut Vec<ImageSlice>,
) -> Result<(), RenderError> {
    let dataset_path = format!("/{role}/Data_Fields/{}_Radiance", instrument.name());
    match instrument {
        Instrument::Misr => {
            let resolution = require(params, MISR_RESOLUTION)?;
            let cameras = expand_names(params, MISR_CAMERA_ANGLE, &MISR_CAMERAS, instrument)?;
            let bands = expand_names(params, MISR_RADIANCE, &MISR_BAND_NAMES, instrument)?;
            for (camera_idx, camera) in cameras.iter().enumerate() {
                for (band_idx, band) in bands.iter().enumerate() {
                    let key = ImageKey::new(instrument, &resolution, &format!("{camera}_{band}"))?;
                    out.push(ImageSlice {
                        key,
                        dataset_path: dataset_path.clone(),
                        indices: vec![camera_idx, band_idx],
                    });
                }
            }
        }
        Instrument::Modis => {
            let resolution = require(params, MODIS_RESOLUTION)?;
            let bands = expand_bands(params, MODIS_BANDS, MODIS_BAND_COUNT, instrument)?;
            push_band_slices(instrument, &resolution, &dataset_path, &bands, out)?;
        }
        Instrument::Aster => {
            let resolution = require(params, ASTER_RESOLUTION)?;
            let bands = expand_bands(params, ASTER_BANDS, ASTER_BAND_COUNT, instrument)?;
            push_band_slices(instrument, &resolution, &dataset_path, &bands, out)?;
        }
    }
    Ok(())
}

fn push_band_slices(
    instrument: Instrument,
    resolution: &str,
    dataset_path: &str,
    bands: &[u32],
    out: &mut Vec<ImageSlice>,
) -> Result<(), RenderError> {
    for (band_idx, band) in bands.iter().enumerate() {
        let key = ImageKey::new(instrument, resolution, &band.to_string())?;
        out.push(ImageSlice {
            key,
            dataset_path: dataset_path.to_string(),
            indices: vec![band_idx],
        });
    }
    Ok(())
}

fn require(params: &BTreeMap<String, String>, key: &str) -> Result<String, RenderError> {
    params
        .get(key)
        .map(|v| v.trim().to_uppercase())
        .ok_or_else(|| RenderError::MissingParameter(key.to_string()))
}

/// Expands a space-separated name list, with `ALL` standing for the
/// family's full table.
fn expand_names(
    params: &BTreeMap<String, String>,
    key: &str,
    table: &[&str],
    instrument: Instrument,
) -> Result<Vec<String>, RenderError> {
    let raw = params
        .get(key)
        .ok_or_else(|| RenderError::MissingParameter(key.to_string()))?;
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(RenderError::MissingParameter(key.to_string()));
    }
    if tokens.iter().any(|t| t.eq_ignore_ascii_case("ALL")) {
        return Ok(table.iter().map(|s| s.to_string()).collect());
    }
    let mut names = Vec::with_capacity(tokens.len());
    for token in tokens {
        let upper = token.to_uppercase();
        if !table.contains(&upper.as_str()) {
            return Err(RenderError::InvalidSelector {
                instrument: instrument.name().to_string(),
                selector: token.to_string(),
                reason: format!("not one of {table:?}"),
            });
        }
        names.push(upper);
    }
    Ok(names)
}

/// Expands a space-separated band-number list, with `ALL` standing for
/// `1..=max`.
fn expand_bands(
    params: &BTreeMap<String, String>,
    key: &str,
    max: u32,
    instrument: Instrument,
) -> Result<Vec<u32>, RenderError> {
    let raw = params
        .get(key)
        .ok_or_else(|| RenderError::MissingParameter(key.to_string()))?;
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(RenderError::MissingParameter(key.to_string()));
    }
    if tokens.iter().any(|t| t.eq_ignore_ascii_case("ALL")) {
        return Ok((1..=max).collect());
    }
    let mut bands = Vec::with_capacity(tokens.len());
    for token in tokens {
        let band = canonical_band_number(token, max).map_err(|reason| {
            RenderError::InvalidSelector {
                instrument: instrument.name().to_string(),
                selector: token.to_string(),
                reason,
            }
        })?;
        bands.push(band);
    }
    Ok(bands)
}
