use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_APERTURES, DEFAULT_CATMATCH_ARCSEC, DEFAULT_FLUX_THRESHOLD, DEFAULT_KERNEL_SPEC,
    DEFAULT_MATCH_MAX_DISTANCE, DEFAULT_MATCH_MAX_SOURCES, DEFAULT_TRANSFORM_ORDER,
    DEFAULT_TUNING_SAMPLE,
};
use crate::error::{Result, SubphotError};
use crate::reference::select::PhotrefCriteria;

use super::toggles::ToggleSet;

/// Invocation parameters of a run, as given by the operator (CLI flags or TOML).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunParams {
    pub project: u32,
    /// Sector or orbit label (`s0001`, `sector-1`, `orbit-9`, ...).
    pub sector: String,
    pub camera: u8,
    pub ccd: u8,
    #[serde(default)]
    pub mode: RunMode,
    /// Worker count; defaults depend on the mode.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Frames sampled from the input set in tuning mode.
    #[serde(default = "default_tuning_sample")]
    pub tuning_sample: usize,
    #[serde(default)]
    pub toggles: ToggleSet,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub astrometry: AstrometryParams,
    #[serde(default)]
    pub subtraction: SubtractionParams,
    #[serde(default)]
    pub photometry: PhotometryParams,
    #[serde(default)]
    pub photref: PhotrefCriteria,
    /// Extra sector label -> spacecraft configuration id entries.
    #[serde(default)]
    pub spacecraft_configs: BTreeMap<String, u16>,
    #[serde(default)]
    pub commands: CommandTemplates,
}

fn default_tuning_sample() -> usize {
    DEFAULT_TUNING_SAMPLE
}

impl RunParams {
    pub fn new(project: u32, sector: impl Into<String>, camera: u8, ccd: u8) -> Self {
        Self {
            project,
            sector: sector.into(),
            camera,
            ccd,
            mode: RunMode::default(),
            workers: None,
            tuning_sample: DEFAULT_TUNING_SAMPLE,
            paths: PathsConfig::default(),
            astrometry: AstrometryParams::default(),
            subtraction: SubtractionParams::default(),
            photometry: PhotometryParams::default(),
            photref: PhotrefCriteria::default(),
            toggles: ToggleSet::default(),
            spacecraft_configs: BTreeMap::new(),
            commands: CommandTemplates::default(),
        }
    }
}

/// Tuning runs iterate quickly on a frame sample; full runs process everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Tuning,
    #[default]
    Full,
}

impl RunMode {
    /// Directory segment separating tuning outputs from full-run outputs.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Tuning => "tune",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tuning => write!(f, "Tuning"),
            Self::Full => write!(f, "Full"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the working tree.
    pub base_dir: PathBuf,
    /// Directory holding the input frames. Defaults to `<base>/raw/<sector>`.
    pub raw_dir: Option<PathBuf>,
    /// Defaults to `<base>/reference-frames`.
    pub reference_dir: Option<PathBuf>,
    /// Defaults to `<base>/frameinfo-cache`.
    pub cache_dir: Option<PathBuf>,
    /// Defaults to `<base>/<tune|full>/registry.sqlite`. Tuning runs use a
    /// `tune-` sibling of an explicit path.
    pub database: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("subphot-work"),
            raw_dir: None,
            reference_dir: None,
            cache_dir: None,
            database: None,
        }
    }
}

/// Tolerances for matching frames to the astrometric reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstrometryParams {
    /// Maximum match residual in pixels.
    pub max_distance: f64,
    /// Polynomial order of the fitted transformation.
    pub order: u32,
    /// Sources considered by the triangulation matcher.
    pub max_sources: u32,
}

impl Default for AstrometryParams {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MATCH_MAX_DISTANCE,
            order: DEFAULT_TRANSFORM_ORDER,
            max_sources: DEFAULT_MATCH_MAX_SOURCES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtractionParams {
    pub kernel_spec: String,
    /// Residual flux above which a new source is reported.
    pub flux_threshold: f64,
    /// Catalog cross-match radius in arcseconds.
    pub catmatch_arcsec: f64,
}

impl Default for SubtractionParams {
    fn default() -> Self {
        Self {
            kernel_spec: DEFAULT_KERNEL_SPEC.to_string(),
            flux_threshold: DEFAULT_FLUX_THRESHOLD,
            catmatch_arcsec: DEFAULT_CATMATCH_ARCSEC,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryParams {
    /// Comma-separated `radius:annulus_inner:annulus_width` triples.
    pub apertures: String,
}

impl Default for PhotometryParams {
    fn default() -> Self {
        Self {
            apertures: DEFAULT_APERTURES.to_string(),
        }
    }
}

/// Shell command templates for the external processing tools.
///
/// Placeholders: `{input}`, `{output}`, `{reference}`, `{kernel}`,
/// `{apertures}`, `{frame}`. Stages without a template cannot be dispatched
/// by the command processor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    pub calibrate: Option<String>,
    pub align: Option<String>,
    pub subtract: Option<String>,
    pub photometer: Option<String>,
    pub detrend: Option<String>,
    pub assemble: Option<String>,
    pub astrometric_reference: Option<String>,
    pub photometric_reference: Option<String>,
}

fn kernel_term_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[bid](=\d+)?/\d+$").expect("kernel term pattern is a valid regex")
    })
}

/// Validated convolution kernel specification, e.g. `b/4;i/4;d=4/4`.
///
/// The exact string is part of a subtraction's identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSpec(String);

impl KernelSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(SubphotError::InvalidConfig("empty kernel spec".into()));
        }
        for term in spec.split(';') {
            if !kernel_term_pattern().is_match(term.trim()) {
                return Err(SubphotError::InvalidConfig(format!(
                    "malformed kernel spec term '{term}' in '{spec}'"
                )));
            }
        }
        Ok(Self(spec.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Circular photometric aperture with a background annulus.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aperture {
    pub radius: f64,
    pub annulus_inner: f64,
    pub annulus_width: f64,
}

impl Aperture {
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let apertures = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>>>()?;
        if apertures.is_empty() {
            return Err(SubphotError::InvalidConfig("no apertures given".into()));
        }
        Ok(apertures)
    }

    fn parse(spec: &str) -> Result<Self> {
        let malformed = || SubphotError::InvalidConfig(format!("malformed aperture '{spec}'"));
        let values: Vec<f64> = spec
            .split(':')
            .map(|v| v.trim().parse::<f64>().map_err(|_| malformed()))
            .collect::<Result<_>>()?;
        match values.as_slice() {
            &[radius, annulus_inner, annulus_width]
                if radius > 0.0 && annulus_inner >= radius && annulus_width > 0.0 =>
            {
                Ok(Self {
                    radius,
                    annulus_inner,
                    annulus_width,
                })
            }
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for Aperture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.radius, self.annulus_inner, self.annulus_width)
    }
}
