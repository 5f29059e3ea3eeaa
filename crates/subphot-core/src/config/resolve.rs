use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::consts::{DEFAULT_WORKERS, TUNING_MAX_WORKERS};
use crate::error::{Result, SubphotError};
use crate::frame::{Frame, Scope, Sector};
use crate::pipeline::{Stage, StageGraph, SubtractionMethod};
use crate::reference::select::PhotrefCriteria;

use super::layout::{artifact_file_name, stage_dir, Layout};
use super::params::{
    Aperture, AstrometryParams, CommandTemplates, KernelSpec, RunMode, RunParams,
};
use super::toggles::{Toggle, ToggleSet};

/// Spacecraft configuration ids of the first year of full-frame images.
const KNOWN_SPACECRAFT_CONFIGS: [(u16, u16); 13] = [
    (1, 120),
    (2, 121),
    (3, 123),
    (4, 124),
    (5, 125),
    (6, 126),
    (7, 131),
    (8, 136),
    (9, 139),
    (10, 140),
    (11, 143),
    (12, 144),
    (13, 146),
];

/// Fully resolved run configuration. Built once per run by [`resolve`].
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    /// Scope of the run; the sector is always set.
    pub scope: Scope,
    pub sector: Sector,
    /// Spacecraft configuration id of the sector.
    pub scid: u16,
    pub mode: RunMode,
    pub layout: Layout,
    pub work_dir: PathBuf,
    pub raw_dir: PathBuf,
    /// Glob selecting the input frames of the scope.
    pub input_glob: String,
    pub workers: usize,
    /// Frame sample size in tuning mode.
    pub sample: Option<usize>,
    pub apertures: Vec<Aperture>,
    pub kernel: KernelSpec,
    pub flux_threshold: f64,
    pub catmatch_arcsec: f64,
    pub astrometry: AstrometryParams,
    pub photref: PhotrefCriteria,
    pub toggles: ToggleSet,
    pub commands: CommandTemplates,
}

impl ResolvedConfig {
    pub fn graph(&self) -> StageGraph {
        StageGraph::new(self.toggles.is_enabled(Toggle::SkipDetrend))
    }

    pub fn subtraction_method(&self) -> SubtractionMethod {
        if self.toggles.is_enabled(Toggle::ReverseSubtract) {
            SubtractionMethod::Reverse
        } else {
            SubtractionMethod::Normal
        }
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        stage_dir(&self.work_dir, stage)
    }

    /// Planned output of `stage` for `frame`. `photref_id` only matters for
    /// subtraction.
    pub fn artifact_path(&self, frame: &Frame, stage: Stage, photref_id: Option<i64>) -> PathBuf {
        let subtraction = photref_id.map(|id| (self.subtraction_method(), id));
        self.stage_dir(stage)
            .join(artifact_file_name(stage, frame, subtraction))
    }

    pub fn apertures_string(&self) -> String {
        self.apertures
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Look up the spacecraft configuration id of a sector.
pub fn spacecraft_config(sector: Sector, extra: &BTreeMap<Sector, u16>) -> Result<u16> {
    extra
        .get(&sector)
        .copied()
        .or_else(|| {
            KNOWN_SPACECRAFT_CONFIGS
                .iter()
                .find(|(s, _)| *s == sector.0)
                .map(|(_, scid)| *scid)
        })
        .ok_or_else(|| SubphotError::UnknownScope(sector.label()))
}

/// Turn invocation parameters into a resolved configuration.
///
/// Pure: touches neither the filesystem nor the registry.
pub fn resolve(params: &RunParams) -> Result<ResolvedConfig> {
    let sector: Sector = params.sector.parse()?;

    let extra = params
        .spacecraft_configs
        .iter()
        .map(|(label, scid)| -> Result<(Sector, u16)> { Ok((label.parse()?, *scid)) })
        .collect::<Result<BTreeMap<_, _>>>()?;
    let scid = spacecraft_config(sector, &extra)?;

    if params.project == 0 {
        return Err(SubphotError::InvalidConfig("project id must be positive".into()));
    }
    for (name, value) in [("camera", params.camera), ("ccd", params.ccd)] {
        if !(1..=4).contains(&value) {
            return Err(SubphotError::InvalidConfig(format!(
                "{name} must be between 1 and 4, got {value}"
            )));
        }
    }

    let kernel = KernelSpec::parse(&params.subtraction.kernel_spec)?;
    let apertures = Aperture::parse_list(&params.photometry.apertures)?;

    if params.subtraction.flux_threshold <= 0.0 || params.subtraction.catmatch_arcsec <= 0.0 {
        return Err(SubphotError::InvalidConfig(
            "flux threshold and catalog match radius must be positive".into(),
        ));
    }
    if params.astrometry.max_distance <= 0.0 || params.astrometry.order == 0 {
        return Err(SubphotError::InvalidConfig(
            "astrometric match distance and transform order must be positive".into(),
        ));
    }

    let requested = params.workers.unwrap_or(DEFAULT_WORKERS);
    if requested == 0 {
        return Err(SubphotError::InvalidConfig("worker count must be positive".into()));
    }

    let mut photref = params.photref.clone();
    photref.validate()?;

    let (workers, sample) = match params.mode {
        RunMode::Full => (requested, None),
        RunMode::Tuning => {
            if params.tuning_sample == 0 {
                return Err(SubphotError::InvalidConfig(
                    "tuning sample must be positive".into(),
                ));
            }
            photref.min_frames = photref.min_frames.min(params.tuning_sample);
            (requested.min(TUNING_MAX_WORKERS), Some(params.tuning_sample))
        }
    };

    let scope = Scope::new(params.project, params.camera, params.ccd).with_sector(sector);
    let layout = Layout::from_paths(&params.paths, params.mode);
    let work_dir = layout.work_dir(&scope);
    let raw_dir = params
        .paths
        .raw_dir
        .clone()
        .unwrap_or_else(|| layout.base_dir.join("raw").join(sector.label()));
    let input_glob = raw_dir
        .join(format!(
            "tess2*-{}-{}-{}-{:04}-?_ffic.fits*",
            sector.label(),
            params.camera,
            params.ccd,
            scid
        ))
        .to_string_lossy()
        .into_owned();

    debug!(%scope, scid, workers, "Resolved configuration");

    Ok(ResolvedConfig {
        scope,
        sector,
        scid,
        mode: params.mode,
        layout,
        work_dir,
        raw_dir,
        input_glob,
        workers,
        sample,
        apertures,
        kernel,
        flux_threshold: params.subtraction.flux_threshold,
        catmatch_arcsec: params.subtraction.catmatch_arcsec,
        astrometry: params.astrometry.clone(),
        photref,
        toggles: params.toggles.clone(),
        commands: params.commands.clone(),
    })
}

/// Create every directory a run writes into. Safe to call repeatedly.
pub fn prepare_directories(config: &ResolvedConfig) -> Result<()> {
    let mut dirs: Vec<PathBuf> = config
        .graph()
        .sequence()
        .into_iter()
        .map(|stage| config.stage_dir(stage))
        .collect();
    dirs.push(config.layout.reference_dir.clone());
    dirs.push(config.layout.frame_info_dir(config.scope.project));
    if let Some(parent) = config.layout.database.parent() {
        dirs.push(parent.to_path_buf());
    }

    for dir in dirs.iter().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    info!(work_dir = %config.work_dir.display(), "Directories ready");
    Ok(())
}
