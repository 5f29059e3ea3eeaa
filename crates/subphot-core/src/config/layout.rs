use std::path::{Path, PathBuf};

use crate::frame::{Frame, Scope};
use crate::pipeline::{Stage, SubtractionMethod};
use crate::reference::ReferenceKind;

use super::params::{PathsConfig, RunMode};

/// Directory layout of the working tree of one run mode.
///
/// ```text
/// <base>/<tune|full>/registry.sqlite
/// <base>/<tune|full>/proj<P>/<sector>/cam<C>_ccd<D>/<stage dir>/...
/// <reference_dir>[/tune]/proj<P>-cam<C>-ccd<D>-<astromref|photref>-<name>.fits
/// <cache_dir>[/tune]/proj<P>/<frame stem>.json
/// ```
///
/// Tuning and full runs never share a registry, reference files or cached
/// frame info: a tuning sample processed with trial parameters must not
/// count as done for the full run.
#[derive(Clone, Debug, PartialEq)]
pub struct Layout {
    pub mode: RunMode,
    pub base_dir: PathBuf,
    pub reference_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub database: PathBuf,
}

impl Layout {
    pub fn from_paths(paths: &PathsConfig, mode: RunMode) -> Self {
        let base = &paths.base_dir;
        let reference_dir = paths
            .reference_dir
            .clone()
            .unwrap_or_else(|| base.join("reference-frames"));
        let cache_dir = paths
            .cache_dir
            .clone()
            .unwrap_or_else(|| base.join("frameinfo-cache"));
        let database = match paths.database {
            Some(ref db) => mode_database(db, mode),
            None => base.join(mode.dir_name()).join("registry.sqlite"),
        };
        let (reference_dir, cache_dir) = match mode {
            RunMode::Full => (reference_dir, cache_dir),
            RunMode::Tuning => (
                reference_dir.join(mode.dir_name()),
                cache_dir.join(mode.dir_name()),
            ),
        };
        Self {
            mode,
            base_dir: base.clone(),
            reference_dir,
            cache_dir,
            database,
        }
    }

    /// Work directory of a sector-resolved scope.
    pub fn work_dir(&self, scope: &Scope) -> PathBuf {
        let sector = scope
            .sector
            .map(|s| s.label())
            .unwrap_or_else(|| "all-sectors".into());
        self.base_dir
            .join(self.mode.dir_name())
            .join(format!("proj{}", scope.project))
            .join(sector)
            .join(format!("cam{}_ccd{}", scope.camera, scope.ccd))
    }

    /// Glob matching the stage directory of `stage` in this mode's tree
    /// and, if the scope has no sector, across all sectors.
    pub fn stage_dir_glob(&self, scope: &Scope, stage: Stage) -> String {
        let sector = scope.sector.map(|s| s.label()).unwrap_or_else(|| "*".into());
        self.base_dir
            .join(self.mode.dir_name())
            .join(format!("proj{}", scope.project))
            .join(sector)
            .join(format!("cam{}_ccd{}", scope.camera, scope.ccd))
            .join(stage.dir_name())
            .to_string_lossy()
            .into_owned()
    }

    /// Prefix shared by all reference files of a (project, camera, ccd).
    pub fn reference_prefix(&self, project: u32, camera: u8, ccd: u8) -> String {
        format!("proj{project}-cam{camera}-ccd{ccd}")
    }

    /// Destination of a newly built reference frame.
    pub fn reference_path(
        &self,
        project: u32,
        camera: u8,
        ccd: u8,
        kind: ReferenceKind,
        name: &str,
    ) -> PathBuf {
        self.reference_dir.join(format!(
            "{}-{}-{}.fits",
            self.reference_prefix(project, camera, ccd),
            kind.file_tag(),
            name
        ))
    }

    pub fn frame_info_dir(&self, project: u32) -> PathBuf {
        self.cache_dir.join(format!("proj{project}"))
    }

    pub fn frame_info_path(&self, frame: &Frame) -> PathBuf {
        self.frame_info_dir(frame.project)
            .join(format!("{}.json", frame.stem()))
    }
}

/// File name of the artifact `stage` produces for `frame`.
///
/// Subtracted frames carry the differencing method and the photometric
/// reference id, so the same aligned frame differenced against another
/// reference lands in a distinct file.
pub fn artifact_file_name(
    stage: Stage,
    frame: &Frame,
    subtraction: Option<(SubtractionMethod, i64)>,
) -> String {
    let stem = frame.stem();
    match stage {
        Stage::Calibrate => format!("{stem}-cal.fits"),
        Stage::Align => format!("{stem}-xtrns.fits"),
        Stage::Subtract => {
            let (method, reference_id) = subtraction.unwrap_or((SubtractionMethod::Normal, 0));
            format!("{}-ref{}-{stem}-xtrns.fits", method.prefix(), reference_id)
        }
        Stage::Photometer => format!("{stem}.iphot"),
        Stage::Detrend => format!("{stem}.epdlc"),
        Stage::Assemble => format!("{stem}.grcollectilc"),
    }
}

/// File-name globs of the artifacts (and their sidecars) of one stage.
pub fn artifact_patterns(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Calibrate => &["*-cal.fits*", "*.fistar"],
        Stage::Align => &["*-xtrns.fits*", "*.itrans"],
        Stage::Subtract => &["?sub-*-xtrns.fits*", "*-kernel"],
        Stage::Photometer => &["*.iphot*"],
        Stage::Detrend => &["*.epdlc*"],
        Stage::Assemble => &["*.grcollectilc*"],
    }
}

/// An explicitly configured database serves full runs; tuning runs use a
/// `tune-` prefixed sibling.
fn mode_database(path: &Path, mode: RunMode) -> PathBuf {
    match (mode, path.file_name()) {
        (RunMode::Tuning, Some(name)) => {
            path.with_file_name(format!("{}-{}", mode.dir_name(), name.to_string_lossy()))
        }
        _ => path.to_path_buf(),
    }
}

/// Stage directory below a work directory.
pub fn stage_dir(work_dir: &Path, stage: Stage) -> PathBuf {
    work_dir.join(stage.dir_name())
}
