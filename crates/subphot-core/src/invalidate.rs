//! Scoped invalidation of derived data.
//!
//! Runs in a fixed order: artifacts on disk first, then registry rows, then
//! reference rows, so no registry row outlives the file it points to.
//! Requires exclusive access to the scope; never run it while a batch is
//! active on the same scope.

use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::layout::artifact_patterns;
use crate::config::Layout;
use crate::error::{Result, SubphotError};
use crate::frame::Scope;
use crate::pipeline::Stage;
use crate::reference::ReferenceManager;
use crate::registry::FrameRegistry;

/// A derived layer that can be dropped. Layers are independent: selecting
/// one never implies another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layer {
    Calibration,
    Alignment,
    Subtraction,
    Photometry,
    /// Detrended and assembled light curves.
    Lightcurves,
    ReferenceFrames,
    FrameInfoCache,
}

impl Layer {
    pub const ALL: [Layer; 7] = [
        Layer::Calibration,
        Layer::Alignment,
        Layer::Subtraction,
        Layer::Photometry,
        Layer::Lightcurves,
        Layer::ReferenceFrames,
        Layer::FrameInfoCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calibration => "calibration",
            Self::Alignment => "alignment",
            Self::Subtraction => "subtraction",
            Self::Photometry => "photometry",
            Self::Lightcurves => "lightcurves",
            Self::ReferenceFrames => "reference-frames",
            Self::FrameInfoCache => "frame-info-cache",
        }
    }

    /// Stage records held by this layer.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Self::Calibration => &[Stage::Calibrate],
            Self::Alignment => &[Stage::Align],
            Self::Subtraction => &[Stage::Subtract],
            Self::Photometry => &[Stage::Photometer],
            Self::Lightcurves => &[Stage::Detrend, Stage::Assemble],
            Self::ReferenceFrames | Self::FrameInfoCache => &[],
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = SubphotError;

    /// Accepts `reference-frames`, `reference_frames` and `referenceFrames`.
    fn from_str(s: &str) -> Result<Self> {
        let squashed: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        Layer::ALL
            .into_iter()
            .find(|layer| layer.as_str().replace('-', "") == squashed)
            .ok_or_else(|| SubphotError::InvalidConfig(format!("unknown layer '{s}'")))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvalidationReport {
    pub files_removed: usize,
    /// Matched files that were already gone by the time of deletion.
    pub files_missing: usize,
    pub files_failed: usize,
    pub purged: Vec<(Stage, usize)>,
    pub frame_info_purged: usize,
    pub references_cleared: usize,
}

impl InvalidationReport {
    pub fn rows_purged(&self) -> usize {
        self.purged.iter().map(|(_, n)| n).sum::<usize>()
            + self.frame_info_purged
            + self.references_cleared
    }
}

pub struct Invalidator {
    layout: Layout,
    registry: FrameRegistry,
    references: ReferenceManager,
}

impl Invalidator {
    pub fn new(layout: Layout, registry: FrameRegistry, references: ReferenceManager) -> Self {
        Self {
            layout,
            registry,
            references,
        }
    }

    /// Drop `layers` within `scope`. File deletion is best-effort.
    pub fn invalidate(&self, scope: &Scope, layers: &BTreeSet<Layer>) -> Result<InvalidationReport> {
        let mut report = InvalidationReport::default();
        info!(%scope, layers = ?layers, "Invalidating");

        for layer in layers {
            for pattern in self.file_patterns(scope, *layer) {
                self.remove_matching(&pattern, &mut report)?;
            }
        }

        let stages: Vec<Stage> = layers
            .iter()
            .flat_map(|layer| layer.stages().iter().copied())
            .collect();
        if !stages.is_empty() {
            report.purged = self.registry.purge(scope, &stages)?;
        }
        if layers.contains(&Layer::FrameInfoCache) {
            report.frame_info_purged = self.registry.purge_frame_info(scope)?;
        }
        if layers.contains(&Layer::ReferenceFrames) {
            report.references_cleared = self.references.clear(scope)?;
        }

        info!(
            files = report.files_removed,
            missing = report.files_missing,
            failed = report.files_failed,
            rows = report.rows_purged(),
            "Invalidation finished"
        );
        Ok(report)
    }

    /// Globs of the files a layer owns within `scope`.
    fn file_patterns(&self, scope: &Scope, layer: Layer) -> Vec<String> {
        match layer {
            Layer::ReferenceFrames => vec![glob_in(
                &self.layout.reference_dir,
                &format!(
                    "{}-*",
                    self.layout
                        .reference_prefix(scope.project, scope.camera, scope.ccd)
                ),
            )],
            Layer::FrameInfoCache => {
                let sector = scope.sector.map(|s| s.label()).unwrap_or_else(|| "s*".into());
                vec![glob_in(
                    &self.layout.frame_info_dir(scope.project),
                    &format!("tess*-{sector}-{}-{}-*.json", scope.camera, scope.ccd),
                )]
            }
            _ => layer
                .stages()
                .iter()
                .flat_map(|stage| {
                    let dir = PathBuf::from(self.layout.stage_dir_glob(scope, *stage));
                    artifact_patterns(*stage)
                        .iter()
                        .map(move |pattern| glob_in(&dir, pattern))
                })
                .collect(),
        }
    }

    fn remove_matching(&self, pattern: &str, report: &mut InvalidationReport) -> Result<()> {
        for entry in glob::glob(pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "Unreadable path during invalidation");
                    report.files_failed += 1;
                    continue;
                }
            };
            match std::fs::remove_file(&path) {
                Ok(()) => report.files_removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Already absent");
                    report.files_missing += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not remove artifact");
                    report.files_failed += 1;
                }
            }
        }
        Ok(())
    }
}

fn glob_in(dir: &Path, pattern: &str) -> String {
    dir.join(pattern).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_names_parse_in_any_spelling() {
        assert_eq!("reference-frames".parse::<Layer>().unwrap(), Layer::ReferenceFrames);
        assert_eq!("referenceFrames".parse::<Layer>().unwrap(), Layer::ReferenceFrames);
        assert_eq!("frame_info_cache".parse::<Layer>().unwrap(), Layer::FrameInfoCache);
        assert!("everything".parse::<Layer>().is_err());
    }

    #[test]
    fn layers_do_not_cascade() {
        assert_eq!(Layer::Alignment.stages(), &[Stage::Align]);
        assert!(Layer::ReferenceFrames.stages().is_empty());
    }
}
