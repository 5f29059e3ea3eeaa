use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Aperture, KernelSpec, ToggleSet};
use crate::frame::{Frame, FrameKey, Scope};
use crate::reference::{ReferenceFrame, ReferenceKind};
use crate::registry::{FrameStats, Upstream, WarpDiagnostics};

use super::stage::{Stage, SubtractionMethod};

/// One (frame, stage) unit handed to a processor.
#[derive(Clone, Debug)]
pub struct WorkUnit {
    pub frame: Frame,
    pub stage: Stage,
    /// Prerequisite record; `None` for calibration.
    pub upstream: Option<Upstream>,
    /// Planned output artifact.
    pub output: PathBuf,
    /// Astrometric reference for alignment, photometric for subtraction.
    pub reference: Option<ReferenceFrame>,
    pub kernel: KernelSpec,
    pub method: SubtractionMethod,
    pub apertures: Vec<Aperture>,
    pub toggles: ToggleSet,
}

impl WorkUnit {
    /// Input artifact: the prerequisite's output, or the raw frame.
    pub fn input(&self) -> &PathBuf {
        self.upstream
            .as_ref()
            .map(|u| &u.artifact)
            .unwrap_or(&self.frame.path)
    }
}

/// What a processor reports back for a successful unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOutput {
    /// Calibrated image header.
    pub header: Option<Value>,
    /// Image statistics, cached for reference selection.
    pub stats: Option<FrameStats>,
    /// Warp diagnostics of an alignment.
    pub diagnostics: Option<WarpDiagnostics>,
    /// Anything else worth keeping with the stage record.
    pub detail: Option<Value>,
}

/// A processing failure of one unit. Never fatal for the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFailure {
    pub message: String,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Input for building a reference frame.
#[derive(Clone, Debug)]
pub struct ReferenceRequest {
    pub scope: Scope,
    pub kind: ReferenceKind,
    /// Frames the reference is built from, best first.
    pub sources: Vec<FrameKey>,
    /// Artifacts of `sources`: calibrated images for an astrometric
    /// reference, aligned images for a photometric one.
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    /// Astrometric reference the photometric stack is registered on.
    pub astrometric: Option<ReferenceFrame>,
    pub toggles: ToggleSet,
}

/// Outcome of a unit as seen by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum UnitOutcome {
    Completed,
    /// A record with the same lineage exists already.
    AlreadyDone,
    Failed(String),
}

/// Summary of one coordinator batch.
#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    pub dispatched: usize,
    pub completed: usize,
    pub already_done: usize,
    pub failed: Vec<(FrameKey, Stage, String)>,
    /// Stages that could not run for want of a reference.
    pub blocked: Vec<(Stage, String)>,
    pub passes: usize,
}

impl BatchReport {
    pub fn record(&mut self, frame: &FrameKey, stage: Stage, outcome: UnitOutcome) {
        self.dispatched += 1;
        match outcome {
            UnitOutcome::Completed => self.completed += 1,
            UnitOutcome::AlreadyDone => self.already_done += 1,
            UnitOutcome::Failed(message) => self.failed.push((frame.clone(), stage, message)),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

/// Thread-safe progress reporting for a batch.
///
/// Implementors can use this to drive progress bars or logging. All methods
/// have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    /// A stage has started. `total_items` is the number of dispatched units.
    fn begin_stage(&self, _stage: Stage, _total_items: Option<usize>) {}

    /// One unit of the current stage has finished, successfully or not.
    fn advance(&self, _items_done: usize) {}

    /// The current stage is finished.
    fn finish_stage(&self) {}
}

pub struct NoOpReporter;
impl ProgressReporter for NoOpReporter {}
