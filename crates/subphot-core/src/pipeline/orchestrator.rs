use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedConfig;
use crate::consts::MAX_COORDINATOR_PASSES;
use crate::error::{Result, SubphotError};
use crate::frame::{Frame, FrameKey};
use crate::reference::select::{select_astrometric, select_photometric};
use crate::reference::{ReferenceKind, ReferenceManager, ReferenceSnapshot};
use crate::registry::{CalibrationResult, FrameRegistry, PendingFrame, Upstream};

use super::pool::WorkerPool;
use super::processor::StageProcessor;
use super::stage::Stage;
use super::types::{
    BatchReport, NoOpReporter, ProgressReporter, ReferenceRequest, StageOutput, UnitOutcome,
    WorkUnit,
};

/// Expand the configured input glob into frames, sorted by key.
///
/// Names that do not parse are skipped with a warning. In tuning mode the
/// result is cut to an evenly spaced sample.
pub fn discover_frames(config: &ResolvedConfig) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    for entry in glob::glob(&config.input_glob)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Unreadable path while discovering frames");
                continue;
            }
        };
        match Frame::from_path(&path, config.scope.project) {
            Ok(frame) if config.scope.contains(&frame) => frames.push(frame),
            Ok(frame) => debug!(frame = %frame.key, "Frame outside scope skipped"),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping frame"),
        }
    }
    frames.sort_by(|a, b| a.key.cmp(&b.key));
    frames.dedup_by(|a, b| a.key == b.key);

    if let Some(sample) = config.sample {
        frames = sample_evenly(frames, sample);
    }
    info!(count = frames.len(), pattern = %config.input_glob, "Discovered frames");
    Ok(frames)
}

fn sample_evenly(frames: Vec<Frame>, sample: usize) -> Vec<Frame> {
    let total = frames.len();
    if total <= sample {
        return frames;
    }
    let picks: HashSet<usize> = (0..sample).map(|i| i * total / sample).collect();
    frames
        .into_iter()
        .enumerate()
        .filter(|(i, _)| picks.contains(i))
        .map(|(_, frame)| frame)
        .collect()
}

/// Schedules (frame, stage) units for a batch and records their outcomes.
///
/// The coordinator never processes a frame itself. It asks the registry
/// what is pending, hands units to the pool, and writes one record per
/// successful unit. Failed units leave no record and stay pending for the
/// next run.
pub struct StageCoordinator {
    registry: FrameRegistry,
    references: ReferenceManager,
    config: ResolvedConfig,
}

impl StageCoordinator {
    pub fn new(registry: FrameRegistry, references: ReferenceManager, config: ResolvedConfig) -> Self {
        Self {
            registry,
            references,
            config,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn run_batch(
        &self,
        frames: &[Frame],
        processor: &dyn StageProcessor,
        pool: &WorkerPool,
    ) -> Result<BatchReport> {
        self.run_batch_reported(frames, processor, pool, Arc::new(NoOpReporter))
    }

    /// Drive `frames` through every stage until nothing more can be
    /// dispatched. Only storage and configuration faults abort the batch.
    pub fn run_batch_reported(
        &self,
        frames: &[Frame],
        processor: &dyn StageProcessor,
        pool: &WorkerPool,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<BatchReport> {
        let scope = self.config.scope;
        let graph = self.config.graph();

        let (in_scope, foreign): (Vec<Frame>, Vec<Frame>) =
            frames.iter().cloned().partition(|f| scope.contains(f));
        if !foreign.is_empty() {
            warn!(count = foreign.len(), %scope, "Ignoring frames outside the run scope");
        }
        self.registry.ingest(&in_scope)?;
        let batch: HashSet<FrameKey> = in_scope.into_iter().map(|f| f.key).collect();

        let mut snapshot = self.references.snapshot(&scope)?;
        let mut report = BatchReport::default();
        let mut failed: HashSet<FrameKey> = HashSet::new();

        info!(%scope, frames = batch.len(), workers = pool.size(), "Starting batch");

        for pass in 1..=MAX_COORDINATOR_PASSES {
            report.passes = pass;
            let mut dispatched = 0;

            for stage in graph.sequence() {
                if let Some(kind) = required_reference(stage) {
                    if snapshot.get(kind).is_none()
                        && !self.ensure_reference(kind, &mut snapshot, processor)?
                    {
                        let reason = format!("no {kind} reference available");
                        if !report.blocked.iter().any(|(s, _)| *s == stage) {
                            report.blocked.push((stage, reason));
                        }
                        continue;
                    }
                }

                let pending = self
                    .registry
                    .pending_work_in(&scope, stage, graph)
                    .filter(|item| match item {
                        Ok(p) => batch.contains(&p.frame.key) && !failed.contains(&p.frame.key),
                        Err(_) => true,
                    })
                    .collect::<Result<Vec<_>>>()?;
                if pending.is_empty() {
                    continue;
                }

                let units: Vec<WorkUnit> = pending
                    .into_iter()
                    .map(|p| self.work_unit(p, stage, &snapshot))
                    .collect();
                let keys: Vec<FrameKey> = units.iter().map(|u| u.frame.key.clone()).collect();
                dispatched += units.len();

                debug!(%stage, units = units.len(), "Dispatching stage");
                reporter.begin_stage(stage, Some(units.len()));
                let done = AtomicUsize::new(0);
                let results = pool.run(units, |unit| {
                    let outcome = self.execute(&unit, processor);
                    reporter.advance(done.fetch_add(1, Ordering::Relaxed) + 1);
                    outcome
                });
                reporter.finish_stage();

                for (key, result) in keys.into_iter().zip(results) {
                    let outcome = match result {
                        Ok(outcome) => outcome?,
                        Err(panic) => unit_failed(stage, &key, panic),
                    };
                    if matches!(outcome, UnitOutcome::Failed(_)) {
                        failed.insert(key.clone());
                    }
                    report.record(&key, stage, outcome);
                }
            }

            if dispatched == 0 {
                break;
            }
        }

        info!(
            dispatched = report.dispatched,
            completed = report.completed,
            already_done = report.already_done,
            failed = report.failed.len(),
            "Batch finished"
        );
        Ok(report)
    }

    fn work_unit(&self, pending: PendingFrame, stage: Stage, snapshot: &ReferenceSnapshot) -> WorkUnit {
        let reference = required_reference(stage).and_then(|kind| snapshot.get(kind).cloned());
        let photref_id = match stage {
            Stage::Subtract => reference.as_ref().map(|r| r.id),
            _ => None,
        };
        let output = self.config.artifact_path(&pending.frame, stage, photref_id);
        WorkUnit {
            frame: pending.frame,
            stage,
            upstream: pending.upstream,
            output,
            reference,
            kernel: self.config.kernel.clone(),
            method: self.config.subtraction_method(),
            apertures: self.config.apertures.clone(),
            toggles: self.config.toggles.clone(),
        }
    }

    /// Process one unit and record it. `Err` only for faults that must
    /// abort the batch.
    fn execute(&self, unit: &WorkUnit, processor: &dyn StageProcessor) -> Result<UnitOutcome> {
        let key = &unit.frame.key;
        let output = match processor.process(unit) {
            Ok(output) => output,
            Err(failure) => return Ok(unit_failed(unit.stage, key, failure.message)),
        };

        match self.record(unit, &output) {
            Ok(id) => {
                debug!(frame = %key, stage = %unit.stage, id, "Recorded stage");
                Ok(UnitOutcome::Completed)
            }
            Err(e) if e.is_duplicate() => {
                debug!(frame = %key, stage = %unit.stage, "Already recorded");
                Ok(UnitOutcome::AlreadyDone)
            }
            Err(e) if e.is_fatal() => {
                error!(frame = %key, stage = %unit.stage, error = %e, "Registry fault");
                Err(e)
            }
            Err(e) => Ok(unit_failed(unit.stage, key, e.to_string())),
        }
    }

    fn record(&self, unit: &WorkUnit, output: &StageOutput) -> Result<i64> {
        let key = &unit.frame.key;
        let missing = |table: &'static str| SubphotError::MissingUpstream {
            table,
            origin: key.to_string(),
        };

        match unit.stage {
            Stage::Calibrate => {
                let result = CalibrationResult {
                    artifact: unit.output.clone(),
                    header: output.header.clone(),
                    success: true,
                };
                let id = self.registry.record_calibration(&unit.frame, &result)?;
                if output.stats.is_some() || output.header.is_some() {
                    self.store_frame_info(&unit.frame, output)?;
                }
                Ok(id)
            }
            Stage::Align => {
                let reference = unit.reference.as_ref().ok_or_else(|| missing("reference_frames"))?;
                self.registry.record_alignment(
                    &unit.frame,
                    reference.id,
                    &unit.output,
                    output.diagnostics.as_ref(),
                    true,
                )
            }
            Stage::Subtract => {
                let reference = unit.reference.as_ref().ok_or_else(|| missing("reference_frames"))?;
                let aligned = unit
                    .upstream
                    .as_ref()
                    .ok_or_else(|| missing(Stage::Align.table()))?;
                self.registry.record_subtraction(
                    &unit.frame,
                    aligned.id,
                    reference.id,
                    &unit.kernel,
                    unit.method,
                    &unit.output,
                    true,
                )
            }
            stage => {
                let upstream = unit
                    .upstream
                    .as_ref()
                    .ok_or_else(|| missing("upstream"))?;
                self.registry.record_stage(
                    stage,
                    &unit.frame,
                    (upstream.stage, upstream.id),
                    &unit.output,
                    output.detail.as_ref(),
                    true,
                )
            }
        }
    }

    /// Cache the statistics of a calibrated frame, in the registry and as a
    /// JSON file. The file is best-effort.
    fn store_frame_info(&self, frame: &Frame, output: &StageOutput) -> Result<()> {
        self.registry
            .cache_frame_info(frame, output.stats.as_ref(), output.header.as_ref())?;
        let path = self.config.layout.frame_info_path(frame);
        if let Err(e) = write_frame_info(&path, &frame.key, output) {
            warn!(path = %path.display(), error = %e, "Could not write frame info file");
        }
        Ok(())
    }

    /// Re-measure calibrated frames of the scope whose cached statistics
    /// were dropped. Frames the processor cannot measure are skipped.
    fn refill_frame_info(&self, processor: &dyn StageProcessor) -> Result<usize> {
        let scope = self.config.scope;
        let known: HashSet<FrameKey> = self
            .registry
            .frame_info(&scope)?
            .into_iter()
            .map(|info| info.frame)
            .collect();
        let missing: HashMap<FrameKey, Upstream> = self
            .registry
            .completed(&scope, Stage::Calibrate)?
            .into_iter()
            .filter(|(key, _)| !known.contains(key))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let mut refilled = 0;
        for frame in self.registry.frames(&scope)? {
            let Some(calibrated) = missing.get(&frame.key) else {
                continue;
            };
            match processor.measure(&frame, &calibrated.artifact) {
                Ok(output) => {
                    self.store_frame_info(&frame, &output)?;
                    refilled += 1;
                }
                Err(failure) => {
                    warn!(frame = %frame.key, error = %failure, "Could not re-measure frame");
                }
            }
        }
        info!(%scope, refilled, missing = missing.len(), "Refilled frame info cache");
        Ok(refilled)
    }

    /// Select candidates, build and install a missing reference.
    ///
    /// `Ok(false)` when there are not yet enough usable frames; dependent
    /// stages then stay pending. A failed build aborts the batch.
    fn ensure_reference(
        &self,
        kind: ReferenceKind,
        snapshot: &mut ReferenceSnapshot,
        processor: &dyn StageProcessor,
    ) -> Result<bool> {
        let scope = self.config.scope;
        self.refill_frame_info(processor)?;
        let (source_stage, astrometric) = match kind {
            ReferenceKind::Astrometric => (Stage::Calibrate, None),
            ReferenceKind::Photometric => match snapshot.astrometric.clone() {
                Some(aref) => (Stage::Align, Some(aref)),
                None => return Ok(false),
            },
        };

        let artifacts: HashMap<FrameKey, _> = self
            .registry
            .completed(&scope, source_stage)?
            .into_iter()
            .map(|(key, upstream)| (key, upstream.artifact))
            .collect();
        let infos: Vec<_> = self
            .registry
            .frame_info(&scope)?
            .into_iter()
            .filter(|info| artifacts.contains_key(&info.frame))
            .collect();

        let sources = match kind {
            ReferenceKind::Astrometric => match select_astrometric(&infos) {
                Some((key, tier)) => {
                    info!(frame = %key, %tier, "Astrometric reference candidate chosen");
                    vec![key]
                }
                None => {
                    warn!(%scope, "No calibrated frame with statistics to build an astrometric reference from");
                    return Ok(false);
                }
            },
            ReferenceKind::Photometric => match select_photometric(&infos, &self.config.photref) {
                Some(keys) => keys,
                None => return Ok(false),
            },
        };

        let Some(best) = sources.first() else {
            return Ok(false);
        };
        let name = match kind {
            ReferenceKind::Astrometric => format!("tess{best}"),
            ReferenceKind::Photometric => format!("{}-tess{best}", self.config.sector.label()),
        };
        let inputs: Vec<_> = sources
            .iter()
            .filter_map(|key| artifacts.get(key).cloned())
            .collect();
        let request = ReferenceRequest {
            scope,
            kind,
            sources,
            inputs,
            output: self.config.layout.reference_path(
                scope.project,
                scope.camera,
                scope.ccd,
                kind,
                &name,
            ),
            astrometric,
            toggles: self.config.toggles.clone(),
        };

        let built = processor.build_reference(&request).map_err(|failure| {
            error!(%kind, error = %failure, "Reference construction failed");
            SubphotError::ReferenceBuild(format!("{kind} reference: {failure}"))
        })?;
        let installed =
            self.references
                .install(scope.project, scope.camera, scope.ccd, kind, &built)?;
        snapshot.set(installed);
        Ok(true)
    }
}

fn write_frame_info(path: &Path, frame: &FrameKey, output: &StageOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = json!({
        "frame": frame,
        "stats": output.stats,
        "header": output.header,
    });
    std::fs::write(path, serde_json::to_vec_pretty(&body)?)?;
    Ok(())
}

/// Log a unit's failure. It leaves no record, so the frame stays pending.
fn unit_failed(stage: Stage, frame: &FrameKey, message: String) -> UnitOutcome {
    let err = SubphotError::StageFailed {
        stage: stage.to_string(),
        frame: frame.to_string(),
        message: message.clone(),
    };
    warn!(error = %err, "Unit failed");
    UnitOutcome::Failed(message)
}

fn required_reference(stage: Stage) -> Option<ReferenceKind> {
    match stage {
        Stage::Align => Some(ReferenceKind::Astrometric),
        Stage::Subtract => Some(ReferenceKind::Photometric),
        _ => None,
    }
}
