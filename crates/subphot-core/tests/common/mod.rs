use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{Duration, NaiveDate, Timelike};
use serde_json::json;
use subphot_core::config::{resolve, ResolvedConfig, RunParams, Toggle};
use subphot_core::frame::{frame_file_name, Frame, FrameKey, Sector};
use subphot_core::pipeline::{
    ReferenceRequest, Stage, StageCoordinator, StageFailure, StageOutput, StageProcessor,
    WorkUnit,
};
use subphot_core::reference::{NewReference, ReferenceManager};
use subphot_core::registry::{FrameRegistry, FrameStats};
use subphot_core::store::Store;
use tempfile::TempDir;

pub const PROJECT: u32 = 1001;
pub const SECTOR: &str = "s0001";

/// Frame `index` of sector 1 on (camera, ccd), captured 30 minutes apart.
pub fn frame(camera: u8, ccd: u8, index: u32) -> Frame {
    frame_in(PROJECT, camera, ccd, index)
}

/// Same raw frame as [`frame`], ingested under another project.
pub fn frame_in(project: u32, camera: u8, ccd: u8, index: u32) -> Frame {
    let start = NaiveDate::from_yo_opt(2018, 206)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let captured_at = start + Duration::minutes(30 * index as i64);
    let name = frame_file_name(captured_at, Sector(1), camera, ccd, 120);
    Frame::from_path(&Path::new("/data/raw/s0001").join(name), project).unwrap()
}

/// `count` consecutive frames of (camera, ccd).
pub fn frames(camera: u8, ccd: u8, count: u32) -> Vec<Frame> {
    (0..count).map(|i| frame(camera, ccd, i)).collect()
}

/// Run parameters rooted at `base`, with a photometric reference buildable
/// from a single frame.
pub fn params(base: &Path, camera: u8, ccd: u8) -> RunParams {
    let mut params = RunParams::new(PROJECT, SECTOR, camera, ccd);
    params.paths.base_dir = base.to_path_buf();
    params.photref.min_frames = 1;
    params.photref.max_candidates = 5;
    params.workers = Some(4);
    params
}

pub fn config(base: &Path, camera: u8, ccd: u8) -> ResolvedConfig {
    resolve(&params(base, camera, ccd)).unwrap()
}

/// Temporary working tree with an in-memory registry.
pub struct Harness {
    pub dir: TempDir,
    pub store: Store,
    pub registry: FrameRegistry,
    pub references: ReferenceManager,
}

impl Harness {
    pub fn new() -> Self {
        let store = Store::open_in_memory().unwrap();
        Self {
            dir: TempDir::new().unwrap(),
            registry: FrameRegistry::new(store.clone()),
            references: ReferenceManager::new(store.clone()),
            store,
        }
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn coordinator(&self, camera: u8, ccd: u8) -> StageCoordinator {
        self.coordinator_with(config(self.base(), camera, ccd))
    }

    pub fn coordinator_with(&self, config: ResolvedConfig) -> StageCoordinator {
        StageCoordinator::new(self.registry.clone(), self.references.clone(), config)
    }

    pub fn skip_detrend_coordinator(&self, camera: u8, ccd: u8) -> StageCoordinator {
        let mut params = params(self.base(), camera, ccd);
        params.toggles.enable(Toggle::SkipDetrend);
        self.coordinator_with(resolve(&params).unwrap())
    }
}

/// Stage processor that writes empty artifacts and reports synthetic
/// statistics instead of running external tools.
///
/// Failures can be injected per (frame, stage), either permanently or for
/// the first attempt only.
#[derive(Default)]
pub struct FakeProcessor {
    failing: HashSet<(FrameKey, Stage)>,
    failing_once: Mutex<HashSet<(FrameKey, Stage)>>,
    panicking: HashSet<(FrameKey, Stage)>,
    failing_references: bool,
    calls: AtomicUsize,
    reference_builds: AtomicUsize,
    measurements: AtomicUsize,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, key: &FrameKey, stage: Stage) -> Self {
        self.failing.insert((key.clone(), stage));
        self
    }

    pub fn failing_once(self, key: &FrameKey, stage: Stage) -> Self {
        self.failing_once
            .lock()
            .unwrap()
            .insert((key.clone(), stage));
        self
    }

    pub fn panicking(mut self, key: &FrameKey, stage: Stage) -> Self {
        self.panicking.insert((key.clone(), stage));
        self
    }

    pub fn failing_references(mut self) -> Self {
        self.failing_references = true;
        self
    }

    /// Units processed so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reference_builds(&self) -> usize {
        self.reference_builds.load(Ordering::SeqCst)
    }

    /// Calibrated frames re-measured after their cached info was dropped.
    pub fn measurements(&self) -> usize {
        self.measurements.load(Ordering::SeqCst)
    }
}

/// Deterministic per-frame statistics that pass the default photometric
/// reference cuts.
pub fn stats_for(frame: &Frame) -> FrameStats {
    let minutes = frame.captured_at.num_seconds_from_midnight() / 60;
    FrameStats {
        median_s: 1.0 + (minutes % 97) as f64 / 10.0,
        median_d: 0.01 * (minutes % 7) as f64,
        background_median: 200.0 + (minutes % 13) as f64,
        background_stdev: 2.0,
        detections: 4000 + minutes % 500,
    }
}

fn touch(path: &Path) -> Result<(), StageFailure> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StageFailure::new(e.to_string()))?;
    }
    std::fs::write(path, b"").map_err(|e| StageFailure::new(e.to_string()))
}

impl StageProcessor for FakeProcessor {
    fn process(&self, unit: &WorkUnit) -> Result<StageOutput, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (unit.frame.key.clone(), unit.stage);
        if self.panicking.contains(&key) {
            panic!("tool crashed on {}", unit.frame.key);
        }
        if self.failing.contains(&key) || self.failing_once.lock().unwrap().remove(&key) {
            return Err(StageFailure::new(format!(
                "{} failed on {}",
                unit.stage, unit.frame.key
            )));
        }

        touch(&unit.output)?;
        let mut output = StageOutput::default();
        match unit.stage {
            Stage::Calibrate => {
                output.stats = Some(stats_for(&unit.frame));
                output.header = Some(json!({ "CAMERA": unit.frame.camera, "CCD": unit.frame.ccd }));
            }
            Stage::Photometer => {
                output.detail = Some(json!({ "apertures": unit.apertures.len() }));
            }
            _ => {}
        }
        Ok(output)
    }

    fn build_reference(&self, request: &ReferenceRequest) -> Result<NewReference, StageFailure> {
        self.reference_builds.fetch_add(1, Ordering::SeqCst);
        if self.failing_references {
            return Err(StageFailure::new("combine failed"));
        }
        touch(&request.output)?;
        let keys: Vec<&str> = request.sources.iter().map(FrameKey::as_str).collect();
        Ok(NewReference {
            path: request.output.clone(),
            sources: Some(json!(keys)),
            metadata: None,
        })
    }

    fn measure(&self, frame: &Frame, calibrated: &Path) -> Result<StageOutput, StageFailure> {
        self.measurements.fetch_add(1, Ordering::SeqCst);
        if !calibrated.exists() {
            return Err(StageFailure::new(format!("{} is gone", calibrated.display())));
        }
        Ok(StageOutput {
            stats: Some(stats_for(frame)),
            ..Default::default()
        })
    }
}

/// Count of records of every stage within the scope of (camera, ccd).
pub fn counts(harness: &Harness, camera: u8, ccd: u8) -> Vec<(Stage, usize)> {
    let scope = subphot_core::frame::Scope::new(PROJECT, camera, ccd);
    harness.registry.stage_counts(&scope).unwrap()
}
