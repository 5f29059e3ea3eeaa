#[allow(dead_code)]
mod common;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::{frame, frames, Harness, PROJECT};
use serde_json::json;
use subphot_core::config::KernelSpec;
use subphot_core::error::SubphotError;
use subphot_core::frame::{Frame, Scope, Sector};
use subphot_core::pipeline::{Stage, StageGraph, SubtractionMethod};
use subphot_core::registry::{CalibrationResult, FrameStats, WarpDiagnostics};
use subphot_core::store::Store;

fn scope(camera: u8, ccd: u8) -> Scope {
    Scope::new(PROJECT, camera, ccd)
}

fn calibrate(h: &Harness, frame: &Frame) -> i64 {
    h.registry
        .record_calibration(frame, &calibration(frame, true))
        .unwrap()
}

fn calibration(frame: &Frame, success: bool) -> CalibrationResult {
    CalibrationResult {
        artifact: PathBuf::from(format!("/work/cal/{}-cal.fits", frame.stem())),
        header: Some(json!({ "EXPTIME": 1800 })),
        success,
    }
}

fn align(h: &Harness, frame: &Frame, reference_id: i64) -> i64 {
    let artifact = PathBuf::from(format!("/work/aligned/{}-xtrns.fits", frame.stem()));
    h.registry
        .record_alignment(frame, reference_id, &artifact, None, true)
        .unwrap()
}

fn kernel() -> KernelSpec {
    KernelSpec::parse("b/4;i/4;d=4/4").unwrap()
}

/// Take a frame through every stage on the full graph. Returns the record
/// ids in stage order.
fn full_lineage(h: &Harness, frame: &Frame) -> Vec<i64> {
    let cal = calibrate(h, frame);
    let aligned = align(h, frame, 1);
    let sub = h
        .registry
        .record_subtraction(
            frame,
            aligned,
            2,
            &kernel(),
            SubtractionMethod::Normal,
            Path::new(&format!("/work/sub/nsub-ref2-{}-xtrns.fits", frame.stem())),
            true,
        )
        .unwrap();
    let phot = h
        .registry
        .record_stage(
            Stage::Photometer,
            frame,
            (Stage::Subtract, sub),
            Path::new(&format!("/work/phot/{}.iphot", frame.stem())),
            None,
            true,
        )
        .unwrap();
    let detrended = h
        .registry
        .record_stage(
            Stage::Detrend,
            frame,
            (Stage::Photometer, phot),
            Path::new(&format!("/work/lc/{}.epdlc", frame.stem())),
            None,
            true,
        )
        .unwrap();
    let assembled = h
        .registry
        .record_stage(
            Stage::Assemble,
            frame,
            (Stage::Detrend, detrended),
            Path::new(&format!("/work/lc/{}.grcollectilc", frame.stem())),
            None,
            true,
        )
        .unwrap();
    vec![cal, aligned, sub, phot, detrended, assembled]
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[test]
fn test_ingest_is_idempotent() {
    let h = Harness::new();
    let batch = frames(2, 2, 5);

    assert_eq!(h.registry.ingest(&batch).unwrap(), 5);
    assert_eq!(h.registry.ingest(&batch).unwrap(), 0);

    let stored = h.registry.frames(&scope(2, 2)).unwrap();
    assert_eq!(stored, batch);
    assert_eq!(h.registry.frame(PROJECT, &batch[3].key).unwrap().as_ref(), Some(&batch[3]));
}

#[test]
fn test_projects_keep_separate_lineages() {
    let h = Harness::new();
    let ours = frames(2, 2, 3);
    let theirs: Vec<Frame> = ours
        .iter()
        .cloned()
        .map(|mut f| {
            f.project = PROJECT + 1;
            f
        })
        .collect();
    h.registry.ingest(&ours).unwrap();
    for f in &ours {
        calibrate(&h, f);
    }

    // The same raw frames join another project as new frames.
    assert_eq!(h.registry.ingest(&theirs).unwrap(), 3);
    let other = Scope::new(PROJECT + 1, 2, 2);
    assert_eq!(h.registry.frames(&other).unwrap(), theirs);
    assert_eq!(h.registry.count(&other, Stage::Calibrate).unwrap(), 0);
    assert_eq!(h.registry.pending_work(&other, Stage::Calibrate).count(), 3);
    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Calibrate).count(), 0);

    // Our calibration does not unlock their alignment.
    let err = h
        .registry
        .record_alignment(&theirs[0], 1, Path::new("/a.fits"), None, true)
        .unwrap_err();
    assert!(matches!(err, SubphotError::MissingUpstream { .. }));

    calibrate(&h, &theirs[0]);
    assert_eq!(h.registry.calibrations(&theirs[0]).unwrap().len(), 1);
    assert_eq!(h.registry.calibrations(&ours[0]).unwrap().len(), 1);
    h.registry.purge(&other, &[Stage::Calibrate]).unwrap();
    assert_eq!(h.registry.count(&scope(2, 2), Stage::Calibrate).unwrap(), 3);
}

#[test]
fn test_frames_are_listed_per_scope() {
    let h = Harness::new();
    h.registry.ingest(&frames(2, 2, 3)).unwrap();
    h.registry.ingest(&frames(2, 3, 4)).unwrap();

    assert_eq!(h.registry.frames(&scope(2, 2)).unwrap().len(), 3);
    assert_eq!(h.registry.frames(&scope(2, 3)).unwrap().len(), 4);
    assert!(h
        .registry
        .frames(&scope(2, 3).with_sector(Sector(2)))
        .unwrap()
        .is_empty());
}

// ---------------------------------------------------------------------------
// Record uniqueness and lineage
// ---------------------------------------------------------------------------

#[test]
fn test_calibration_requires_ingested_frame() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    let err = h
        .registry
        .record_calibration(&f, &calibration(&f, true))
        .unwrap_err();
    assert!(matches!(err, SubphotError::MissingUpstream { .. }), "got {err:?}");
}

#[test]
fn test_duplicate_calibration_is_rejected() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();

    calibrate(&h, &f);
    let err = h
        .registry
        .record_calibration(&f, &calibration(&f, true))
        .unwrap_err();
    assert!(err.is_duplicate(), "got {err:?}");
    assert!(!err.is_fatal());
    assert_eq!(h.registry.calibrations(&f).unwrap().len(), 1);
}

#[test]
fn test_alignment_unique_per_reference() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();
    calibrate(&h, &f);

    align(&h, &f, 1);
    let artifact = PathBuf::from(format!("/work/aligned/{}-xtrns.fits", f.stem()));
    let err = h
        .registry
        .record_alignment(&f, 1, &artifact, None, true)
        .unwrap_err();
    assert!(err.is_duplicate());

    // Same frame against a newer reference is a distinct result.
    align(&h, &f, 2);
    let alignments = h.registry.alignments(&f).unwrap();
    assert_eq!(alignments.len(), 2);
    assert_eq!(
        alignments.iter().map(|a| a.reference_id).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
fn test_alignment_keeps_warp_diagnostics() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();
    calibrate(&h, &f);

    let diagnostics = WarpDiagnostics {
        margin: Some(50.0),
        threshold: Some(0.2),
        payload: Some(json!({ "corners": [1, 2, 3, 4] })),
    };
    h.registry
        .record_alignment(&f, 1, Path::new("/a.fits"), Some(&diagnostics), true)
        .unwrap();

    let stored = h.registry.alignments(&f).unwrap().remove(0);
    assert_eq!(stored.diagnostics, Some(diagnostics));
}

#[test]
fn test_alignment_requires_successful_calibration() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();

    let err = h
        .registry
        .record_alignment(&f, 1, Path::new("/a.fits"), None, true)
        .unwrap_err();
    assert!(matches!(err, SubphotError::MissingUpstream { .. }));

    h.registry
        .record_calibration(&f, &calibration(&f, false))
        .unwrap();
    let err = h
        .registry
        .record_alignment(&f, 1, Path::new("/a.fits"), None, true)
        .unwrap_err();
    assert!(matches!(err, SubphotError::MissingUpstream { .. }));
}

#[test]
fn test_subtraction_kernel_is_part_of_identity() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();
    calibrate(&h, &f);
    let aligned = align(&h, &f, 1);
    let artifact = Path::new("/work/sub/nsub-ref2-x-xtrns.fits");

    let record = |spec: &str| {
        h.registry.record_subtraction(
            &f,
            aligned,
            2,
            &KernelSpec::parse(spec).unwrap(),
            SubtractionMethod::Normal,
            artifact,
            true,
        )
    };
    record("b/4;i/4;d=4/4").unwrap();
    record("b/2;i/2;d=2/2").unwrap();
    assert!(record("b/4;i/4;d=4/4").unwrap_err().is_duplicate());

    let subtractions = h.registry.subtractions(&f).unwrap();
    assert_eq!(subtractions.len(), 2);
    assert!(subtractions.iter().all(|s| s.aligned_id == aligned));
}

#[test]
fn test_subtraction_requires_its_aligned_frame() {
    let h = Harness::new();
    let a = frame(2, 2, 0);
    let b = frame(2, 2, 1);
    h.registry.ingest(&[a.clone(), b.clone()]).unwrap();
    calibrate(&h, &a);
    calibrate(&h, &b);
    let aligned_b = align(&h, &b, 1);

    // An aligned id belonging to another frame is not a valid upstream.
    let err = h
        .registry
        .record_subtraction(
            &a,
            aligned_b,
            2,
            &kernel(),
            SubtractionMethod::Normal,
            Path::new("/s.fits"),
            true,
        )
        .unwrap_err();
    assert!(matches!(err, SubphotError::MissingUpstream { .. }));
}

#[test]
fn test_generic_recorder_rejects_dedicated_stages() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    let err = h
        .registry
        .record_stage(
            Stage::Align,
            &f,
            (Stage::Calibrate, 1),
            Path::new("/x"),
            None,
            true,
        )
        .unwrap_err();
    assert!(matches!(err, SubphotError::InvalidConfig(_)));
}

#[test]
fn test_full_lineage_is_traceable() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();
    let ids = full_lineage(&h, &f);

    let assembled = h.registry.stage_records(Stage::Assemble, &f).unwrap();
    assert_eq!(assembled.len(), 1);
    assert_eq!(assembled[0].upstream_stage, Stage::Detrend);
    assert_eq!(assembled[0].upstream_id, ids[4]);

    let detrended = h.registry.stage_records(Stage::Detrend, &f).unwrap();
    assert_eq!(detrended[0].upstream_id, ids[3]);
    let photometry = h.registry.stage_records(Stage::Photometer, &f).unwrap();
    assert_eq!(photometry[0].upstream_id, ids[2]);
    let subtracted = h.registry.subtractions(&f).unwrap();
    assert_eq!(subtracted[0].aligned_id, ids[1]);
    assert_eq!(subtracted[0].kernel_spec, "b/4;i/4;d=4/4");

    assert!(h.registry.orphans(&scope(2, 2)).unwrap().is_empty());
    let counts = common::counts(&h, 2, 2);
    assert!(counts.iter().all(|(_, n)| *n == 1), "{counts:?}");
}

// ---------------------------------------------------------------------------
// Pending work
// ---------------------------------------------------------------------------

#[test]
fn test_pending_work_tracks_gaps() {
    let h = Harness::new();
    let batch = frames(2, 2, 3);
    h.registry.ingest(&batch).unwrap();
    let cal0 = calibrate(&h, &batch[0]);
    calibrate(&h, &batch[2]);

    let pending: Vec<_> = h
        .registry
        .pending_work(&scope(2, 2), Stage::Calibrate)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].frame.key, batch[1].key);
    assert!(pending[0].upstream.is_none());

    let pending: Vec<_> = h
        .registry
        .pending_work(&scope(2, 2), Stage::Align)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pending.len(), 2);
    let upstream = pending[0].upstream.as_ref().unwrap();
    assert_eq!(upstream.stage, Stage::Calibrate);
    assert_eq!(upstream.id, cal0);
    assert!(upstream.artifact.ends_with(format!("{}-cal.fits", batch[0].stem())));
}

#[test]
fn test_failed_records_do_not_unblock_next_stage() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();
    h.registry
        .record_calibration(&f, &calibration(&f, false))
        .unwrap();

    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Align).count(), 0);
}

#[test]
fn test_failed_attempt_stays_pending_until_retried() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();
    calibrate(&h, &f);
    let artifact = PathBuf::from(format!("/work/aligned/{}-xtrns.fits", f.stem()));
    h.registry
        .record_alignment(&f, 1, &artifact, None, false)
        .unwrap();

    let pending: Vec<_> = h
        .registry
        .pending_work(&scope(2, 2), Stage::Align)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].frame.key, f.key);
    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Subtract).count(), 0);

    // The successful retry with the same inputs replaces the failed attempt.
    align(&h, &f, 1);
    let alignments = h.registry.alignments(&f).unwrap();
    assert_eq!(alignments.len(), 1);
    assert!(alignments[0].success);
    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Align).count(), 0);
    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Subtract).count(), 1);
}

#[test]
fn test_pending_work_paginates_without_repeats() {
    let h = Harness::new();
    let batch = frames(2, 2, 600);
    h.registry.ingest(&batch).unwrap();

    // Record while consuming: later pages must neither skip nor repeat.
    let mut seen = HashSet::new();
    for item in h.registry.pending_work(&scope(2, 2), Stage::Calibrate) {
        let pending = item.unwrap();
        assert!(seen.insert(pending.frame.key.clone()), "repeated {}", pending.frame.key);
        calibrate(&h, &pending.frame);
    }
    assert_eq!(seen.len(), 600);
    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Calibrate).count(), 0);
    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Align).count(), 600);
}

#[test]
fn test_pending_assembly_follows_stage_graph() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();
    let ids = full_lineage(&h, &f);
    h.registry.purge(&scope(2, 2), &[Stage::Detrend, Stage::Assemble]).unwrap();

    assert_eq!(h.registry.pending_work(&scope(2, 2), Stage::Assemble).count(), 0);

    let skip = StageGraph::new(true);
    let pending: Vec<_> = h
        .registry
        .pending_work_in(&scope(2, 2), Stage::Assemble, skip)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pending.len(), 1);
    let upstream = pending[0].upstream.as_ref().unwrap();
    assert_eq!((upstream.stage, upstream.id), (Stage::Photometer, ids[3]));
}

// ---------------------------------------------------------------------------
// Purge and lineage checks
// ---------------------------------------------------------------------------

#[test]
fn test_purge_is_scoped() {
    let h = Harness::new();
    let ccd2 = frames(2, 2, 4);
    let ccd3 = frames(2, 3, 4);
    h.registry.ingest(&ccd2).unwrap();
    h.registry.ingest(&ccd3).unwrap();
    for f in ccd2.iter().chain(&ccd3) {
        calibrate(&h, f);
        align(&h, f, 1);
    }

    let purged = h
        .registry
        .purge(&scope(2, 2), &[Stage::Calibrate, Stage::Align])
        .unwrap();
    assert_eq!(purged, vec![(Stage::Calibrate, 4), (Stage::Align, 4)]);

    assert_eq!(h.registry.count(&scope(2, 2), Stage::Align).unwrap(), 0);
    assert_eq!(h.registry.count(&scope(2, 3), Stage::Align).unwrap(), 4);
    assert_eq!(h.registry.count(&scope(2, 3), Stage::Calibrate).unwrap(), 4);
    assert_eq!(h.registry.frames(&scope(2, 2)).unwrap().len(), 4);
}

#[test]
fn test_orphans_after_partial_purge() {
    let h = Harness::new();
    let batch = frames(2, 2, 2);
    h.registry.ingest(&batch).unwrap();
    for f in &batch {
        full_lineage(&h, f);
    }

    h.registry.purge(&scope(2, 2), &[Stage::Align]).unwrap();
    let orphans = h.registry.orphans(&scope(2, 2)).unwrap();

    assert_eq!(orphans.len(), 2);
    assert!(orphans
        .iter()
        .all(|o| o.stage == Stage::Subtract && o.missing == Stage::Align));
    assert!(h.registry.orphans(&scope(2, 3)).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Frame information cache
// ---------------------------------------------------------------------------

#[test]
fn test_frame_info_cache_replaces_and_purges() {
    let h = Harness::new();
    let f = frame(2, 2, 0);
    h.registry.ingest(&[f.clone()]).unwrap();

    let mut stats = FrameStats {
        median_s: 2.5,
        median_d: 0.1,
        background_median: 300.0,
        background_stdev: 4.0,
        detections: 1200,
    };
    h.registry.cache_frame_info(&f, Some(&stats), None).unwrap();
    stats.median_s = 3.0;
    h.registry
        .cache_frame_info(&f, Some(&stats), Some(&json!({ "GAIN": 5.2 })))
        .unwrap();

    let infos = h.registry.frame_info(&scope(2, 2)).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].stats.as_ref().unwrap().median_s, 3.0);
    assert_eq!(infos[0].header, Some(json!({ "GAIN": 5.2 })));

    assert_eq!(h.registry.purge_frame_info(&scope(2, 3)).unwrap(), 0);
    assert_eq!(h.registry.purge_frame_info(&scope(2, 2)).unwrap(), 1);
    assert!(h.registry.frame_info(&scope(2, 2)).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// On-disk store
// ---------------------------------------------------------------------------

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("registry.sqlite");
    let f = frame(2, 2, 0);
    {
        let store = Store::open(&db).unwrap();
        let registry = subphot_core::registry::FrameRegistry::new(store);
        registry.ingest(&[f.clone()]).unwrap();
        registry.record_calibration(&f, &calibration(&f, true)).unwrap();
    }

    let registry = subphot_core::registry::FrameRegistry::new(Store::open(&db).unwrap());
    assert_eq!(registry.count(&scope(2, 2), Stage::Calibrate).unwrap(), 1);
    let stored = registry.calibrations(&f).unwrap();
    assert_eq!(stored[0].header, Some(json!({ "EXPTIME": 1800 })));
    assert_eq!(stored[0].project, PROJECT);
}
