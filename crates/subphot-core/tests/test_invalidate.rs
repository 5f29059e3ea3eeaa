#[allow(dead_code)]
mod common;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use common::{frames, FakeProcessor, Harness, PROJECT};
use subphot_core::frame::{Scope, Sector};
use subphot_core::invalidate::{Invalidator, Layer};
use subphot_core::pipeline::{Stage, WorkerPool};
use subphot_core::reference::ReferenceKind;

fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Run 6 frames through every stage on ccd 2 and ccd 3 of camera 2.
fn populated() -> Harness {
    let h = Harness::new();
    let processor = FakeProcessor::new();
    let pool = WorkerPool::new(4).unwrap();
    for ccd in [2, 3] {
        h.coordinator(2, ccd)
            .run_batch(&frames(2, ccd, 6), &processor, &pool)
            .unwrap();
    }
    h
}

fn invalidator(h: &Harness) -> Invalidator {
    let layout = common::config(h.base(), 2, 2).layout;
    Invalidator::new(layout, h.registry.clone(), h.references.clone())
}

fn layers(list: &[Layer]) -> BTreeSet<Layer> {
    list.iter().copied().collect()
}

// ---------------------------------------------------------------------------
// Scoping
// ---------------------------------------------------------------------------

#[test]
fn test_invalidation_stays_within_scope() {
    let h = populated();
    let target = Scope::new(PROJECT, 2, 2);
    let neighbour = Scope::new(PROJECT, 2, 3);
    let ccd2 = common::config(h.base(), 2, 2);
    let ccd3 = common::config(h.base(), 2, 3);

    let report = invalidator(&h)
        .invalidate(
            &target,
            &layers(&[
                Layer::Alignment,
                Layer::Subtraction,
                Layer::Photometry,
                Layer::Lightcurves,
                Layer::ReferenceFrames,
            ]),
        )
        .unwrap();

    // Five stages of six frames, plus two reference files.
    assert_eq!(report.files_removed, 5 * 6 + 2);
    assert_eq!(report.files_failed, 0);
    assert_eq!(report.references_cleared, 2);
    assert_eq!(report.rows_purged(), 5 * 6 + 2);

    let target_counts = common::counts(&h, 2, 2);
    for (stage, count) in &target_counts {
        let expected = if *stage == Stage::Calibrate { 6 } else { 0 };
        assert_eq!(*count, expected, "{stage} on ccd 2");
    }
    assert_eq!(files_in(&ccd2.stage_dir(Stage::Calibrate)).len(), 6);
    assert!(files_in(&ccd2.stage_dir(Stage::Align)).is_empty());
    assert!(files_in(&ccd2.stage_dir(Stage::Assemble)).is_empty());
    let snapshot = h.references.snapshot(&target).unwrap();
    assert!(snapshot.astrometric.is_none() && snapshot.photometric.is_none());

    assert!(common::counts(&h, 2, 3).iter().all(|(_, n)| *n == 6));
    for stage in [Stage::Calibrate, Stage::Align, Stage::Subtract, Stage::Photometer] {
        assert_eq!(files_in(&ccd3.stage_dir(stage)).len(), 6, "{stage} on ccd 3");
    }
    // Detrended and assembled light curves share a directory.
    assert_eq!(files_in(&ccd3.stage_dir(Stage::Assemble)).len(), 12);
    let kept = h.references.snapshot(&neighbour).unwrap();
    assert!(kept.astrometric.unwrap().path.exists());
    assert!(kept.photometric.unwrap().path.exists());
}

#[test]
fn test_sector_scope_leaves_other_sectors() {
    let h = populated();
    let other_sector = Scope::new(PROJECT, 2, 2).with_sector(Sector(2));

    let report = invalidator(&h)
        .invalidate(&other_sector, &layers(&[Layer::Calibration, Layer::Alignment]))
        .unwrap();

    assert_eq!(report.files_removed, 0);
    assert_eq!(report.rows_purged(), 0);
    assert!(common::counts(&h, 2, 2).iter().all(|(_, n)| *n == 6));
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

#[test]
fn test_layers_do_not_cascade() {
    let h = populated();
    let scope = Scope::new(PROJECT, 2, 2);

    invalidator(&h)
        .invalidate(&scope, &layers(&[Layer::Alignment]))
        .unwrap();

    assert_eq!(h.registry.count(&scope, Stage::Align).unwrap(), 0);
    assert_eq!(h.registry.count(&scope, Stage::Subtract).unwrap(), 6);
    let orphans = h.registry.orphans(&scope).unwrap();
    assert_eq!(orphans.len(), 6);
    assert!(orphans.iter().all(|o| o.missing == Stage::Align));
}

#[test]
fn test_frame_info_cache_layer() {
    let h = populated();
    let scope = Scope::new(PROJECT, 2, 2);
    let cache_dir = common::config(h.base(), 2, 2).layout.frame_info_dir(PROJECT);
    assert_eq!(files_in(&cache_dir).len(), 12);

    let report = invalidator(&h)
        .invalidate(&scope, &layers(&[Layer::FrameInfoCache]))
        .unwrap();

    assert_eq!(report.frame_info_purged, 6);
    assert_eq!(report.files_removed, 6);
    assert!(h.registry.frame_info(&scope).unwrap().is_empty());
    assert_eq!(h.registry.frame_info(&Scope::new(PROJECT, 2, 3)).unwrap().len(), 6);
    assert_eq!(files_in(&cache_dir).len(), 6);
    assert_eq!(h.registry.count(&scope, Stage::Calibrate).unwrap(), 6);
}

#[test]
fn test_repeated_invalidation_is_harmless() {
    let h = populated();
    let scope = Scope::new(PROJECT, 2, 2);
    let all: BTreeSet<Layer> = Layer::ALL.into_iter().collect();

    invalidator(&h).invalidate(&scope, &all).unwrap();
    let again = invalidator(&h).invalidate(&scope, &all).unwrap();

    assert_eq!(again.files_removed, 0);
    assert_eq!(again.rows_purged(), 0);
    assert_eq!(h.registry.frames(&scope).unwrap().len(), 6);
}

// ---------------------------------------------------------------------------
// Regeneration
// ---------------------------------------------------------------------------

#[test]
fn test_rerun_after_invalidation_regenerates() {
    let h = populated();
    let scope = Scope::new(PROJECT, 2, 2);
    let old = h.references.snapshot(&scope).unwrap();

    invalidator(&h)
        .invalidate(
            &scope,
            &layers(&[Layer::Subtraction, Layer::Photometry, Layer::Lightcurves, Layer::ReferenceFrames]),
        )
        .unwrap();

    let processor = FakeProcessor::new();
    let report = h
        .coordinator(2, 2)
        .run_batch(&frames(2, 2, 6), &processor, &WorkerPool::new(2).unwrap())
        .unwrap();

    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.completed, 4 * 6);
    assert!(common::counts(&h, 2, 2).iter().all(|(_, n)| *n == 6));
    // Both references were dropped; alignments survive and are not redone.
    assert_eq!(processor.reference_builds(), 2);
    assert_eq!(h.registry.count(&scope, Stage::Align).unwrap(), 6);
    let new = h.references.snapshot(&scope).unwrap();
    for kind in ReferenceKind::ALL {
        assert_ne!(new.get(kind).map(|r| r.id), old.get(kind).map(|r| r.id));
    }
}

#[test]
fn test_frame_info_cache_is_refilled_on_rerun() {
    let h = populated();
    let scope = Scope::new(PROJECT, 2, 2);
    let cache_dir = common::config(h.base(), 2, 2).layout.frame_info_dir(PROJECT);

    invalidator(&h)
        .invalidate(
            &scope,
            &layers(&[
                Layer::FrameInfoCache,
                Layer::ReferenceFrames,
                Layer::Alignment,
                Layer::Subtraction,
                Layer::Photometry,
                Layer::Lightcurves,
            ]),
        )
        .unwrap();
    assert!(h.registry.frame_info(&scope).unwrap().is_empty());

    let processor = FakeProcessor::new();
    let report = h
        .coordinator(2, 2)
        .run_batch(&frames(2, 2, 6), &processor, &WorkerPool::new(2).unwrap())
        .unwrap();

    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.completed, 5 * 6);
    assert_eq!(processor.measurements(), 6);
    assert_eq!(processor.reference_builds(), 2);
    assert_eq!(h.registry.frame_info(&scope).unwrap().len(), 6);
    assert_eq!(files_in(&cache_dir).len(), 12);
    assert!(common::counts(&h, 2, 2).iter().all(|(_, n)| *n == 6));
}
