//! Choosing which frames a new reference is built from.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::consts::{
    DEFAULT_PHOTREF_MAX_BACKGROUND_MEDIAN, DEFAULT_PHOTREF_MAX_BACKGROUND_STDEV,
    DEFAULT_PHOTREF_MAX_CANDIDATES, DEFAULT_PHOTREF_MIN_FRAMES, REFERENCE_RANK_DEPTH,
};
use crate::error::{Result, SubphotError};
use crate::frame::FrameKey;
use crate::registry::{FrameInfo, FrameStats};

/// Quality cuts for photometric-reference candidates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotrefCriteria {
    /// Frames that must pass the cuts before a reference is built.
    pub min_frames: usize,
    /// Frames stacked into the reference.
    pub max_candidates: usize,
    pub max_background_stdev: f64,
    pub max_background_median: f64,
    pub min_detections: u32,
}

impl Default for PhotrefCriteria {
    fn default() -> Self {
        Self {
            min_frames: DEFAULT_PHOTREF_MIN_FRAMES,
            max_candidates: DEFAULT_PHOTREF_MAX_CANDIDATES,
            max_background_stdev: DEFAULT_PHOTREF_MAX_BACKGROUND_STDEV,
            max_background_median: DEFAULT_PHOTREF_MAX_BACKGROUND_MEDIAN,
            min_detections: 0,
        }
    }
}

impl PhotrefCriteria {
    pub fn validate(&self) -> Result<()> {
        if self.min_frames == 0 || self.max_candidates == 0 {
            return Err(SubphotError::InvalidConfig(
                "photometric reference frame counts must be positive".into(),
            ));
        }
        if self.max_background_stdev <= 0.0 || self.max_background_median <= 0.0 {
            return Err(SubphotError::InvalidConfig(
                "photometric reference background limits must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn accepts(&self, stats: &FrameStats) -> bool {
        stats.background_stdev < self.max_background_stdev
            && stats.background_median < self.max_background_median
            && stats.detections >= self.min_detections
    }
}

/// Which ranking intersection produced the astrometric reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionTier {
    /// Sharp, round, low background and many detections.
    AllCriteria,
    /// Sharp, round and many detections.
    SharpRoundCrowded,
    SharpRound,
    /// No intersection; the sharpest frame.
    Sharpest,
}

impl fmt::Display for SelectionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AllCriteria => "all criteria",
            Self::SharpRoundCrowded => "S, D and detections",
            Self::SharpRound => "S and D",
            Self::Sharpest => "best S only",
        };
        f.write_str(name)
    }
}

fn with_stats(infos: &[FrameInfo]) -> Vec<(&FrameKey, &FrameStats)> {
    let mut candidates: Vec<_> = infos
        .iter()
        .filter_map(|info| info.stats.as_ref().map(|s| (&info.frame, s)))
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(b.0));
    candidates
}

fn top<'a, F>(candidates: &[(&'a FrameKey, &FrameStats)], mut cmp: F) -> Vec<&'a FrameKey>
where
    F: FnMut(&FrameStats, &FrameStats) -> Ordering,
{
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| cmp(a.1, b.1));
    ranked
        .into_iter()
        .take(REFERENCE_RANK_DEPTH)
        .map(|(key, _)| key)
        .collect()
}

/// Pick the astrometric reference from calibrated frames' statistics.
///
/// Each ranking (largest S, smallest |D|, lowest background, most
/// detections) is cut to its top [`REFERENCE_RANK_DEPTH`] frames. The pick
/// is the earliest frame present in the widest intersection available, or
/// the sharpest frame when even S and D do not intersect.
pub fn select_astrometric(infos: &[FrameInfo]) -> Option<(FrameKey, SelectionTier)> {
    let candidates = with_stats(infos);
    if candidates.is_empty() {
        return None;
    }

    let by_s = top(&candidates, |a, b| b.median_s.total_cmp(&a.median_s));
    let sharp: HashSet<_> = by_s.iter().copied().collect();
    let by_d: HashSet<_> = top(&candidates, |a, b| {
        a.median_d.abs().total_cmp(&b.median_d.abs())
    })
    .into_iter()
    .collect();
    let by_background: HashSet<_> = top(&candidates, |a, b| {
        a.background_median.total_cmp(&b.background_median)
    })
    .into_iter()
    .collect();
    let by_detections: HashSet<_> =
        top(&candidates, |a, b| b.detections.cmp(&a.detections))
            .into_iter()
            .collect();

    // Candidates are in frame order, so the first match is the earliest frame.
    let earliest = |keep: fn(bool, bool, bool) -> bool| {
        candidates.iter().map(|(key, _)| *key).find(|k| {
            sharp.contains(k)
                && keep(
                    by_d.contains(k),
                    by_background.contains(k),
                    by_detections.contains(k),
                )
        })
    };

    let (key, tier) = if let Some(key) = earliest(|d, bg, n| d && bg && n) {
        (key, SelectionTier::AllCriteria)
    } else if let Some(key) = earliest(|d, _, n| d && n) {
        (key, SelectionTier::SharpRoundCrowded)
    } else if let Some(key) = earliest(|d, _, _| d) {
        (key, SelectionTier::SharpRound)
    } else {
        (*by_s.first()?, SelectionTier::Sharpest)
    };

    if tier == SelectionTier::AllCriteria {
        debug!(frame = %key, "Selected astrometric reference");
    } else {
        warn!(frame = %key, %tier, "Astrometric reference chosen from a reduced intersection");
    }
    Some((key.clone(), tier))
}

/// Frames to stack into a photometric reference, best S first.
///
/// Returns `None` if fewer than `criteria.min_frames` frames pass the cuts.
pub fn select_photometric(infos: &[FrameInfo], criteria: &PhotrefCriteria) -> Option<Vec<FrameKey>> {
    let mut passing: Vec<_> = with_stats(infos)
        .into_iter()
        .filter(|(_, stats)| criteria.accepts(stats))
        .collect();

    if passing.len() < criteria.min_frames {
        warn!(
            passing = passing.len(),
            required = criteria.min_frames,
            "Too few photometric reference candidates"
        );
        return None;
    }

    passing.sort_by(|a, b| b.1.median_s.total_cmp(&a.1.median_s));
    let chosen: Vec<FrameKey> = passing
        .into_iter()
        .take(criteria.max_candidates)
        .map(|(key, _)| key.clone())
        .collect();
    debug!(count = chosen.len(), "Selected photometric reference candidates");
    Some(chosen)
}
