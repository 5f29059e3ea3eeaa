use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::{Frame, FrameKey};
use crate::pipeline::{Stage, SubtractionMethod};

/// Outcome of calibrating one frame, as reported by the processing tools.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationResult {
    pub artifact: PathBuf,
    /// Header metadata of the calibrated image.
    pub header: Option<Value>,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CalibratedFrame {
    pub id: i64,
    pub origin: FrameKey,
    pub artifact: PathBuf,
    pub project: u32,
    pub header: Option<Value>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Quality diagnostics of a warp onto the astrometric reference grid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WarpDiagnostics {
    pub margin: Option<f64>,
    pub threshold: Option<f64>,
    /// Tool-specific payload, stored verbatim.
    pub payload: Option<Value>,
}

/// Record of the astrometric registration ("aref-shifted frame") stage.
#[derive(Clone, Debug, PartialEq)]
pub struct AlignedFrame {
    pub id: i64,
    pub origin: FrameKey,
    /// Astrometric reference the frame was aligned to.
    pub reference_id: i64,
    pub artifact: PathBuf,
    pub success: bool,
    pub diagnostics: Option<WarpDiagnostics>,
    pub created_at: DateTime<Utc>,
}

/// Record of the differencing stage.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtractedFrame {
    pub id: i64,
    pub origin: FrameKey,
    pub aligned_id: i64,
    /// Photometric reference that was convolved and subtracted.
    pub reference_id: i64,
    pub kernel_spec: String,
    pub method: SubtractionMethod,
    pub artifact: PathBuf,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Record of a downstream stage (photometry, detrending, assembly).
#[derive(Clone, Debug, PartialEq)]
pub struct StageRecord {
    pub id: i64,
    pub stage: Stage,
    pub origin: FrameKey,
    pub upstream_stage: Stage,
    pub upstream_id: i64,
    pub artifact: PathBuf,
    pub success: bool,
    pub detail: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// The prerequisite record a pending unit builds on.
#[derive(Clone, Debug, PartialEq)]
pub struct Upstream {
    pub stage: Stage,
    pub id: i64,
    pub artifact: PathBuf,
}

/// A frame with no record for some stage whose prerequisite is satisfied.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingFrame {
    pub frame: Frame,
    /// `None` when the stage only requires ingestion.
    pub upstream: Option<Upstream>,
}

/// A stage record whose upstream record no longer exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Orphan {
    pub stage: Stage,
    pub record_id: i64,
    pub origin: FrameKey,
    pub missing: Stage,
}
