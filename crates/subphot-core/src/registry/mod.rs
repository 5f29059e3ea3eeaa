//! Persistent record of what has happened to each frame at each stage.
//!
//! Stage records are created once, at successful completion, and never
//! mutated. Each stage table carries a uniqueness constraint over the full
//! input lineage of a record; that constraint is what makes concurrent and
//! repeated execution safe. A racing or repeated insert fails with
//! [`SubphotError::DuplicateRecord`], which callers read as "already done".
//!
//! Frames are identified by (project, frame key): the same raw frame
//! processed for two projects has two independent lineages. A record with
//! `success = 0` marks a failed attempt. It never satisfies a prerequisite,
//! leaves the frame pending, and is replaced by the next attempt with the
//! same inputs.

mod frame_info;
mod pending;
mod records;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::KernelSpec;
use crate::error::{Result, SubphotError};
use crate::frame::{Frame, FrameKey, Scope, Sector};
use crate::pipeline::{Stage, StageGraph, SubtractionMethod};
use crate::store::{insert_error, Store};

pub use frame_info::{FrameInfo, FrameStats};
pub use pending::PendingWork;
pub use records::{
    AlignedFrame, CalibratedFrame, CalibrationResult, Orphan, PendingFrame, StageRecord,
    SubtractedFrame, Upstream, WarpDiagnostics,
};

pub(crate) const FRAME_COLUMNS: &str =
    "f.frame_key, f.project, f.sector, f.camera, f.ccd, f.scid, f.captured_at, f.path";

/// Scope predicate over the `frames` table aliased `f`, bound to `?1`..`?4`.
pub(crate) const SCOPE_FILTER: &str =
    "f.project = ?1 AND f.camera = ?2 AND f.ccd = ?3 AND (?4 IS NULL OR f.sector = ?4)";

#[derive(Clone)]
pub struct FrameRegistry {
    store: Store,
}

impl FrameRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register input frames under their project. Frames the project already
    /// knows are left untouched; the same raw frame may belong to several
    /// projects, each with its own lineage.
    ///
    /// Returns the number of newly ingested frames.
    pub fn ingest(&self, frames: &[Frame]) -> Result<usize> {
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO frames
                 (project, frame_key, sector, camera, ccd, scid, captured_at, path, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            let now = Utc::now();
            for frame in frames {
                inserted += stmt.execute(params![
                    frame.project,
                    frame.key.as_str(),
                    frame.sector.0,
                    frame.camera,
                    frame.ccd,
                    frame.scid,
                    frame.captured_at,
                    path_str(&frame.path),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        info!(total = frames.len(), new = inserted, "Ingested frames");
        Ok(inserted)
    }

    pub fn frame(&self, project: u32, key: &FrameKey) -> Result<Option<Frame>> {
        let conn = self.store.lock()?;
        let frame = conn
            .query_row(
                &format!(
                    "SELECT {FRAME_COLUMNS} FROM frames f
                     WHERE f.project = ?1 AND f.frame_key = ?2"
                ),
                params![project, key.as_str()],
                frame_from_row,
            )
            .optional()?;
        Ok(frame)
    }

    /// All ingested frames of a scope, ordered by key.
    pub fn frames(&self, scope: &Scope) -> Result<Vec<Frame>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FRAME_COLUMNS} FROM frames f WHERE {SCOPE_FILTER} ORDER BY f.frame_key"
        ))?;
        let frames = stmt
            .query_map(scope_params(scope), frame_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(frames)
    }

    /// Record a calibrated frame. The frame must have been ingested.
    pub fn record_calibration(&self, frame: &Frame, result: &CalibrationResult) -> Result<i64> {
        let header = result.header.as_ref().map(serde_json::to_string).transpose()?;
        let artifact = path_str(&result.artifact);
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM calibrated_frames
             WHERE project = ?1 AND origin_key = ?2 AND artifact_path = ?3 AND success = 0",
            params![frame.project, frame.key.as_str(), artifact],
        )?;
        let inserted = tx
            .execute(
                "INSERT INTO calibrated_frames
                 (project, origin_key, artifact_path, header_json, success, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6
                 WHERE EXISTS (SELECT 1 FROM frames WHERE project = ?1 AND frame_key = ?2)",
                params![
                    frame.project,
                    frame.key.as_str(),
                    artifact,
                    header,
                    result.success,
                    Utc::now(),
                ],
            )
            .map_err(|e| insert_error(e, Stage::Calibrate.table(), frame.key.as_str()))?;
        if inserted == 0 {
            return Err(missing_upstream("frames", &frame.key));
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Record an alignment onto astrometric reference `reference_id`.
    ///
    /// Unique on (origin, reference, artifact). Requires a successful
    /// calibration record for the origin frame.
    pub fn record_alignment(
        &self,
        frame: &Frame,
        reference_id: i64,
        artifact: &Path,
        diagnostics: Option<&WarpDiagnostics>,
        success: bool,
    ) -> Result<i64> {
        let payload = diagnostics
            .and_then(|d| d.payload.as_ref())
            .map(serde_json::to_string)
            .transpose()?;
        let artifact = path_str(artifact);
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM aligned_frames
             WHERE project = ?1 AND origin_key = ?2 AND reference_id = ?3
               AND artifact_path = ?4 AND success = 0",
            params![frame.project, frame.key.as_str(), reference_id, artifact],
        )?;
        let inserted = tx
            .execute(
                "INSERT INTO aligned_frames
                 (project, origin_key, reference_id, artifact_path, success,
                  warp_margin, warp_threshold, diagnostics_json, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                 WHERE EXISTS (SELECT 1 FROM calibrated_frames
                               WHERE project = ?1 AND origin_key = ?2 AND success = 1)",
                params![
                    frame.project,
                    frame.key.as_str(),
                    reference_id,
                    artifact,
                    success,
                    diagnostics.and_then(|d| d.margin),
                    diagnostics.and_then(|d| d.threshold),
                    payload,
                    Utc::now(),
                ],
            )
            .map_err(|e| insert_error(e, Stage::Align.table(), frame.key.as_str()))?;
        if inserted == 0 {
            return Err(missing_upstream(Stage::Calibrate.table(), &frame.key));
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Record a subtraction of photometric reference `reference_id` from
    /// aligned frame `aligned_id`.
    ///
    /// Unique on (origin, aligned frame, reference, kernel spec, artifact):
    /// the same inputs differenced with another kernel are a distinct result.
    #[allow(clippy::too_many_arguments)]
    pub fn record_subtraction(
        &self,
        frame: &Frame,
        aligned_id: i64,
        reference_id: i64,
        kernel: &KernelSpec,
        method: SubtractionMethod,
        artifact: &Path,
        success: bool,
    ) -> Result<i64> {
        let artifact = path_str(artifact);
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM subtracted_frames
             WHERE project = ?1 AND origin_key = ?2 AND aligned_id = ?3 AND reference_id = ?4
               AND kernel_spec = ?5 AND artifact_path = ?6 AND success = 0",
            params![
                frame.project,
                frame.key.as_str(),
                aligned_id,
                reference_id,
                kernel.as_str(),
                artifact,
            ],
        )?;
        let inserted = tx
            .execute(
                "INSERT INTO subtracted_frames
                 (project, origin_key, aligned_id, reference_id, kernel_spec, method,
                  artifact_path, success, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                 WHERE EXISTS (SELECT 1 FROM aligned_frames
                               WHERE id = ?3 AND project = ?1 AND origin_key = ?2
                                 AND success = 1)",
                params![
                    frame.project,
                    frame.key.as_str(),
                    aligned_id,
                    reference_id,
                    kernel.as_str(),
                    method.as_str(),
                    artifact,
                    success,
                    Utc::now(),
                ],
            )
            .map_err(|e| insert_error(e, Stage::Subtract.table(), frame.key.as_str()))?;
        if inserted == 0 {
            return Err(missing_upstream(Stage::Align.table(), &frame.key));
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Record a photometry, detrending or assembly result built on the
    /// upstream record `upstream`.
    pub fn record_stage(
        &self,
        stage: Stage,
        frame: &Frame,
        upstream: (Stage, i64),
        artifact: &Path,
        detail: Option<&Value>,
        success: bool,
    ) -> Result<i64> {
        if matches!(stage, Stage::Calibrate | Stage::Align | Stage::Subtract) {
            return Err(SubphotError::InvalidConfig(format!(
                "{stage} records have a dedicated recorder"
            )));
        }
        let (upstream_stage, upstream_id) = upstream;
        let detail = detail.map(serde_json::to_string).transpose()?;
        let artifact = path_str(artifact);
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {}
                 WHERE project = ?1 AND origin_key = ?2 AND upstream_stage = ?3
                   AND upstream_id = ?4 AND artifact_path = ?5 AND success = 0",
                stage.table()
            ),
            params![
                frame.project,
                frame.key.as_str(),
                upstream_stage.as_str(),
                upstream_id,
                artifact,
            ],
        )?;
        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {table}
                     (project, origin_key, upstream_stage, upstream_id, artifact_path,
                      success, detail_json, created_at)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
                     WHERE EXISTS (SELECT 1 FROM {upstream_table}
                                   WHERE id = ?4 AND project = ?1 AND origin_key = ?2
                                     AND success = 1)",
                    table = stage.table(),
                    upstream_table = upstream_stage.table(),
                ),
                params![
                    frame.project,
                    frame.key.as_str(),
                    upstream_stage.as_str(),
                    upstream_id,
                    artifact,
                    success,
                    detail,
                    Utc::now(),
                ],
            )
            .map_err(|e| insert_error(e, stage.table(), frame.key.as_str()))?;
        if inserted == 0 {
            return Err(missing_upstream(upstream_stage.table(), &frame.key));
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn calibrations(&self, frame: &Frame) -> Result<Vec<CalibratedFrame>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, origin_key, artifact_path, project, header_json, success, created_at
             FROM calibrated_frames WHERE project = ?1 AND origin_key = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![frame.project, frame.key.as_str()], |row| {
                Ok(CalibratedFrame {
                    id: row.get(0)?,
                    origin: FrameKey::new(row.get::<_, String>(1)?),
                    artifact: PathBuf::from(row.get::<_, String>(2)?),
                    project: row.get(3)?,
                    header: json_column(row, 4)?,
                    success: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn alignments(&self, frame: &Frame) -> Result<Vec<AlignedFrame>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, origin_key, reference_id, artifact_path, success,
                    warp_margin, warp_threshold, diagnostics_json, created_at
             FROM aligned_frames WHERE project = ?1 AND origin_key = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![frame.project, frame.key.as_str()], |row| {
                let margin: Option<f64> = row.get(5)?;
                let threshold: Option<f64> = row.get(6)?;
                let payload = json_column(row, 7)?;
                let diagnostics = if margin.is_none() && threshold.is_none() && payload.is_none()
                {
                    None
                } else {
                    Some(WarpDiagnostics {
                        margin,
                        threshold,
                        payload,
                    })
                };
                Ok(AlignedFrame {
                    id: row.get(0)?,
                    origin: FrameKey::new(row.get::<_, String>(1)?),
                    reference_id: row.get(2)?,
                    artifact: PathBuf::from(row.get::<_, String>(3)?),
                    success: row.get(4)?,
                    diagnostics,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn subtractions(&self, frame: &Frame) -> Result<Vec<SubtractedFrame>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, origin_key, aligned_id, reference_id, kernel_spec, method,
                    artifact_path, success, created_at
             FROM subtracted_frames WHERE project = ?1 AND origin_key = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![frame.project, frame.key.as_str()], |row| {
                Ok(SubtractedFrame {
                    id: row.get(0)?,
                    origin: FrameKey::new(row.get::<_, String>(1)?),
                    aligned_id: row.get(2)?,
                    reference_id: row.get(3)?,
                    kernel_spec: row.get(4)?,
                    method: parse_column::<SubtractionMethod>(row, 5)?,
                    artifact: PathBuf::from(row.get::<_, String>(6)?),
                    success: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Downstream records (photometry, detrending, assembly) of one frame.
    pub fn stage_records(&self, stage: Stage, frame: &Frame) -> Result<Vec<StageRecord>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, origin_key, upstream_stage, upstream_id, artifact_path,
                    success, detail_json, created_at
             FROM {} WHERE project = ?1 AND origin_key = ?2 ORDER BY id",
            stage.table()
        ))?;
        let rows = stmt
            .query_map(params![frame.project, frame.key.as_str()], |row| {
                Ok(StageRecord {
                    id: row.get(0)?,
                    stage,
                    origin: FrameKey::new(row.get::<_, String>(1)?),
                    upstream_stage: parse_column::<Stage>(row, 2)?,
                    upstream_id: row.get(3)?,
                    artifact: PathBuf::from(row.get::<_, String>(4)?),
                    success: row.get(5)?,
                    detail: json_column(row, 6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest successful `stage` record of every frame in `scope` that has one.
    pub fn completed(&self, scope: &Scope, stage: Stage) -> Result<Vec<(FrameKey, Upstream)>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT f.frame_key, r.id, r.artifact_path FROM frames f
             JOIN {table} r ON r.id = (
                 SELECT MAX(q.id) FROM {table} q
                 WHERE {lineage} AND q.success = 1)
             WHERE {SCOPE_FILTER} ORDER BY f.frame_key",
            table = stage.table(),
            lineage = same_frame("q"),
        ))?;
        let rows = stmt
            .query_map(scope_params(scope), |row| {
                Ok((
                    FrameKey::new(row.get::<_, String>(0)?),
                    Upstream {
                        stage,
                        id: row.get(1)?,
                        artifact: PathBuf::from(row.get::<_, String>(2)?),
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of `stage` records within `scope`.
    pub fn count(&self, scope: &Scope, stage: Stage) -> Result<usize> {
        let conn = self.store.lock()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} r JOIN frames f ON {}
                 WHERE {SCOPE_FILTER}",
                stage.table(),
                same_frame("r"),
            ),
            scope_params(scope),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Record counts for every stage within `scope`.
    pub fn stage_counts(&self, scope: &Scope) -> Result<Vec<(Stage, usize)>> {
        Stage::ALL
            .into_iter()
            .map(|stage| Ok((stage, self.count(scope, stage)?)))
            .collect()
    }

    /// Frames in `scope` that completed the prerequisite of `stage` on the
    /// full stage graph but have no successful `stage` record.
    pub fn pending_work(&self, scope: &Scope, stage: Stage) -> PendingWork {
        self.pending_work_in(scope, stage, StageGraph::default())
    }

    /// Like [`pending_work`](Self::pending_work) with the prerequisite taken
    /// from `graph`.
    pub fn pending_work_in(&self, scope: &Scope, stage: Stage, graph: StageGraph) -> PendingWork {
        PendingWork::new(self.store.clone(), *scope, stage, graph.prerequisite(stage))
    }

    /// Delete every record of `stages` within `scope`, in one transaction.
    ///
    /// Reserved for scoped invalidation. Ingested frames are never deleted.
    pub fn purge(&self, scope: &Scope, stages: &[Stage]) -> Result<Vec<(Stage, usize)>> {
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        let mut purged = Vec::with_capacity(stages.len());
        for stage in stages {
            let removed = tx.execute(
                &format!(
                    "DELETE FROM {table} WHERE EXISTS
                     (SELECT 1 FROM frames f WHERE {lineage} AND {SCOPE_FILTER})",
                    table = stage.table(),
                    lineage = same_frame(stage.table()),
                ),
                scope_params(scope),
            )?;
            debug!(%scope, %stage, removed, "Purged stage records");
            purged.push((*stage, removed));
        }
        tx.commit()?;
        Ok(purged)
    }

    /// Stage records within `scope` whose upstream record is gone.
    pub fn orphans(&self, scope: &Scope) -> Result<Vec<Orphan>> {
        let checks: [(Stage, Stage, &str); 6] = [
            (
                Stage::Align,
                Stage::Calibrate,
                "NOT EXISTS (SELECT 1 FROM calibrated_frames u
                             WHERE u.project = r.project AND u.origin_key = r.origin_key)",
            ),
            (
                Stage::Subtract,
                Stage::Align,
                "NOT EXISTS (SELECT 1 FROM aligned_frames u WHERE u.id = r.aligned_id)",
            ),
            (
                Stage::Photometer,
                Stage::Subtract,
                "NOT EXISTS (SELECT 1 FROM subtracted_frames u WHERE u.id = r.upstream_id)",
            ),
            (
                Stage::Detrend,
                Stage::Photometer,
                "NOT EXISTS (SELECT 1 FROM photometry_records u WHERE u.id = r.upstream_id)",
            ),
            (
                Stage::Assemble,
                Stage::Detrend,
                "r.upstream_stage = 'detrend' AND
                 NOT EXISTS (SELECT 1 FROM detrended_records u WHERE u.id = r.upstream_id)",
            ),
            (
                Stage::Assemble,
                Stage::Photometer,
                "r.upstream_stage = 'photometer' AND
                 NOT EXISTS (SELECT 1 FROM photometry_records u WHERE u.id = r.upstream_id)",
            ),
        ];

        let conn = self.store.lock()?;
        let mut orphans = Vec::new();
        for (stage, missing, predicate) in checks {
            let mut stmt = conn.prepare(&format!(
                "SELECT r.id, r.origin_key FROM {} r
                 JOIN frames f ON {}
                 WHERE {SCOPE_FILTER} AND {predicate}
                 ORDER BY r.id",
                stage.table(),
                same_frame("r"),
            ))?;
            let found = stmt
                .query_map(scope_params(scope), |row| {
                    Ok(Orphan {
                        stage,
                        record_id: row.get(0)?,
                        origin: FrameKey::new(row.get::<_, String>(1)?),
                        missing,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            orphans.extend(found);
        }
        Ok(orphans)
    }
}

/// Join predicate tying the rows of table alias `alias` to frame `f`.
pub(crate) fn same_frame(alias: &str) -> String {
    format!("{alias}.project = f.project AND {alias}.origin_key = f.frame_key")
}

pub(crate) fn scope_params(scope: &Scope) -> (u32, u8, u8, Option<u16>) {
    (
        scope.project,
        scope.camera,
        scope.ccd,
        scope.sector.map(|s| s.0),
    )
}

pub(crate) fn frame_from_row(row: &Row<'_>) -> rusqlite::Result<Frame> {
    Ok(Frame {
        key: FrameKey::new(row.get::<_, String>(0)?),
        project: row.get(1)?,
        sector: Sector(row.get(2)?),
        camera: row.get(3)?,
        ccd: row.get(4)?,
        scid: row.get(5)?,
        captured_at: row.get(6)?,
        path: PathBuf::from(row.get::<_, String>(7)?),
    })
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = SubphotError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn missing_upstream(table: &'static str, origin: &FrameKey) -> SubphotError {
    SubphotError::MissingUpstream {
        table,
        origin: origin.to_string(),
    }
}
