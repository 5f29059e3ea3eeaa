use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::frame::{Frame, FrameKey, Scope};

use super::{json_column, FrameRegistry, SCOPE_FILTER};

/// Image statistics reported by calibration, used for reference selection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Median PSF width parameter S of the detected sources.
    pub median_s: f64,
    /// Median PSF ellipticity parameter D.
    pub median_d: f64,
    pub background_median: f64,
    pub background_stdev: f64,
    pub detections: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FrameInfo {
    pub frame: FrameKey,
    pub stats: Option<FrameStats>,
    pub header: Option<Value>,
}

impl FrameRegistry {
    /// Store (or replace) the cached statistics of a frame.
    pub fn cache_frame_info(
        &self,
        frame: &Frame,
        stats: Option<&FrameStats>,
        header: Option<&Value>,
    ) -> Result<()> {
        let stats = stats.map(serde_json::to_string).transpose()?;
        let header = header.map(serde_json::to_string).transpose()?;
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO frame_info
             (project, frame_key, stats_json, header_json, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![frame.project, frame.key.as_str(), stats, header, Utc::now()],
        )?;
        Ok(())
    }

    /// Cached info of every frame in `scope`, ordered by frame key.
    pub fn frame_info(&self, scope: &Scope) -> Result<Vec<FrameInfo>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT i.frame_key, i.stats_json, i.header_json
             FROM frame_info i
             JOIN frames f ON f.project = i.project AND f.frame_key = i.frame_key
             WHERE {SCOPE_FILTER} ORDER BY i.frame_key"
        ))?;
        let rows = stmt
            .query_map(super::scope_params(scope), |row| {
                let stats = json_column(row, 1)?
                    .map(serde_json::from_value::<FrameStats>)
                    .transpose()
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                Ok(FrameInfo {
                    frame: FrameKey::new(row.get::<_, String>(0)?),
                    stats,
                    header: json_column(row, 2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn purge_frame_info(&self, scope: &Scope) -> Result<usize> {
        let conn = self.store.lock()?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM frame_info WHERE EXISTS
                 (SELECT 1 FROM frames f
                  WHERE f.project = frame_info.project AND f.frame_key = frame_info.frame_key
                    AND {SCOPE_FILTER})"
            ),
            super::scope_params(scope),
        )?;
        Ok(removed)
    }
}
