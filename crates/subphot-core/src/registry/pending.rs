use std::collections::VecDeque;
use std::path::PathBuf;

use rusqlite::params;

use crate::consts::PENDING_PAGE_SIZE;
use crate::error::Result;
use crate::frame::{FrameKey, Scope};
use crate::pipeline::Stage;
use crate::store::Store;

use super::records::{PendingFrame, Upstream};
use super::{frame_from_row, same_frame, FRAME_COLUMNS, SCOPE_FILTER};

/// Lazy, paginated sequence of frames awaiting one stage.
///
/// Pages are fetched by frame key, so records written while the sequence is
/// being consumed never shift or repeat frames that are still to come. The
/// prerequisite record handed out is the most recent successful one.
pub struct PendingWork {
    store: Store,
    scope: Scope,
    stage: Stage,
    prerequisite: Option<Stage>,
    cursor: Option<FrameKey>,
    buffer: VecDeque<PendingFrame>,
    exhausted: bool,
}

impl PendingWork {
    pub(super) fn new(store: Store, scope: Scope, stage: Stage, prerequisite: Option<Stage>) -> Self {
        Self {
            store,
            scope,
            stage,
            prerequisite,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn query(&self) -> String {
        let awaiting = format!(
            "NOT EXISTS (SELECT 1 FROM {} r WHERE {} AND r.success = 1)",
            self.stage.table(),
            same_frame("r"),
        );
        match self.prerequisite {
            None => format!(
                "SELECT {FRAME_COLUMNS} FROM frames f
                 WHERE {SCOPE_FILTER} AND f.frame_key > ?5 AND {awaiting}
                 ORDER BY f.frame_key LIMIT ?6"
            ),
            Some(prerequisite) => format!(
                "SELECT {FRAME_COLUMNS}, p.id, p.artifact_path FROM frames f
                 JOIN {table} p ON p.id = (
                     SELECT MAX(q.id) FROM {table} q
                     WHERE {lineage} AND q.success = 1)
                 WHERE {SCOPE_FILTER} AND f.frame_key > ?5 AND {awaiting}
                 ORDER BY f.frame_key LIMIT ?6",
                table = prerequisite.table(),
                lineage = same_frame("q"),
            ),
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let sql = self.query();
        let after = self
            .cursor
            .as_ref()
            .map(|k| k.as_str().to_string())
            .unwrap_or_default();
        let prerequisite = self.prerequisite;

        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let page = stmt
            .query_map(
                params![
                    self.scope.project,
                    self.scope.camera,
                    self.scope.ccd,
                    self.scope.sector.map(|s| s.0),
                    after,
                    PENDING_PAGE_SIZE as i64,
                ],
                |row| {
                    let frame = frame_from_row(row)?;
                    let upstream = match prerequisite {
                        Some(stage) => Some(Upstream {
                            stage,
                            id: row.get(8)?,
                            artifact: PathBuf::from(row.get::<_, String>(9)?),
                        }),
                        None => None,
                    };
                    Ok(PendingFrame { frame, upstream })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if page.len() < PENDING_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.frame.key.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for PendingWork {
    type Item = Result<PendingFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
