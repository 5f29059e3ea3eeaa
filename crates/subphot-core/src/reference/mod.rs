//! Versioned astrometric and photometric reference frames.
//!
//! Per (project, camera, ccd, kind) at most one reference is current. A new
//! reference is installed by superseding the old row and inserting the new
//! one inside a single transaction; rows are never edited in place.

pub mod select;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Result, SubphotError};
use crate::frame::Scope;
use crate::registry::{json_column, path_str};
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceKind {
    Astrometric,
    Photometric,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 2] = [ReferenceKind::Astrometric, ReferenceKind::Photometric];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Astrometric => "astrometric",
            Self::Photometric => "photometric",
        }
    }

    /// Tag used in reference file names.
    pub fn file_tag(&self) -> &'static str {
        match self {
            Self::Astrometric => "astromref",
            Self::Photometric => "photref",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceKind {
    type Err = SubphotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "astrometric" | "astromref" | "aref" => Ok(Self::Astrometric),
            "photometric" | "photref" | "pref" => Ok(Self::Photometric),
            other => Err(SubphotError::InvalidConfig(format!(
                "unknown reference kind '{other}'"
            ))),
        }
    }
}

/// One installed reference version.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceFrame {
    pub id: i64,
    pub project: u32,
    pub camera: u8,
    pub ccd: u8,
    pub kind: ReferenceKind,
    pub path: PathBuf,
    /// Frames the reference was built from.
    pub sources: Option<Value>,
    pub metadata: Option<Value>,
    pub is_current: bool,
    pub installed_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

/// A reference about to be installed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewReference {
    pub path: PathBuf,
    pub sources: Option<Value>,
    pub metadata: Option<Value>,
}

impl NewReference {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// References resolved once at batch start and used for the whole batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferenceSnapshot {
    pub astrometric: Option<ReferenceFrame>,
    pub photometric: Option<ReferenceFrame>,
}

impl ReferenceSnapshot {
    pub fn get(&self, kind: ReferenceKind) -> Option<&ReferenceFrame> {
        match kind {
            ReferenceKind::Astrometric => self.astrometric.as_ref(),
            ReferenceKind::Photometric => self.photometric.as_ref(),
        }
    }

    pub fn set(&mut self, reference: ReferenceFrame) {
        match reference.kind {
            ReferenceKind::Astrometric => self.astrometric = Some(reference),
            ReferenceKind::Photometric => self.photometric = Some(reference),
        }
    }
}

const REFERENCE_COLUMNS: &str = "id, project, camera, ccd, kind, frame_path, source_json, \
     metadata_json, is_current, installed_at, superseded_at";

#[derive(Clone)]
pub struct ReferenceManager {
    store: Store,
}

impl ReferenceManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// The current reference, or [`SubphotError::NoReference`] if none has
    /// been installed yet.
    pub fn current(
        &self,
        project: u32,
        camera: u8,
        ccd: u8,
        kind: ReferenceKind,
    ) -> Result<ReferenceFrame> {
        let conn = self.store.lock()?;
        conn.query_row(
            &format!(
                "SELECT {REFERENCE_COLUMNS} FROM reference_frames
                 WHERE project = ?1 AND camera = ?2 AND ccd = ?3 AND kind = ?4
                   AND is_current = 1"
            ),
            params![project, camera, ccd, kind.as_str()],
            reference_from_row,
        )
        .optional()?
        .ok_or_else(|| SubphotError::NoReference {
            kind: kind.to_string(),
            project,
            camera,
            ccd,
        })
    }

    /// Install `reference` as current, superseding the previous one.
    pub fn install(
        &self,
        project: u32,
        camera: u8,
        ccd: u8,
        kind: ReferenceKind,
        reference: &NewReference,
    ) -> Result<ReferenceFrame> {
        let sources = reference
            .sources
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = reference
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.store.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let superseded = tx.execute(
            "UPDATE reference_frames SET is_current = 0, superseded_at = ?5
             WHERE project = ?1 AND camera = ?2 AND ccd = ?3 AND kind = ?4 AND is_current = 1",
            params![project, camera, ccd, kind.as_str(), now],
        )?;
        tx.execute(
            "INSERT INTO reference_frames
             (project, camera, ccd, kind, frame_path, source_json, metadata_json,
              is_current, installed_at, superseded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, NULL)",
            params![
                project,
                camera,
                ccd,
                kind.as_str(),
                path_str(&reference.path),
                sources,
                metadata,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let installed = tx.query_row(
            &format!("SELECT {REFERENCE_COLUMNS} FROM reference_frames WHERE id = ?1"),
            params![id],
            reference_from_row,
        )?;
        tx.commit()?;

        info!(
            project,
            camera,
            ccd,
            %kind,
            id,
            superseded,
            path = %reference.path.display(),
            "Installed reference"
        );
        Ok(installed)
    }

    /// Every version of a reference key, newest first.
    pub fn history(
        &self,
        project: u32,
        camera: u8,
        ccd: u8,
        kind: ReferenceKind,
    ) -> Result<Vec<ReferenceFrame>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REFERENCE_COLUMNS} FROM reference_frames
             WHERE project = ?1 AND camera = ?2 AND ccd = ?3 AND kind = ?4
             ORDER BY id DESC"
        ))?;
        let rows = stmt
            .query_map(params![project, camera, ccd, kind.as_str()], reference_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Resolve both current references of a scope. Missing ones are `None`.
    pub fn snapshot(&self, scope: &Scope) -> Result<ReferenceSnapshot> {
        let mut snapshot = ReferenceSnapshot::default();
        for kind in ReferenceKind::ALL {
            match self.current(scope.project, scope.camera, scope.ccd, kind) {
                Ok(reference) => snapshot.set(reference),
                Err(SubphotError::NoReference { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(snapshot)
    }

    /// Retire the current references of the scope's (project, camera, ccd).
    /// Their rows stay in the history as superseded versions.
    ///
    /// References are not partitioned by sector, so the sector of `scope`
    /// is ignored. Only scoped invalidation calls this.
    pub fn clear(&self, scope: &Scope) -> Result<usize> {
        let conn = self.store.lock()?;
        let retired = conn.execute(
            "UPDATE reference_frames SET is_current = 0, superseded_at = ?4
             WHERE project = ?1 AND camera = ?2 AND ccd = ?3 AND is_current = 1",
            params![scope.project, scope.camera, scope.ccd, Utc::now()],
        )?;
        Ok(retired)
    }
}

fn reference_from_row(row: &Row<'_>) -> rusqlite::Result<ReferenceFrame> {
    let kind: String = row.get(4)?;
    let kind = kind.parse::<ReferenceKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ReferenceFrame {
        id: row.get(0)?,
        project: row.get(1)?,
        camera: row.get(2)?,
        ccd: row.get(3)?,
        kind,
        path: PathBuf::from(row.get::<_, String>(5)?),
        sources: json_column(row, 6)?,
        metadata: json_column(row, 7)?,
        is_current: row.get(8)?,
        installed_at: row.get(9)?,
        superseded_at: row.get(10)?,
    })
}
