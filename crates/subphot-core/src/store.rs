use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use tracing::debug;

use crate::error::{Result, SubphotError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS frames (
    project         INTEGER NOT NULL,
    frame_key       TEXT NOT NULL,
    sector          INTEGER NOT NULL,
    camera          INTEGER NOT NULL,
    ccd             INTEGER NOT NULL,
    scid            INTEGER NOT NULL,
    captured_at     TEXT NOT NULL,
    path            TEXT NOT NULL,
    ingested_at     TEXT NOT NULL,
    PRIMARY KEY (project, frame_key)
);
CREATE INDEX IF NOT EXISTS idx_frames_scope ON frames(project, camera, ccd, sector);

CREATE TABLE IF NOT EXISTS calibrated_frames (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project         INTEGER NOT NULL,
    origin_key      TEXT NOT NULL,
    artifact_path   TEXT NOT NULL,
    header_json     TEXT,
    success         INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE (project, origin_key, artifact_path)
);

CREATE TABLE IF NOT EXISTS aligned_frames (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project         INTEGER NOT NULL,
    origin_key      TEXT NOT NULL,
    reference_id    INTEGER NOT NULL,
    artifact_path   TEXT NOT NULL,
    success         INTEGER NOT NULL,
    warp_margin     REAL,
    warp_threshold  REAL,
    diagnostics_json TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (project, origin_key, reference_id, artifact_path)
);

CREATE TABLE IF NOT EXISTS subtracted_frames (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project         INTEGER NOT NULL,
    origin_key      TEXT NOT NULL,
    aligned_id      INTEGER NOT NULL,
    reference_id    INTEGER NOT NULL,
    kernel_spec     TEXT NOT NULL,
    method          TEXT NOT NULL,
    artifact_path   TEXT NOT NULL,
    success         INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE (project, origin_key, aligned_id, reference_id, kernel_spec, artifact_path)
);

CREATE TABLE IF NOT EXISTS photometry_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project         INTEGER NOT NULL,
    origin_key      TEXT NOT NULL,
    upstream_stage  TEXT NOT NULL,
    upstream_id     INTEGER NOT NULL,
    artifact_path   TEXT NOT NULL,
    success         INTEGER NOT NULL,
    detail_json     TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (project, origin_key, upstream_stage, upstream_id, artifact_path)
);

CREATE TABLE IF NOT EXISTS detrended_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project         INTEGER NOT NULL,
    origin_key      TEXT NOT NULL,
    upstream_stage  TEXT NOT NULL,
    upstream_id     INTEGER NOT NULL,
    artifact_path   TEXT NOT NULL,
    success         INTEGER NOT NULL,
    detail_json     TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (project, origin_key, upstream_stage, upstream_id, artifact_path)
);

CREATE TABLE IF NOT EXISTS assembled_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project         INTEGER NOT NULL,
    origin_key      TEXT NOT NULL,
    upstream_stage  TEXT NOT NULL,
    upstream_id     INTEGER NOT NULL,
    artifact_path   TEXT NOT NULL,
    success         INTEGER NOT NULL,
    detail_json     TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (project, origin_key, upstream_stage, upstream_id, artifact_path)
);

CREATE TABLE IF NOT EXISTS reference_frames (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project         INTEGER NOT NULL,
    camera          INTEGER NOT NULL,
    ccd             INTEGER NOT NULL,
    kind            TEXT NOT NULL,
    frame_path      TEXT NOT NULL,
    source_json     TEXT,
    metadata_json   TEXT,
    is_current      INTEGER NOT NULL,
    installed_at    TEXT NOT NULL,
    superseded_at   TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_reference_current
    ON reference_frames(project, camera, ccd, kind) WHERE is_current = 1;

CREATE TABLE IF NOT EXISTS frame_info (
    project         INTEGER NOT NULL,
    frame_key       TEXT NOT NULL,
    stats_json      TEXT,
    header_json     TEXT,
    cached_at       TEXT NOT NULL,
    PRIMARY KEY (project, frame_key)
);
";

/// Handle to the relational store shared by the registry and the reference
/// manager. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        debug!(path = %path.as_ref().display(), "Opened registry store");
        Self::with_connection(conn)
    }

    /// In-memory store, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SubphotError::LockPoisoned)
    }
}

/// Translate an insert failure: uniqueness violations become
/// [`SubphotError::DuplicateRecord`].
pub(crate) fn insert_error(err: rusqlite::Error, table: &'static str, origin: &str) -> SubphotError {
    match err {
        rusqlite::Error::SqliteFailure(ref failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            SubphotError::DuplicateRecord {
                table,
                origin: origin.to_string(),
            }
        }
        other => SubphotError::Storage(other),
    }
}
