use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubphotError};

/// First spacecraft orbit of sector 1; two orbits per sector.
const FIRST_SECTOR_ORBIT: u32 = 9;

fn frame_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^tess(\d{13})-s(\d{4})-(\d)-(\d)-(\d{4})-\w_ffic\.fits(\.fz|\.gz)?$")
            .expect("frame name pattern is a valid regex")
    })
}

/// Observing sector of the survey.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sector(pub u16);

impl Sector {
    /// Zero-padded label used in file names and directories, e.g. `s0007`.
    pub fn label(&self) -> String {
        format!("s{:04}", self.0)
    }

    /// Sector observed during the given spacecraft orbit.
    pub fn from_orbit(orbit: u32) -> Result<Self> {
        if orbit < FIRST_SECTOR_ORBIT {
            return Err(SubphotError::UnknownScope(format!("orbit-{orbit}")));
        }
        let sector = (orbit - 7) / 2;
        u16::try_from(sector)
            .map(Sector)
            .map_err(|_| SubphotError::UnknownScope(format!("orbit-{orbit}")))
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Sector {
    type Err = SubphotError;

    /// Accepts `s0001`, `s1`, `sector-1`, `1` and `orbit-9` style labels.
    fn from_str(s: &str) -> Result<Self> {
        let label = s.trim().to_ascii_lowercase();
        let malformed = || SubphotError::InvalidConfig(format!("malformed sector label '{s}'"));

        if let Some(orbit) = label.strip_prefix("orbit-") {
            let orbit: u32 = orbit.parse().map_err(|_| malformed())?;
            return Sector::from_orbit(orbit);
        }
        let digits = label
            .strip_prefix("sector-")
            .or_else(|| label.strip_prefix('s'))
            .unwrap_or(&label);
        let number: u16 = digits.parse().map_err(|_| malformed())?;
        if number == 0 {
            return Err(malformed());
        }
        Ok(Sector(number))
    }
}

/// Partition key for independent processing lineages.
///
/// `sector` is optional: maintenance operations may address every sector
/// of a (project, camera, ccd) at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub project: u32,
    pub camera: u8,
    pub ccd: u8,
    pub sector: Option<Sector>,
}

impl Scope {
    pub fn new(project: u32, camera: u8, ccd: u8) -> Self {
        Self {
            project,
            camera,
            ccd,
            sector: None,
        }
    }

    pub fn with_sector(mut self, sector: Sector) -> Self {
        self.sector = Some(sector);
        self
    }

    /// True if `frame` falls inside this scope.
    pub fn contains(&self, frame: &Frame) -> bool {
        frame.project == self.project
            && frame.camera == self.camera
            && frame.ccd == self.ccd
            && self.sector.map_or(true, |s| s == frame.sector)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proj{} cam{} ccd{}", self.project, self.camera, self.ccd)?;
        if let Some(sector) = self.sector {
            write!(f, " {}", sector)?;
        }
        Ok(())
    }
}

/// Natural key of a frame: capture timestamp, sector, camera, ccd and
/// spacecraft configuration id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameKey(String);

impl FrameKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One full-frame image as ingested. Immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub key: FrameKey,
    pub project: u32,
    pub sector: Sector,
    pub camera: u8,
    pub ccd: u8,
    /// Spacecraft configuration id.
    pub scid: u16,
    pub captured_at: NaiveDateTime,
    pub path: PathBuf,
}

impl Frame {
    /// Parse a frame from its file name.
    pub fn from_path(path: &Path, project: u32) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SubphotError::InvalidFrameName(path.display().to_string()))?;
        let invalid = || SubphotError::InvalidFrameName(name.to_string());

        let caps = frame_name_pattern().captures(name).ok_or_else(invalid)?;
        let timestamp = &caps[1];
        let sector: u16 = caps[2].parse().map_err(|_| invalid())?;
        let camera: u8 = caps[3].parse().map_err(|_| invalid())?;
        let ccd: u8 = caps[4].parse().map_err(|_| invalid())?;
        let scid: u16 = caps[5].parse().map_err(|_| invalid())?;
        let captured_at = parse_timestamp(timestamp).ok_or_else(invalid)?;

        Ok(Self {
            key: FrameKey(format!(
                "{timestamp}-s{sector:04}-{camera}-{ccd}-{scid:04}"
            )),
            project,
            sector: Sector(sector),
            camera,
            ccd,
            scid,
            captured_at,
            path: path.to_path_buf(),
        })
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.project, self.camera, self.ccd).with_sector(self.sector)
    }

    /// Stem shared by every artifact derived from this frame.
    pub fn stem(&self) -> String {
        format!("tess{}", self.key)
    }
}

/// File name of a calibrated full-frame image in the survey's convention.
pub fn frame_file_name(
    captured_at: NaiveDateTime,
    sector: Sector,
    camera: u8,
    ccd: u8,
    scid: u16,
) -> String {
    format!(
        "tess{}-{}-{}-{}-{:04}-s_ffic.fits",
        captured_at.format("%Y%j%H%M%S"),
        sector.label(),
        camera,
        ccd,
        scid
    )
}

/// `YYYYDDDHHMMSS`: year, day of year, time of day.
fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    let year: i32 = ts.get(0..4)?.parse().ok()?;
    let ordinal: u32 = ts.get(4..7)?.parse().ok()?;
    let hour: u32 = ts.get(7..9)?.parse().ok()?;
    let minute: u32 = ts.get(9..11)?.parse().ok()?;
    let second: u32 = ts.get(11..13)?.parse().ok()?;
    NaiveDate::from_yo_opt(year, ordinal)?.and_hms_opt(hour, minute, second)
}
