use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubphotError};

/// Processing stages, in dependency order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Calibrate,
    Align,
    Subtract,
    Photometer,
    Detrend,
    Assemble,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Calibrate,
        Stage::Align,
        Stage::Subtract,
        Stage::Photometer,
        Stage::Detrend,
        Stage::Assemble,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calibrate => "calibrate",
            Self::Align => "align",
            Self::Subtract => "subtract",
            Self::Photometer => "photometer",
            Self::Detrend => "detrend",
            Self::Assemble => "assemble",
        }
    }

    /// Registry table holding this stage's records.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Calibrate => "calibrated_frames",
            Self::Align => "aligned_frames",
            Self::Subtract => "subtracted_frames",
            Self::Photometer => "photometry_records",
            Self::Detrend => "detrended_records",
            Self::Assemble => "assembled_records",
        }
    }

    /// Output directory (below the run's work directory).
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Calibrate => "calibrated",
            Self::Align => "aligned",
            Self::Subtract => "subtracted",
            Self::Photometer => "photometry",
            Self::Detrend | Self::Assemble => "lightcurves",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = SubphotError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| SubphotError::InvalidConfig(format!("unknown stage '{s}'")))
    }
}

/// Effective edge set of the per-frame state machine.
///
/// Detrending can be bypassed globally, in which case assembly follows
/// photometry directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageGraph {
    pub skip_detrend: bool,
}

impl StageGraph {
    pub fn new(skip_detrend: bool) -> Self {
        Self { skip_detrend }
    }

    /// Stages a frame passes through, in order.
    pub fn sequence(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.contains(*s))
            .collect()
    }

    /// Stage whose record must exist before `stage` may run. `None` means
    /// the frame only has to be ingested.
    pub fn prerequisite(&self, stage: Stage) -> Option<Stage> {
        match stage {
            Stage::Calibrate => None,
            Stage::Align => Some(Stage::Calibrate),
            Stage::Subtract => Some(Stage::Align),
            Stage::Photometer => Some(Stage::Subtract),
            Stage::Detrend => Some(Stage::Photometer),
            Stage::Assemble if self.skip_detrend => Some(Stage::Photometer),
            Stage::Assemble => Some(Stage::Detrend),
        }
    }

    pub fn contains(&self, stage: Stage) -> bool {
        !(self.skip_detrend && stage == Stage::Detrend)
    }
}

/// How the convolved reference and the frame are differenced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubtractionMethod {
    /// Frame minus convolved reference.
    #[default]
    Normal,
    /// Convolved frame subtracted from the reference.
    Reverse,
}

impl SubtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Reverse => "reverse",
        }
    }

    /// File-name prefix of subtracted frames.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Normal => "nsub",
            Self::Reverse => "rsub",
        }
    }
}

impl fmt::Display for SubtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtractionMethod {
    type Err = SubphotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "reverse" => Ok(Self::Reverse),
            other => Err(SubphotError::InvalidConfig(format!(
                "unknown subtraction method '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_graph_walks_every_stage() {
        let graph = StageGraph::default();
        assert_eq!(graph.sequence(), Stage::ALL.to_vec());
        assert_eq!(graph.prerequisite(Stage::Assemble), Some(Stage::Detrend));
        assert_eq!(graph.prerequisite(Stage::Calibrate), None);
    }

    #[test]
    fn skipping_detrend_rewires_assembly() {
        let graph = StageGraph::new(true);
        assert!(!graph.sequence().contains(&Stage::Detrend));
        assert_eq!(graph.prerequisite(Stage::Assemble), Some(Stage::Photometer));
        assert_eq!(
            graph.sequence().last().and_then(|s| graph.prerequisite(*s)),
            Some(Stage::Photometer)
        );
    }

    #[test]
    fn stage_names_parse() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("stack".parse::<Stage>().is_err());
    }
}
