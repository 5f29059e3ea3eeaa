use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubphotError};

/// Optional behaviours of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Toggle {
    /// Convert inputs to the format the processing tools expect.
    ConvertFormat,
    /// Run source extraction on calibrated frames.
    ExtractSources,
    /// Produce binned light curves at assembly.
    BinLightcurves,
    /// Render translated (aligned/subtracted) previews.
    TranslateImages,
    /// Subtract the frame from the convolved reference instead of the reverse.
    ReverseSubtract,
    /// Bypass the detrending stage.
    SkipDetrend,
}

impl Toggle {
    pub const ALL: [Toggle; 6] = [
        Toggle::ConvertFormat,
        Toggle::ExtractSources,
        Toggle::BinLightcurves,
        Toggle::TranslateImages,
        Toggle::ReverseSubtract,
        Toggle::SkipDetrend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConvertFormat => "convert-format",
            Self::ExtractSources => "extract-sources",
            Self::BinLightcurves => "bin-lightcurves",
            Self::TranslateImages => "translate-images",
            Self::ReverseSubtract => "reverse-subtract",
            Self::SkipDetrend => "skip-detrend",
        }
    }

    /// Environment variable exported to external stage commands.
    pub fn env_var(&self) -> String {
        format!("SUBPHOT_{}", self.as_str().replace('-', "_").to_ascii_uppercase())
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Toggle {
    type Err = SubphotError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Toggle::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| SubphotError::InvalidConfig(format!("unknown toggle '{s}'")))
    }
}

/// Set of enabled toggles.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToggleSet(BTreeSet<Toggle>);

impl ToggleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, toggle: Toggle) {
        self.0.insert(toggle);
    }

    pub fn with(mut self, toggle: Toggle) -> Self {
        self.enable(toggle);
        self
    }

    pub fn is_enabled(&self, toggle: Toggle) -> bool {
        self.0.contains(&toggle)
    }

    pub fn iter(&self) -> impl Iterator<Item = Toggle> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a comma-separated toggle list, e.g. `reverse-subtract,skip-detrend`.
    pub fn parse_list(list: &str) -> Result<Self> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Toggle::from_str)
            .collect()
    }
}

impl FromIterator<Toggle> for ToggleSet {
    fn from_iter<I: IntoIterator<Item = Toggle>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ToggleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.0.iter().map(Toggle::as_str).collect();
        f.write_str(&names.join(", "))
    }
}
